//! faasgrid-executor: runs one instance of one deployment.
//!
//! Startup is all-or-nothing: the module is compiled, its exports checked
//! and a trial instance created before the port is bound. Only then is
//! readiness reported, so the control plane never sees an instance that
//! cannot serve.
//!
//! ```text
//! load ──► bind ──► serve POST / ──► INSTANCE_READY ──► /runtime/instance_ready
//! ```

pub mod error;
pub mod handler;
pub mod limiter;
pub mod notify;
pub mod server;

use std::future::Future;

use tracing::info;

use faasgrid_core::config::ExecutorConfig;

pub use error::{ExecutorError, ExecutorResult, HandlerError, HandlerResult};
pub use handler::{CallContext, FunctionHandler};
pub use server::ExecutorState;

/// Load, bind, report readiness and serve until `shutdown` resolves.
pub async fn run(
    config: ExecutorConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ExecutorResult<()> {
    let handler = FunctionHandler::load(&config)?;
    let listener = server::bind(config.port).await?;
    let port = listener
        .local_addr()
        .map_err(|e| ExecutorError::Bind {
            address: format!("0.0.0.0:{}", config.port),
            reason: e.to_string(),
        })?
        .port();

    let state = ExecutorState {
        handler,
        instance_id: config.instance_id.clone(),
    };
    let server = tokio::spawn(server::serve(listener, state, shutdown));

    info!(instance_id = %config.instance_id, port, "INSTANCE_READY");
    if let Some(url) = &config.control_plane_url {
        if let Err(e) = notify::notify_ready(url, &config.instance_id, port).await {
            server.abort();
            return Err(e);
        }
    }

    match server.await {
        Ok(Ok(())) => {
            info!(instance_id = %config.instance_id, "executor stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(ExecutorError::Serve(e.to_string())),
        Err(e) => Err(ExecutorError::Serve(e.to_string())),
    }
}
