//! faasgrid-executor binary. Launched by the worker agent, one process per
//! instance.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use faasgrid_core::config::ExecutorConfig;

#[derive(Parser)]
#[command(name = "faasgrid-executor", about = "faasgrid instance executor")]
struct Args {
    /// Path to the deployment's module (binary or text).
    #[arg(long, env = "FAASGRID_CODE_PATH")]
    code_path: PathBuf,

    /// Exported function to call.
    #[arg(long, env = "FAASGRID_ENTRY_POINT", default_value = "handle")]
    entry_point: String,

    /// Listen port; 0 picks an ephemeral one.
    #[arg(long, env = "FAASGRID_PORT", default_value_t = 0)]
    port: u16,

    #[arg(long, env = "FAASGRID_INSTANCE_ID")]
    instance_id: String,

    /// Where to report readiness. Without it readiness is only logged.
    #[arg(long, env = "FAASGRID_CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,

    #[arg(long, env = "FAASGRID_MEMORY_MB", default_value_t = 128)]
    memory_mb: u32,

    #[arg(long, env = "FAASGRID_TIMEOUT_SECONDS", default_value_t = 30)]
    timeout_seconds: u32,
}

impl From<Args> for ExecutorConfig {
    fn from(args: Args) -> Self {
        ExecutorConfig {
            code_path: args.code_path,
            entry_point: args.entry_point,
            port: args.port,
            instance_id: args.instance_id,
            control_plane_url: args.control_plane_url,
            memory_mb: args.memory_mb,
            timeout_seconds: args.timeout_seconds,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,faasgrid_executor=debug")),
        )
        .init();

    let config = ExecutorConfig::from(Args::parse());
    match faasgrid_executor::run(config, shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "executor failed");
            ExitCode::from(1)
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
