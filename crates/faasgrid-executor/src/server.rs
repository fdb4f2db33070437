//! Worker-local endpoint: `POST /` runs the function, every other path is 404.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::handler::{CallContext, FunctionHandler};

#[derive(Clone)]
pub struct ExecutorState {
    pub handler: FunctionHandler,
    pub instance_id: String,
}

pub fn build_router(state: ExecutorState) -> Router {
    Router::new()
        .route("/", post(execute))
        .fallback(not_found)
        .with_state(state)
}

/// POST /
async fn execute(
    State(state): State<ExecutorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let context = CallContext {
        request_id: headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        instance_id: state.instance_id.clone(),
    };
    debug!(request_id = ?context.request_id, len = body.len(), "executing");

    match state.handler.invoke(&body, &context).await {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            output,
        )
            .into_response(),
        Err(e) => {
            warn!(
                request_id = ?context.request_id,
                error_kind = e.kind(),
                error = %e,
                "function execution failed"
            );
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, axum::Json(e.to_body())).into_response()
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "error": "Not found" })),
    )
}

/// Bind all interfaces on `port`; 0 picks an ephemeral port.
pub async fn bind(port: u16) -> ExecutorResult<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| ExecutorError::Bind {
            address: addr.to_string(),
            reason: e.to_string(),
        })
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: ExecutorState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, instance_id = %state.instance_id, "executor listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
