//! Management surface called by the control plane's launcher.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::warn;

use faasgrid_scheduler::LaunchRequest;

use crate::error::AgentError;
use crate::supervisor::Supervisor;

pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/instances", post(launch).get(list))
        .route("/instances/{id}", delete(stop))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(supervisor)
}

fn error_response(e: &AgentError) -> Response {
    let status = match e {
        AgentError::InsufficientMemory { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AgentError::AlreadyRunning(_) => StatusCode::CONFLICT,
        AgentError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        AgentError::InvalidCode(_) => StatusCode::BAD_REQUEST,
        AgentError::Io(_) | AgentError::Spawn(_) | AgentError::ControlPlane(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

/// POST /instances
async fn launch(
    State(supervisor): State<Arc<Supervisor>>,
    payload: Result<Json<LaunchRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };
    match supervisor.launch(&request).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "instance_id": request.instance_id,
                "status": "launching",
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(instance_id = %request.instance_id, error = %e, "launch refused");
            error_response(&e)
        }
    }
}

/// DELETE /instances/{id}
async fn stop(State(supervisor): State<Arc<Supervisor>>, Path(id): Path<String>) -> Response {
    match supervisor.stop(&id).await {
        Ok(()) => Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /instances
async fn list(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(supervisor.list().await)
}

#[cfg(all(test, unix))]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::supervisor::SupervisorConfig;
    use crate::test_support::{fake_executor, launch_request};

    fn app(dir: &tempfile::TempDir) -> (Router, Arc<Supervisor>) {
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            executor_bin: fake_executor(dir.path(), "exec sleep 30"),
            work_dir: dir.path().join("instances"),
            max_memory_mb: 128,
        }));
        (build_router(supervisor.clone()), supervisor)
    }

    fn launch_req(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/instances")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn launch_is_accepted_then_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (app, supervisor) = app(&dir);

        let body = serde_json::to_string(&launch_request("i-1", 64)).unwrap();
        let resp = app.clone().oneshot(launch_req(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(supervisor.available_memory_mb().await, 64);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/instances").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed[0]["instance_id"], "i-1");

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/instances/i-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(supervisor.available_memory_mb().await, 128);
    }

    #[tokio::test]
    async fn launch_without_memory_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let (app, supervisor) = app(&dir);
        let body = serde_json::to_string(&launch_request("i-1", 256)).unwrap();
        let resp = app.oneshot(launch_req(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_launch_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir);
        let resp = app
            .oneshot(launch_req(r#"{"instance_id":"i-1"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stopping_unknown_instance_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/instances/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
