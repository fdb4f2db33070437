//! HTTP handlers.
//!
//! `/invoke` passes the instance's response through untouched. `/runtime/*`
//! speaks the worker/executor wire contract; `/api/v1/*` wraps results in
//! [`ApiResponse`].

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, error, warn};

use faasgrid_dispatch::InvocationRequest;
use faasgrid_scheduler::{HeartbeatReport, SchedulerError};
use faasgrid_state::ReadyOutcome;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// `{"error": kind, "message": text}` for the runtime surface.
fn runtime_error(kind: &str, message: &str, status: StatusCode) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": kind, "message": message })),
    )
        .into_response()
}

fn registry_error(e: SchedulerError) -> Response {
    match e {
        SchedulerError::InvalidRegistration(_)
        | SchedulerError::UnknownInstance(_)
        | SchedulerError::UnknownWorker(_) => {
            runtime_error("InvalidRegistration", &e.to_string(), StatusCode::BAD_REQUEST)
        }
        SchedulerError::State(_) => {
            error!(error = %e, "registry write failed");
            runtime_error("Internal", &e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn bad_payload(rejection: JsonRejection) -> Response {
    debug!(error = %rejection.body_text(), "rejected runtime payload");
    runtime_error(
        "InvalidRegistration",
        &rejection.body_text(),
        StatusCode::BAD_REQUEST,
    )
}

// ── Invoke ─────────────────────────────────────────────────────

/// POST /invoke/{function_name}
pub async fn invoke(
    State(state): State<ApiState>,
    Path(function_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let captured = headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();

    let outcome = state
        .dispatcher
        .invoke(InvocationRequest {
            function_name,
            request_id,
            body,
            headers: captured,
        })
        .await;

    let status = StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, outcome.body).into_response();
    let out = response.headers_mut();
    if let Some(ct) = outcome
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        out.insert(header::CONTENT_TYPE, ct);
    }
    if let Ok(id) = HeaderValue::from_str(&outcome.request_id) {
        out.insert("x-request-id", id);
    }
    response
}

// ── Runtime callbacks ──────────────────────────────────────────

/// POST /runtime/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    payload: Result<Json<HeartbeatReport>, JsonRejection>,
) -> Response {
    let Json(report) = match payload {
        Ok(p) => p,
        Err(rejection) => return bad_payload(rejection),
    };
    match state.workers.report_heartbeat(&report) {
        Ok(worker) => Json(serde_json::json!({ "worker_id": worker.id })).into_response(),
        Err(e) => registry_error(e),
    }
}

/// Readiness signal from an instance executor.
#[derive(Debug, Deserialize)]
pub struct ReadyPayload {
    pub instance_id: String,
    pub port: u16,
}

/// POST /runtime/instance_ready
pub async fn instance_ready(
    State(state): State<ApiState>,
    payload: Result<Json<ReadyPayload>, JsonRejection>,
) -> Response {
    let Json(ready) = match payload {
        Ok(p) => p,
        Err(rejection) => return bad_payload(rejection),
    };
    match state.scheduler.signal_ready(&ready.instance_id, ready.port).await {
        Ok(ReadyOutcome::Registered(_)) => {
            Json(serde_json::json!({ "status": "registered" })).into_response()
        }
        Ok(ReadyOutcome::Ignored(instance)) => Json(serde_json::json!({
            "status": "ignored",
            "instance_status": instance.status,
        }))
        .into_response(),
        Err(e) => {
            warn!(instance_id = %ready.instance_id, error = %e, "readiness signal rejected");
            registry_error(e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DrainPayload {
    pub worker_id: String,
}

/// POST /runtime/drain
pub async fn drain(
    State(state): State<ApiState>,
    payload: Result<Json<DrainPayload>, JsonRejection>,
) -> Response {
    let Json(drain) = match payload {
        Ok(p) => p,
        Err(rejection) => return bad_payload(rejection),
    };
    match state.workers.drain(&drain.worker_id) {
        Ok(_) => Json(serde_json::json!({ "status": "draining" })).into_response(),
        Err(e) => registry_error(e),
    }
}

// ── Inspection ─────────────────────────────────────────────────

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_workers() {
        Ok(workers) => ApiResponse::ok(workers).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/functions/{name}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.list_instances_for_function(&name) {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct InvocationQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/functions/{name}/invocations
pub async fn list_invocations(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<InvocationQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.list_invocations_for_function(&name, limit) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/invocations/{request_id}
pub async fn get_invocation(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    match state.store.find_invocation_by_request_id(&request_id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("invocation not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}
