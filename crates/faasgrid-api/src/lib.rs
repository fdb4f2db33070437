//! faasgrid-api: HTTP surface of the faasgrid control plane.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/invoke/{function_name}` | Invoke a function (body passed through) |
//! | POST | `/runtime/heartbeat` | Worker self-registration and liveness |
//! | POST | `/runtime/instance_ready` | Executor readiness callback |
//! | POST | `/runtime/drain` | Stop placing on a worker |
//! | GET | `/api/v1/workers` | List workers |
//! | GET | `/api/v1/functions/{name}/instances` | Instances of a function |
//! | GET | `/api/v1/functions/{name}/invocations` | Recent invocation records |
//! | GET | `/api/v1/invocations/{request_id}` | Invocation record by request ID |
//! | GET | `/healthz` | Liveness check |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use faasgrid_dispatch::Dispatcher;
use faasgrid_scheduler::{ColdStartScheduler, WorkerRegistry};
use faasgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub workers: WorkerRegistry,
    pub scheduler: Arc<ColdStartScheduler>,
    pub dispatcher: Arc<Dispatcher>,
}

impl ApiState {
    pub fn new(
        store: StateStore,
        scheduler: Arc<ColdStartScheduler>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            workers: WorkerRegistry::new(store.clone()),
            store,
            scheduler,
            dispatcher,
        }
    }
}

/// Build the complete control-plane router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/workers", get(handlers::list_workers))
        .route("/functions/{name}/instances", get(handlers::list_instances))
        .route("/functions/{name}/invocations", get(handlers::list_invocations))
        .route("/invocations/{request_id}", get(handlers::get_invocation))
        .with_state(state.clone());

    let runtime_routes = Router::new()
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/instance_ready", post(handlers::instance_ready))
        .route("/drain", post(handlers::drain))
        .with_state(state.clone());

    Router::new()
        .route("/invoke/{function_name}", post(handlers::invoke).with_state(state))
        .nest("/runtime", runtime_routes)
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
