//! Invocation dispatcher: the entry point for every function call.
//!
//! ```text
//! invoke(function_name, request_id, body, headers)
//!   ├── resolve function → active deployment      (404, no record)
//!   ├── open InvocationRecord
//!   ├── lease warm instance ── miss ──► cold start (is_cold_start = true)
//!   ├── forward with deadline = timeout_seconds + proxy_buffer
//!   │     ├── deadline exceeded → TIMEOUT, 504, instance untouched
//!   │     ├── unreachable       → FAILURE, 503, instance → ERROR
//!   │     ├── transport failure → FAILURE, 500
//!   │     └── response          → SUCCESS if 2xx else FAILURE, passed through
//!   └── finalize record (exactly once, also on cancellation)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use faasgrid_core::epoch_millis;
use faasgrid_scheduler::{ColdStartScheduler, InstanceRegistry};
use faasgrid_state::{
    ActiveDeployment, InstanceEndpoint, InvocationRecord, InvocationStatus, StateStore,
};

use crate::error::DispatchError;
use crate::proxy::{InstanceProxy, ProxyError, ProxyRequest, ProxyResponse};

/// Default slack added to a function's timeout for the proxy deadline.
pub const DEFAULT_PROXY_BUFFER: Duration = Duration::from_secs(5);

/// An inbound invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub function_name: String,
    /// Taken from `X-Request-ID` when present.
    pub request_id: Option<String>,
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
}

/// What the caller gets back.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub status_code: u16,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub request_id: String,
    /// The finalized record; `None` when the function could not be resolved.
    pub record: Option<InvocationRecord>,
}

impl InvocationOutcome {
    fn from_error(request_id: String, error: &DispatchError, record: Option<InvocationRecord>) -> Self {
        Self {
            status_code: error.status_code(),
            body: Bytes::from(error.to_body().to_string()),
            content_type: Some("application/json".to_string()),
            request_id,
            record,
        }
    }
}

/// An opened invocation record that must be finalized.
///
/// Dropping it unfinalized (the request future was cancelled or panicked)
/// writes a FAILURE so no record is left open.
struct OpenInvocation {
    state: StateStore,
    record: InvocationRecord,
    finalized: bool,
}

impl OpenInvocation {
    fn open(state: &StateStore, record: InvocationRecord) -> Result<Self, DispatchError> {
        state
            .open_invocation(&record)
            .map_err(|e| DispatchError::Internal(format!("open invocation record: {e}")))?;
        Ok(Self {
            state: state.clone(),
            record,
            finalized: false,
        })
    }

    fn succeed(mut self, endpoint: &InstanceEndpoint, response: &ProxyResponse) -> InvocationRecord {
        let record = &mut self.record;
        record.instance_id = Some(endpoint.instance.id.clone());
        record.response_status_code = Some(response.status);
        record.response_body = Some(String::from_utf8_lossy(&response.body).into_owned());
        record.response_headers = response.headers.iter().cloned().collect();
        record.status = Some(match response.status {
            200..=299 => InvocationStatus::Success,
            // The executor cut the handler off at its time limit.
            504 => InvocationStatus::Timeout,
            _ => InvocationStatus::Failure,
        });
        if response.status == 504 {
            record.error_kind = Some("InvocationTimeout".to_string());
            record.error_message = "handler exceeded its time limit".to_string();
        }
        self.finish()
    }

    fn fail(mut self, error: &DispatchError) -> InvocationRecord {
        let record = &mut self.record;
        record.status = Some(match error {
            DispatchError::InvocationTimeout(_) => InvocationStatus::Timeout,
            _ => InvocationStatus::Failure,
        });
        record.response_status_code = Some(error.status_code());
        record.response_body = Some(error.to_body().to_string());
        record.error_kind = Some(error.kind().to_string());
        record.error_message = error.to_string();
        self.finish()
    }

    fn finish(mut self) -> InvocationRecord {
        self.record.end_time = Some(epoch_millis());
        self.persist();
        self.finalized = true;
        self.record.clone()
    }

    fn persist(&self) {
        if let Err(e) = self.state.finalize_invocation(&self.record) {
            error!(
                record_id = %self.record.id,
                request_id = %self.record.request_id,
                error = %e,
                "failed to finalize invocation record"
            );
        }
    }
}

impl Drop for OpenInvocation {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        warn!(request_id = %self.record.request_id, "invocation abandoned before completion");
        self.record.end_time = Some(epoch_millis());
        self.record.status = Some(InvocationStatus::Failure);
        self.record.error_kind = Some("Cancelled".to_string());
        self.record.error_message = "dispatch abandoned before completion".to_string();
        self.persist();
    }
}

/// Routes invocations to instances and records their outcome.
pub struct Dispatcher {
    state: StateStore,
    registry: InstanceRegistry,
    scheduler: Arc<ColdStartScheduler>,
    proxy: Arc<dyn InstanceProxy>,
    proxy_buffer: Duration,
}

impl Dispatcher {
    pub fn new(
        state: StateStore,
        scheduler: Arc<ColdStartScheduler>,
        proxy: Arc<dyn InstanceProxy>,
    ) -> Self {
        Self {
            registry: InstanceRegistry::new(state.clone()),
            state,
            scheduler,
            proxy,
            proxy_buffer: DEFAULT_PROXY_BUFFER,
        }
    }

    pub fn with_proxy_buffer(mut self, buffer: Duration) -> Self {
        self.proxy_buffer = buffer;
        self
    }

    /// Dispatch one invocation. Never fails: every error becomes an
    /// outcome with the mapped status code.
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationOutcome {
        let request_id = request
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let target = match self.resolve(&request.function_name) {
            Ok(target) => target,
            Err(e) => {
                debug!(function = %request.function_name, %request_id, error = %e, "unresolved invocation");
                return InvocationOutcome::from_error(request_id, &e, None);
            }
        };

        let record = InvocationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.clone(),
            function_name: target.function.name.clone(),
            deployment_id: target.deployment.id.clone(),
            instance_id: None,
            request_body: String::from_utf8_lossy(&request.body).into_owned(),
            request_headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            response_body: None,
            response_status_code: None,
            response_headers: BTreeMap::new(),
            start_time: epoch_millis(),
            end_time: None,
            is_cold_start: false,
            status: None,
            error_kind: None,
            error_message: String::new(),
        };
        let mut open = match OpenInvocation::open(&self.state, record) {
            Ok(open) => open,
            Err(e) => {
                error!(%request_id, error = %e, "cannot record invocation");
                return InvocationOutcome::from_error(request_id, &e, None);
            }
        };

        let endpoint = match self.acquire(&target, &mut open).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(function = %target.function.name, %request_id, error = %e, "no instance for invocation");
                let record = open.fail(&e);
                return InvocationOutcome::from_error(request_id, &e, Some(record));
            }
        };
        open.record.instance_id = Some(endpoint.instance.id.clone());

        let deadline =
            Duration::from_secs(u64::from(target.function.timeout_seconds)) + self.proxy_buffer;
        let forwarded = ProxyRequest {
            body: request.body,
            headers: with_request_id(request.headers, &request_id),
        };
        let result = tokio::time::timeout(
            deadline,
            self.proxy.forward(&endpoint.address, forwarded),
        )
        .await;

        let error = match result {
            Ok(Ok(response)) => {
                if let Err(e) = self.registry.touch(&endpoint.instance.id) {
                    warn!(instance_id = %endpoint.instance.id, error = %e, "touch failed");
                }
                let record = open.succeed(&endpoint, &response);
                debug!(
                    %request_id,
                    instance_id = %endpoint.instance.id,
                    status = response.status,
                    cold_start = record.is_cold_start,
                    duration_ms = record.duration_ms().unwrap_or_default(),
                    "invocation complete"
                );
                return InvocationOutcome {
                    status_code: response.status,
                    content_type: response.header("content-type").map(str::to_string),
                    body: response.body,
                    request_id,
                    record: Some(record),
                };
            }
            Err(_) => {
                warn!(%request_id, instance_id = %endpoint.instance.id, ?deadline, "invocation timed out");
                DispatchError::InvocationTimeout(deadline)
            }
            Ok(Err(ProxyError::Unreachable(reason))) => {
                info!(instance_id = %endpoint.instance.id, %reason, "instance unreachable, taking it out of rotation");
                if let Err(e) = self.registry.mark_error(&endpoint.instance.id) {
                    error!(instance_id = %endpoint.instance.id, error = %e, "failed to mark instance error");
                }
                DispatchError::WorkerUnreachable(reason)
            }
            Ok(Err(ProxyError::Transport(reason))) => {
                warn!(%request_id, instance_id = %endpoint.instance.id, %reason, "proxy failed");
                DispatchError::Internal(reason)
            }
        };
        let record = open.fail(&error);
        InvocationOutcome::from_error(request_id, &error, Some(record))
    }

    fn resolve(&self, function_name: &str) -> Result<ActiveDeployment, DispatchError> {
        let internal = |e: faasgrid_state::StateError| DispatchError::Internal(e.to_string());
        let function = self
            .state
            .get_function(function_name)
            .map_err(internal)?
            .filter(|f| f.is_active)
            .ok_or_else(|| DispatchError::FunctionNotFound(function_name.to_string()))?;
        let deployment = self
            .state
            .active_deployment(function_name)
            .map_err(internal)?
            .ok_or_else(|| DispatchError::NoActiveDeployment(function_name.to_string()))?;
        Ok(ActiveDeployment {
            function,
            deployment,
        })
    }

    /// Lease a warm instance, or cold start one.
    async fn acquire(
        &self,
        target: &ActiveDeployment,
        open: &mut OpenInvocation,
    ) -> Result<InstanceEndpoint, DispatchError> {
        let leased = self
            .registry
            .lease(&target.deployment.id)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        if let Some(endpoint) = leased {
            return Ok(endpoint);
        }
        open.record.is_cold_start = true;
        debug!(deployment_id = %target.deployment.id, "no warm instance, cold starting");
        Ok(self.scheduler.provision(target).await?)
    }
}

fn with_request_id(mut headers: Vec<(String, String)>, request_id: &str) -> Vec<(String, String)> {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case("x-request-id"));
    headers.push(("x-request-id".to_string(), request_id.to_string()));
    headers
}
