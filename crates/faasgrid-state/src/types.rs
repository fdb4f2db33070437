//! Domain types for the faasgrid state store.
//!
//! These types represent the catalog (functions and their deployments),
//! the worker and instance registries, and the invocation log. All types
//! are serializable to/from JSON for storage in redb tables. Timestamps
//! are Unix epoch milliseconds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique function name.
pub type FunctionName = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a worker host.
pub type WorkerId = String;

/// Unique identifier for an execution instance.
pub type InstanceId = String;

// ── Catalog ───────────────────────────────────────────────────────

/// A named unit of user logic with its resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Function {
    pub id: String,
    pub name: FunctionName,
    #[serde(default)]
    pub description: String,
    /// Name of the exported handler (e.g. "handle").
    pub entry_point: String,
    pub memory_mb: u32,
    pub timeout_seconds: u32,
    pub is_active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Immutable snapshot of a function's code and configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub function_name: FunctionName,
    /// Monotonically increasing per function.
    pub version: u32,
    #[serde(default)]
    pub comment: String,
    /// The code unit (a WebAssembly module, binary or text).
    pub code_snapshot: Vec<u8>,
    #[serde(default)]
    pub requirements_snapshot: String,
    pub entry_point_snapshot: String,
    pub is_active: bool,
    pub created_at: u64,
}

/// A function together with its currently active deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDeployment {
    pub function: Function,
    pub deployment: Deployment,
}

// ── Workers ───────────────────────────────────────────────────────

/// Liveness state of a worker host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Online,
    Offline,
    Draining,
}

/// A machine capable of running instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHost {
    pub id: WorkerId,
    pub hostname: String,
    pub ip_address: String,
    /// Port of the worker agent's management surface.
    pub agent_port: u16,
    pub status: WorkerStatus,
    pub max_memory_mb: u32,
    pub available_memory_mb: u32,
    pub last_heartbeat: u64,
}

impl WorkerHost {
    /// Base URL of the worker agent.
    pub fn agent_url(&self) -> String {
        format!("http://{}:{}", self.ip_address, self.agent_port)
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// Lifecycle status of an execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Allocated, executor not yet ready.
    Pending,
    Running,
    /// Running but not accessed recently.
    Idle,
    Error,
}

impl InstanceStatus {
    /// Whether an instance in this status can serve invocations.
    pub fn is_warm(self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Idle)
    }
}

/// One running execution unit of one deployment on one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub deployment_id: DeploymentId,
    pub function_name: FunctionName,
    pub worker_id: WorkerId,
    /// Bound by the readiness signal; `None` while pending.
    pub port: Option<u16>,
    pub status: InstanceStatus,
    /// Memory reserved on the worker for this instance.
    pub memory_mb: u32,
    pub started_at: u64,
    pub last_accessed: u64,
    /// Time of the last status change.
    pub updated_at: u64,
}

impl Instance {
    /// `ip:port` of the executor, once the instance is bound to a port.
    pub fn address_on(&self, worker: &WorkerHost) -> Option<String> {
        self.port.map(|port| format!("{}:{port}", worker.ip_address))
    }
}

/// An instance paired with the worker it is placed on.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedInstance {
    pub instance: Instance,
    pub worker: WorkerHost,
}

/// A leased instance together with the address it is reachable on.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEndpoint {
    pub instance: Instance,
    pub address: String,
}

impl InstanceEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}/", self.address)
    }
}

// ── Invocations ───────────────────────────────────────────────────

/// Terminal outcome of an invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Success,
    Failure,
    Timeout,
}

/// Durable record of one dispatch attempt.
///
/// Written once when the invocation opens and finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRecord {
    pub id: String,
    pub request_id: String,
    pub function_name: FunctionName,
    pub deployment_id: DeploymentId,
    pub instance_id: Option<InstanceId>,
    pub request_body: String,
    pub request_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub response_status_code: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub is_cold_start: bool,
    pub status: Option<InvocationStatus>,
    /// Error class from the dispatch taxonomy, if the attempt failed.
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: String,
}

impl InvocationRecord {
    /// Whether the terminal fields have been written.
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    /// Wall-clock duration in milliseconds, once finalized.
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }
}

impl Deployment {
    /// Build the key for the deployments table.
    pub fn table_key(&self) -> String {
        deployment_key(&self.function_name, self.version)
    }
}

/// Deployments are keyed `{function}/{version}` with a zero-padded version
/// so a prefix scan returns them in version order.
pub fn deployment_key(function_name: &str, version: u32) -> String {
    format!("{function_name}/{version:010}")
}
