//! Scheduler error types.

use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("state store error: {0}")]
    State(#[from] faasgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why a cold start did not produce an instance.
///
/// `Clone` so one coalesced outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProvisionError {
    #[error("no online worker has {memory_mb} MB available")]
    NoCapacity { memory_mb: u32 },

    #[error("instance {instance_id} not ready after {waited_ms} ms")]
    ColdStartTimeout { instance_id: String, waited_ms: u64 },

    #[error("worker {worker_id} did not accept launch: {reason}")]
    LaunchFailed { worker_id: String, reason: String },

    #[error("provisioning failed: {0}")]
    Internal(String),
}

impl From<faasgrid_state::StateError> for ProvisionError {
    fn from(e: faasgrid_state::StateError) -> Self {
        ProvisionError::Internal(e.to_string())
    }
}
