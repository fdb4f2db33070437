//! Dispatch error taxonomy and its HTTP mapping.

use std::time::Duration;

use thiserror::Error;

use faasgrid_scheduler::ProvisionError;

/// Why an invocation did not produce an instance response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("function {0} has no active deployment")]
    NoActiveDeployment(String),

    #[error("{0}")]
    NoCapacity(String),

    #[error("{0}")]
    ColdStartTimeout(String),

    #[error("instance unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("invocation exceeded {0:?}")]
    InvocationTimeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// HTTP status returned to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::FunctionNotFound(_) | DispatchError::NoActiveDeployment(_) => 404,
            DispatchError::NoCapacity(_)
            | DispatchError::ColdStartTimeout(_)
            | DispatchError::WorkerUnreachable(_) => 503,
            DispatchError::InvocationTimeout(_) => 504,
            DispatchError::Internal(_) => 500,
        }
    }

    /// Error class stored on the invocation record and sent to the caller.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::FunctionNotFound(_) => "FunctionNotFound",
            DispatchError::NoActiveDeployment(_) => "NoActiveDeployment",
            DispatchError::NoCapacity(_) => "NoCapacity",
            DispatchError::ColdStartTimeout(_) => "ColdStartTimeout",
            DispatchError::WorkerUnreachable(_) => "WorkerUnreachable",
            DispatchError::InvocationTimeout(_) => "InvocationTimeout",
            DispatchError::Internal(_) => "Internal",
        }
    }

    /// `{"error": kind, "message": text}`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}

impl From<ProvisionError> for DispatchError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::NoCapacity { .. } => DispatchError::NoCapacity(e.to_string()),
            ProvisionError::ColdStartTimeout { .. } => {
                DispatchError::ColdStartTimeout(e.to_string())
            }
            ProvisionError::LaunchFailed { .. } => DispatchError::WorkerUnreachable(e.to_string()),
            ProvisionError::Internal(msg) => DispatchError::Internal(msg),
        }
    }
}
