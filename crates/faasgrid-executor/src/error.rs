//! Executor error types.
//!
//! [`ExecutorError`] covers startup: any of these ends the process with a
//! non-zero exit. [`HandlerError`] covers a single call and never takes the
//! process down.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("code file not found: {0}")]
    MissingCode(PathBuf),

    #[error("failed to compile module: {0}")]
    Compile(String),

    #[error("module does not export `{name}` with the expected signature: {reason}")]
    MissingExport { name: String, reason: String },

    #[error("module failed to instantiate: {0}")]
    Instantiate(String),

    #[error("engine setup failed: {0}")]
    Engine(String),

    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("readiness signal failed: {0}")]
    Readiness(String),

    #[error("server error: {0}")]
    Serve(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Failure of one call, rendered as the failure body.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("handler trapped: {0}")]
    Trap(String),

    #[error("handler exceeded its time limit of {0}s")]
    Timeout(u32),

    #[error("handler exceeded its memory limit of {0} MB")]
    ResourceLimit(u32),

    #[error("handler returned unusable output: {0}")]
    InvalidOutput(String),

    #[error("internal executor error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Stable `error_kind` string.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Trap(_) => "trap",
            HandlerError::Timeout(_) => "timeout",
            HandlerError::ResourceLimit(_) => "resource_limit",
            HandlerError::InvalidOutput(_) => "invalid_output",
            HandlerError::Internal(_) => "internal",
        }
    }

    /// HTTP status of a failed call. A call cut off at its time limit is a
    /// gateway timeout; everything else is a 500.
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// `{"error", "message", "error_kind"}` body of a failed call.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "Function execution failed",
            "message": self.to_string(),
            "error_kind": self.kind(),
        })
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_body_carries_kind() {
        let body = HandlerError::Timeout(3).to_body();
        assert_eq!(body["error"], "Function execution failed");
        assert_eq!(body["error_kind"], "timeout");
        assert!(body["message"].as_str().unwrap().contains("3s"));
    }

    #[test]
    fn only_timeouts_are_gateway_timeouts() {
        assert_eq!(HandlerError::Timeout(1).status_code(), 504);
        assert_eq!(HandlerError::Trap("boom".into()).status_code(), 500);
        assert_eq!(HandlerError::ResourceLimit(16).status_code(), 500);
    }
}
