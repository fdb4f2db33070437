use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("insufficient memory: requested {requested_mb} MB, {available_mb} MB available")]
    InsufficientMemory { requested_mb: u32, available_mb: u32 },

    #[error("instance already running: {0}")]
    AlreadyRunning(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("invalid code snapshot: {0}")]
    InvalidCode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn executor: {0}")]
    Spawn(String),

    #[error("control plane call failed: {0}")]
    ControlPlane(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
