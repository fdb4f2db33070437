//! Store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// A redb call failed. `op` names the stage (open, txn, table, read, write).
    #[error("redb {op} failed: {reason}")]
    Storage { op: &'static str, reason: String },

    /// A stored row or an incoming record could not be (de)serialized.
    #[error("bad record encoding: {0}")]
    Codec(String),

    /// A record was rejected before touching the database.
    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The write would break a uniqueness or write-once rule.
    #[error("conflict: {0}")]
    Conflict(String),
}
