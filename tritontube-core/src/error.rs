use std::collections::BTreeMap;

use thiserror::Error;

/// Result type alias for TritonTube operations.
pub type Result<T> = std::result::Result<T, TritonError>;

/// Primary error type for the placement and replication core.
#[derive(Error, Debug)]
pub enum TritonError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version mismatch for {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        key: String,
        expected: i64,
        actual: i64,
    },

    #[error("revision conflict for {0}")]
    RevisionConflict(String),

    #[error("serialization failure")]
    Serialization,

    #[error("transport error for {target}: {message}")]
    Transport { target: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("replica set missing primary {0}")]
    ReplicaSetMissingPrimary(String),

    #[error("replication failed for {} replicas", .failures.len())]
    ReplicationFailed { failures: BTreeMap<String, String> },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TritonError {
    fn from(error: serde_json::Error) -> Self {
        TritonError::Internal(format!("json encoding failed: {}", error))
    }
}

impl TritonError {
    /// Whether the metadata retry loop may re-run the enclosing transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TritonError::Serialization)
    }
}
