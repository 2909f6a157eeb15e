//! Mesh error types

use thiserror::Error;

/// Errors that can occur while coordinating sessions
///
/// Lookup misses are not errors: they surface as `None` or empty results.
/// A reply that never arrives is not an error either, see
/// [`InterSessionMessage::delivered`](crate::messaging::InterSessionMessage).
#[derive(Error, Debug)]
pub enum MeshError {
    /// The durable medium failed (disk full, permission denied, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted record could not be decoded
    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// A key or key segment that cannot be stored safely
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A status that cannot be persisted
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshError {
    /// Create a corrupt record error
    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        MeshError::CorruptRecord {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Check whether this error means the storage medium itself is broken
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, MeshError::Io(_))
    }
}

/// Result type alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;
