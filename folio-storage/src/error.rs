//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A write would push a plugin store past its byte budget.
    #[error("store quota exceeded: {attempted} bytes would exceed the {budget}-byte budget")]
    QuotaExceeded { budget: usize, attempted: usize },

    /// IO error (file-backed implementations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}
