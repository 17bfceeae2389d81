//! Error types for the plugin host.

use folio_storage::StorageError;
use thiserror::Error;

/// Result type for plugin-host operations.
pub type HostResult<T> = Result<T, PluginHostError>;

#[derive(Debug, Error)]
pub enum PluginHostError {
    /// Schema or static-code violation; the message names the exact field or
    /// construct that failed. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Sandbox access denial, fatal to the offending script.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Duplicate plugin id without `force`.
    #[error("plugin conflict: {0}")]
    Conflict(String),

    /// Missing file, registry entry, or persisted record.
    #[error("not found: {0}")]
    NotFound(String),

    /// A plugin requested the proxy but the settings collaborator reports it
    /// disabled or unconfigured.
    #[error("proxy requested but not enabled in settings")]
    ProxyNotEnabled,

    /// The plugin script threw or could not be evaluated.
    #[error("plugin script failed: {0}")]
    Execution(String),

    /// The script ran to completion without assigning `plugin.exports`.
    #[error("no plugin found in script")]
    NoExport,

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
