//! Persisted plugin-code records.

use serde::{Deserialize, Serialize};

/// The durable form of a plugin: what the registry reads at startup and
/// writes after every accept/enable/disable/delete.
///
/// `source` holds the *rewritten* (validated and minified) script text, not
/// the original upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCodeRecord {
    pub id: String,
    pub source: String,
    pub enabled: bool,
}

impl PluginCodeRecord {
    pub fn new(id: impl Into<String>, source: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            enabled,
        }
    }
}
