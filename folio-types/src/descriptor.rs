//! Plugin descriptor types.

use serde::{Deserialize, Serialize};

/// The kind of content a plugin provides.
///
/// Wire values match the `PLUGIN_TYPE` constants exposed to plugin scripts
/// (`SOURCE` = 1, `STORE` = 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginType {
    /// A content source: searchable, with detail pages and chapter text.
    Source,
    /// Reserved. The STORE contract is declared but not yet defined.
    Store,
}

impl PluginType {
    /// Maps the numeric `TYPE` value declared by a plugin script.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Source),
            2 => Some(Self::Store),
            _ => None,
        }
    }

    /// The numeric value exposed to scripts as `PLUGIN_TYPE.*`.
    pub fn code(self) -> i64 {
        match self {
            Self::Source => 1,
            Self::Store => 2,
        }
    }
}

/// The static metadata a plugin declares, immutable once accepted.
///
/// String fields are stored trimmed. Bounds (enforced by the plugin host's
/// schema validator, boundary-inclusive):
/// - `id`: 16–32 chars of `[A-Za-z0-9_-]`
/// - `group`, `name`: 1–15 chars
/// - `version`: 1–8 chars (display only; ordering uses `version_code`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Globally unique plugin id.
    pub id: String,
    pub plugin_type: PluginType,
    /// Display group used for filtering (e.g. a language or category tag).
    pub group: String,
    pub name: String,
    /// Display version string.
    pub version: String,
    /// Monotonic version used for upgrade comparisons.
    pub version_code: i64,
    /// Empty, or an http(s) URL ending in `.js` where updates are fetched.
    pub plugin_file_url: String,
    /// Non-empty http(s) URL naming the source's request origin.
    pub base_url: String,
}
