//! Persistence seams for Folio.
//!
//! Two independent concerns live here:
//!
//! - [`PluginCodeStore`]: the collaborator interface through which the plugin
//!   registry persists plugin source records. The host core owns only the
//!   trait; [`MemoryCodeStore`] is the in-process reference implementation.
//! - [`PluginStore`] / [`StoreManager`]: the quota-bounded per-plugin
//!   key/value store handed to plugin instances as a capability.

mod code_store;
mod error;
mod plugin_store;

pub use code_store::{MemoryCodeStore, PluginCodeStore};
pub use error::{StorageError, StorageResult};
pub use plugin_store::{PluginStore, StoreManager, DEFAULT_STORE_BUDGET};
