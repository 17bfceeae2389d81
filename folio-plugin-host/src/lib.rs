//! Sandboxed JavaScript plugin host for Folio.
//!
//! Ingests untrusted plugin scripts, statically validates and rewrites
//! them, runs each one in a capability-restricted interpreter on its own
//! worker thread, and registers the survivors in an in-memory registry
//! backed by persisted code records and per-plugin quota-bounded stores.
//!
//! The pipeline is defense in depth: source that skips the static pass
//! still hits the runtime scope wall, and everything a plugin can observe
//! or touch flows through the host capability surface.

mod error;
mod host_impl;
mod loader;
mod registry;
mod sandbox;
mod schema;
mod settings;
mod validate;

pub use error::{HostResult, PluginHostError};
pub use host_impl::ProxyBinding;
pub use loader::{LoadOutcome, load_all};
pub use registry::{ImportInput, ImportOptions, PendingPlugin, PluginRegistry, TypeFilter};
pub use sandbox::{PluginInstance, SandboxLaunch};
pub use schema::{is_plugin, validate_export};
pub use settings::{ProxyConfig, Settings, StaticSettings};
pub use validate::{PreparedSource, prepare};
