//! Core type definitions for Folio.
//!
//! This crate defines the fundamental, host-agnostic types shared by the
//! storage layer and the plugin host:
//! - The plugin descriptor (the static contract an extension declares)
//! - The plugin-type enum
//! - The persisted plugin-code record
//!
//! Validation of untrusted descriptors lives in the plugin host; this crate
//! only carries the accepted shapes.

mod descriptor;
mod record;

pub use descriptor::{PluginDescriptor, PluginType};
pub use record::PluginCodeRecord;
