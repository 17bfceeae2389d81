//! In-memory plugin registry.
//!
//! The registry owns every live plugin instance and is the only writer to
//! the code store. Import is two-phase so that the expensive part (static
//! validation, script evaluation, descriptor checks) runs without touching
//! registry state, and the conflict check plus registration happen under
//! one lock; the bulk loader exploits this to validate in parallel and
//! register sequentially.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use folio_storage::{PluginCodeStore, StoreManager};
use folio_types::{PluginCodeRecord, PluginDescriptor, PluginType};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{HostResult, PluginHostError};
use crate::host_impl::ProxyBinding;
use crate::sandbox::{self, PluginInstance, SandboxLaunch};
use crate::settings::Settings;
use crate::validate;

/// Where an import's source text comes from.
#[derive(Debug, Clone)]
pub enum ImportInput {
    /// Literal script text.
    Code(String),
    /// A script file on disk.
    Path(PathBuf),
}

impl ImportInput {
    pub fn code(source: impl Into<String>) -> Self {
        Self::Code(source.into())
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    fn resolve(self) -> HostResult<String> {
        match self {
            Self::Code(source) => Ok(source),
            Self::Path(path) => {
                if !path.is_file() {
                    return Err(PluginHostError::NotFound(format!(
                        "plugin file '{}'",
                        path.display()
                    )));
                }
                Ok(std::fs::read_to_string(&path)?)
            }
        }
    }
}

/// Per-import knobs.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Run static validation and rewrite the source. Off only for trusted
    /// re-imports of already-rewritten code.
    pub minify: bool,
    /// Replace an existing registration with the same id.
    pub force: bool,
    /// Construct a live instance; a disabled import only registers and
    /// persists.
    pub enable: bool,
    /// Debug imports are never persisted.
    pub debug: bool,
    /// Route the plugin's HTTP through the configured proxy.
    pub use_proxy: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            minify: true,
            force: false,
            enable: true,
            debug: false,
            use_proxy: false,
        }
    }
}

/// Narrowing for [`PluginRegistry::plugins_by_type`]. The default matches
/// enabled plugins with a live instance, in any group.
#[derive(Debug, Clone)]
pub struct TypeFilter {
    pub enabled_only: bool,
    pub group: Option<String>,
}

impl Default for TypeFilter {
    fn default() -> Self {
        Self {
            enabled_only: true,
            group: None,
        }
    }
}

/// A validated import awaiting the registry's conflict check.
pub struct PendingPlugin {
    launch: SandboxLaunch,
    source: String,
    options: ImportOptions,
}

impl PendingPlugin {
    pub fn descriptor(&self) -> &PluginDescriptor {
        self.launch.descriptor()
    }
}

struct PluginRecord {
    descriptor: PluginDescriptor,
    source: String,
    enabled: bool,
    debug: bool,
    use_proxy: bool,
    instance: Option<PluginInstance>,
}

/// Registry of imported plugins, keyed by plugin id.
pub struct PluginRegistry {
    code_store: Arc<dyn PluginCodeStore>,
    stores: Arc<StoreManager>,
    settings: Arc<dyn Settings>,
    plugins: RwLock<HashMap<String, PluginRecord>>,
}

impl PluginRegistry {
    pub fn new(
        code_store: Arc<dyn PluginCodeStore>,
        stores: Arc<StoreManager>,
        settings: Arc<dyn Settings>,
    ) -> Self {
        Self {
            code_store,
            stores,
            settings,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn code_store(&self) -> &Arc<dyn PluginCodeStore> {
        &self.code_store
    }

    pub(crate) fn settings(&self) -> &Arc<dyn Settings> {
        &self.settings
    }

    /// One-shot import: validate, evaluate, conflict-check, register.
    pub fn import(
        &self,
        input: ImportInput,
        options: ImportOptions,
    ) -> HostResult<PluginDescriptor> {
        let pending = self.begin_import(input, options)?;
        self.finish_import(pending)
    }

    /// Phase one: source resolution, static validation and sandboxed
    /// evaluation. Touches no registry state, so any number of these can
    /// run concurrently.
    pub fn begin_import(
        &self,
        input: ImportInput,
        options: ImportOptions,
    ) -> HostResult<PendingPlugin> {
        let source = input.resolve()?;
        let prepared = validate::prepare(&source, options.minify)?;
        let binding = ProxyBinding::resolve(options.use_proxy, self.settings.as_ref());
        let launch = sandbox::launch(&prepared.text, self.stores.clone(), binding)?;
        Ok(PendingPlugin {
            launch,
            source: prepared.text,
            options,
        })
    }

    /// Phase two: conflict check, instance construction, persistence and
    /// registration, all under the registry lock.
    pub fn finish_import(&self, pending: PendingPlugin) -> HostResult<PluginDescriptor> {
        let descriptor = pending.launch.descriptor().clone();
        let id = descriptor.id.clone();
        let options = pending.options;

        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        if plugins.contains_key(&id) && !options.force {
            pending.launch.abort();
            return Err(PluginHostError::Conflict(format!(
                "plugin '{id}' is already registered"
            )));
        }
        // The old record is only displaced by the insert below, so a forced
        // re-import that fails to construct leaves it registered. The
        // plugin's store survives replacement because the id is unchanged.
        let instance = if options.enable {
            Some(pending.launch.proceed()?)
        } else {
            pending.launch.abort();
            None
        };

        if !options.debug {
            let record = PluginCodeRecord::new(&id, &pending.source, options.enable);
            if let Err(e) = self.code_store.put(record) {
                warn!(plugin = %id, error = %e, "failed to persist plugin code");
            }
        }

        plugins.insert(
            id.clone(),
            PluginRecord {
                descriptor: descriptor.clone(),
                source: pending.source,
                enabled: options.enable,
                debug: options.debug,
                use_proxy: options.use_proxy,
                instance,
            },
        );
        info!(plugin = %id, name = %descriptor.name, enabled = options.enable, "plugin registered");
        Ok(descriptor)
    }

    /// Re-launches a disabled plugin from its persisted source. No-op when
    /// already enabled.
    pub fn enable(&self, id: &str) -> HostResult<()> {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        let record = plugins
            .get_mut(id)
            .ok_or_else(|| PluginHostError::NotFound(format!("plugin '{id}'")))?;
        if record.enabled {
            return Ok(());
        }

        // Persistence is the source of truth; debug imports were never
        // persisted and re-launch from memory.
        let source = if record.debug {
            record.source.clone()
        } else {
            self.code_store
                .get_by_id(id)?
                .ok_or_else(|| {
                    PluginHostError::NotFound(format!("persisted code for plugin '{id}'"))
                })?
                .source
        };
        let binding = ProxyBinding::resolve(record.use_proxy, self.settings.as_ref());
        let launch = sandbox::launch(&source, self.stores.clone(), binding)?;
        let descriptor = launch.descriptor().clone();
        record.instance = Some(launch.proceed()?);
        record.enabled = true;
        record.source = source;
        record.descriptor = descriptor;
        self.persist_state(record);
        info!(plugin = %id, "plugin enabled");
        Ok(())
    }

    /// Drops the live instance but keeps the registration and persisted
    /// code.
    pub fn disable(&self, id: &str) -> HostResult<()> {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        let record = plugins
            .get_mut(id)
            .ok_or_else(|| PluginHostError::NotFound(format!("plugin '{id}'")))?;
        if !record.enabled {
            return Ok(());
        }
        record.instance = None;
        record.enabled = false;
        self.persist_state(record);
        info!(plugin = %id, "plugin disabled");
        Ok(())
    }

    /// Removes the plugin entirely: live instance, persisted code and the
    /// contents of its key-value store.
    pub fn delete(&self, id: &str) -> HostResult<()> {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        if plugins.remove(id).is_none() {
            return Err(PluginHostError::NotFound(format!("plugin '{id}'")));
        }
        self.code_store.remove(id)?;
        self.stores.evict(id);
        info!(plugin = %id, "plugin deleted");
        Ok(())
    }

    /// Invokes a method on an enabled plugin with JSON arguments.
    pub fn call(&self, id: &str, method: &str, args: Vec<Value>) -> HostResult<Value> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let record = plugins
            .get(id)
            .ok_or_else(|| PluginHostError::NotFound(format!("plugin '{id}'")))?;
        let instance = record.instance.as_ref().ok_or_else(|| {
            PluginHostError::Execution(format!("plugin '{id}' is disabled"))
        })?;
        instance.call(method, args)
    }

    pub fn get(&self, id: &str) -> Option<PluginDescriptor> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.get(id).map(|r| r.descriptor.clone())
    }

    pub fn is_enabled(&self, id: &str) -> Option<bool> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.get(id).map(|r| r.enabled)
    }

    /// All registered descriptors, id-ordered.
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = plugins.values().map(|r| r.descriptor.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Registered descriptors of one type matching `filter`, id-ordered.
    pub fn plugins_by_type(
        &self,
        plugin_type: PluginType,
        filter: &TypeFilter,
    ) -> Vec<PluginDescriptor> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<_> = plugins
            .values()
            .filter(|r| r.descriptor.plugin_type == plugin_type)
            .filter(|r| !filter.enabled_only || (r.enabled && r.instance.is_some()))
            .filter(|r| {
                filter
                    .group
                    .as_deref()
                    .is_none_or(|group| r.descriptor.group == group)
            })
            .map(|r| r.descriptor.clone())
            .collect();
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        selected
    }

    pub fn contains(&self, id: &str) -> bool {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.contains_key(id)
    }

    pub fn count(&self) -> usize {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.len()
    }

    fn persist_state(&self, record: &PluginRecord) {
        if record.debug {
            return;
        }
        let code = PluginCodeRecord::new(&record.descriptor.id, &record.source, record.enabled);
        if let Err(e) = self.code_store.put(code) {
            warn!(plugin = %record.descriptor.id, error = %e, "failed to persist plugin state");
        }
    }
}
