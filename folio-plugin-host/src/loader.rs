//! Bulk loading of persisted plugins at startup.
//!
//! Records load in chunks sized by the settings' parallelism: each chunk
//! validates and evaluates concurrently (phase one of the import), then
//! registers sequentially so conflict checks and registry writes stay
//! ordered. A failing record never aborts the batch; it is reported in the
//! outcome list and its persisted code is quarantined so the next startup
//! does not trip over it again.

use std::thread;

use tracing::{info, warn};

use crate::registry::{ImportInput, ImportOptions, PluginRegistry};

/// Result of loading one persisted record.
#[derive(Debug)]
pub struct LoadOutcome {
    pub id: String,
    /// `None` on success.
    pub error: Option<String>,
}

impl LoadOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Loads every record in the registry's code store. Returns one outcome
/// per record, in store order.
pub fn load_all(registry: &PluginRegistry) -> Vec<LoadOutcome> {
    let records = match registry.code_store().get_all() {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "failed to read persisted plugins");
            return Vec::new();
        }
    };
    if records.is_empty() {
        return Vec::new();
    }

    let parallelism = registry.settings().parallelism().max(1);
    let mut outcomes = Vec::with_capacity(records.len());

    for chunk in records.chunks(parallelism) {
        // Phase one in parallel: persisted code is already rewritten, so
        // static validation is skipped and evaluation dominates.
        let pendings = thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|record| {
                    let options = ImportOptions {
                        minify: false,
                        force: true,
                        enable: record.enabled,
                        debug: false,
                        use_proxy: false,
                    };
                    scope.spawn(move || {
                        registry.begin_import(ImportInput::code(record.source.as_str()), options)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(crate::error::PluginHostError::Execution(
                        "plugin load thread panicked".to_string(),
                    )),
                })
                .collect::<Vec<_>>()
        });

        // Phase two in order.
        for (record, pending) in chunk.iter().zip(pendings) {
            let result = pending.and_then(|p| registry.finish_import(p));
            match result {
                Ok(descriptor) => outcomes.push(LoadOutcome {
                    id: descriptor.id,
                    error: None,
                }),
                Err(e) => {
                    warn!(plugin = %record.id, error = %e, "quarantining broken plugin record");
                    if let Err(remove_err) = registry.code_store().remove(&record.id) {
                        warn!(plugin = %record.id, error = %remove_err, "failed to quarantine record");
                    }
                    outcomes.push(LoadOutcome {
                        id: record.id.clone(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    info!(
        loaded = outcomes.len() - failed,
        failed, "plugin bulk load finished"
    );
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StaticSettings;
    use folio_storage::{MemoryCodeStore, PluginCodeStore, StoreManager};
    use folio_types::PluginCodeRecord;
    use serde_json::json;
    use std::sync::Arc;

    fn plugin_source(id: &str) -> String {
        format!(
            r#"
class P {{
    search(k) {{ return [k]; }}
    detail(u) {{ return {{}}; }}
    chapterText(u) {{ return u; }}
}}
P.ID = "{id}";
P.TYPE = 1;
P.GROUP = "g";
P.NAME = "N";
P.VERSION = "1";
P.VERSION_CODE = 1;
P.PLUGIN_FILE_URL = "";
P.BASE_URL = "https://example.com";
plugin.exports = P;
"#
        )
    }

    fn registry_with(records: Vec<PluginCodeRecord>) -> (PluginRegistry, Arc<MemoryCodeStore>) {
        let code_store = Arc::new(MemoryCodeStore::new());
        for record in records {
            code_store.put(record).unwrap();
        }
        let registry = PluginRegistry::new(
            code_store.clone(),
            Arc::new(StoreManager::new(64 * 1024)),
            Arc::new(StaticSettings {
                parallelism: 2,
                ..StaticSettings::default()
            }),
        );
        (registry, code_store)
    }

    #[test]
    fn empty_store_loads_nothing() {
        let (registry, _) = registry_with(vec![]);
        assert!(load_all(&registry).is_empty());
    }

    #[test]
    fn loads_all_records_restoring_enabled_state() {
        let ids = [
            "aaaaaaaaaaaaaaaa",
            "bbbbbbbbbbbbbbbb",
            "cccccccccccccccc",
        ];
        let records = vec![
            PluginCodeRecord::new(ids[0], plugin_source(ids[0]), true),
            PluginCodeRecord::new(ids[1], plugin_source(ids[1]), false),
            PluginCodeRecord::new(ids[2], plugin_source(ids[2]), true),
        ];
        let (registry, _) = registry_with(records);

        let outcomes = load_all(&registry);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(LoadOutcome::is_ok));

        assert_eq!(registry.is_enabled(ids[0]), Some(true));
        assert_eq!(registry.is_enabled(ids[1]), Some(false));
        assert_eq!(registry.is_enabled(ids[2]), Some(true));

        let result = registry.call(ids[0], "search", vec![json!("q")]).unwrap();
        assert_eq!(result, json!(["q"]));
    }

    #[test]
    fn broken_record_is_isolated_and_quarantined() {
        let good = "aaaaaaaaaaaaaaaa";
        let bad = "bbbbbbbbbbbbbbbb";
        let records = vec![
            PluginCodeRecord::new(good, plugin_source(good), true),
            PluginCodeRecord::new(bad, "this is not javascript ~~~", true),
        ];
        let (registry, code_store) = registry_with(records);

        let outcomes = load_all(&registry);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].id, bad);
        assert!(outcomes[1].error.is_some());

        // The good one is live, the bad one is gone from persistence.
        assert_eq!(registry.is_enabled(good), Some(true));
        assert!(registry.get(bad).is_none());
        assert!(code_store.get_by_id(bad).unwrap().is_none());
    }

    #[test]
    fn record_with_mismatched_schema_quarantined() {
        let id = "aaaaaaaaaaaaaaaa";
        // Evaluates fine but exports nothing.
        let records = vec![PluginCodeRecord::new(id, "var x = 1;", true)];
        let (registry, code_store) = registry_with(records);

        let outcomes = load_all(&registry);
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.as_deref().unwrap().contains("no plugin"));
        assert!(code_store.get_by_id(id).unwrap().is_none());
    }
}
