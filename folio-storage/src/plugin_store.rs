//! Quota-bounded per-plugin key/value stores.

use crate::error::{StorageError, StorageResult};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default serialized-size budget applied uniformly to every plugin store.
pub const DEFAULT_STORE_BUDGET: usize = 64 * 1024;

/// A key/value store scoped to one plugin, bounded by a serialized byte
/// budget.
///
/// Values are JSON; the budget is measured on the serialized form of the
/// whole store, so a rejected write leaves previous contents untouched.
#[derive(Debug)]
pub struct PluginStore {
    budget: usize,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl PluginStore {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// Inserts `value` under `key`, failing with [`StorageError::QuotaExceeded`]
    /// if the serialized store would exceed the budget. On failure the store
    /// is left exactly as it was.
    pub fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let previous = entries.insert(key.to_string(), value);

        let size = serialized_size(&entries)?;
        if size > self.budget {
            // Roll back to the pre-write state.
            match previous {
                Some(prev) => {
                    entries.insert(key.to_string(), prev);
                }
                None => {
                    entries.remove(key);
                }
            }
            return Err(StorageError::QuotaExceeded {
                budget: self.budget,
                attempted: size,
            });
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn serialized_size(entries: &BTreeMap<String, Value>) -> StorageResult<usize> {
    Ok(serde_json::to_vec(entries)?.len())
}

/// Process-wide cache of plugin stores, one per plugin id.
///
/// Stores are created lazily on first access and live for the process
/// lifetime regardless of whether the owning plugin is currently enabled.
#[derive(Debug)]
pub struct StoreManager {
    budget: usize,
    stores: Mutex<HashMap<String, Arc<PluginStore>>>,
}

impl Default for StoreManager {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_BUDGET)
    }
}

impl StoreManager {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the store for `plugin_id`, creating it if absent.
    pub fn get(&self, plugin_id: &str) -> Arc<PluginStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(stores.entry(plugin_id.to_string()).or_insert_with(|| {
            debug!(plugin_id = %plugin_id, budget = self.budget, "creating plugin store");
            Arc::new(PluginStore::new(self.budget))
        }))
    }

    /// Drops the cached store for `plugin_id`. Existing handles stay usable;
    /// the next `get` starts from an empty store.
    pub fn evict(&self, plugin_id: &str) {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.remove(plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trips() {
        let store = PluginStore::new(DEFAULT_STORE_BUDGET);
        store.set("cursor", json!({"page": 3})).unwrap();
        assert_eq!(store.get("cursor"), Some(json!({"page": 3})));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn over_budget_write_rejected_and_state_preserved() {
        let store = PluginStore::new(64);
        store.set("small", json!("ok")).unwrap();

        let big = "x".repeat(256);
        let err = store.set("big", json!(big)).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { budget: 64, .. }));

        // Prior contents untouched, failed key absent.
        assert_eq!(store.get("small"), Some(json!("ok")));
        assert_eq!(store.get("big"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn over_budget_overwrite_keeps_previous_value() {
        let store = PluginStore::new(64);
        store.set("k", json!("short")).unwrap();

        let err = store.set("k", json!("y".repeat(256))).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(store.get("k"), Some(json!("short")));
    }

    #[test]
    fn remove_returns_previous_value() {
        let store = PluginStore::new(DEFAULT_STORE_BUDGET);
        store.set("k", json!(1)).unwrap();
        assert_eq!(store.remove("k"), Some(json!(1)));
        assert_eq!(store.remove("k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn manager_caches_one_store_per_id() {
        let manager = StoreManager::default();
        let a = manager.get("p1");
        let b = manager.get("p1");
        let c = manager.get("p2");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn manager_evict_discards_contents() {
        let manager = StoreManager::default();
        manager.get("p1").set("k", json!(1)).unwrap();
        manager.evict("p1");
        assert_eq!(manager.get("p1").get("k"), None);
    }

    #[test]
    fn store_survives_independent_of_enabled_state() {
        // The manager has no notion of enablement; repeated gets keep data.
        let manager = StoreManager::default();
        manager.get("p1").set("k", json!("v")).unwrap();
        assert_eq!(manager.get("p1").get("k"), Some(json!("v")));
    }
}
