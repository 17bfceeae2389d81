//! Plugin-code persistence collaborator.

use crate::error::StorageResult;
use folio_types::PluginCodeRecord;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Durable storage for plugin source records.
///
/// The plugin registry talks to persistence exclusively through this trait;
/// a real application backs it with its settings database. `remove` is
/// idempotent: removing an absent id is not an error (the bulk loader
/// quarantines records it may already have dropped).
pub trait PluginCodeStore: Send + Sync {
    fn get_by_id(&self, id: &str) -> StorageResult<Option<PluginCodeRecord>>;
    fn get_all(&self) -> StorageResult<Vec<PluginCodeRecord>>;
    /// Inserts or replaces the record keyed by `record.id`.
    fn put(&self, record: PluginCodeRecord) -> StorageResult<()>;
    fn remove(&self, id: &str) -> StorageResult<()>;
}

/// In-memory [`PluginCodeStore`], used in tests and as the default backing
/// store for embedders that do not persist plugins across runs.
///
/// `get_all` returns records in id order.
#[derive(Debug, Default)]
pub struct MemoryCodeStore {
    records: Mutex<BTreeMap<String, PluginCodeRecord>>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PluginCodeStore for MemoryCodeStore {
    fn get_by_id(&self, id: &str) -> StorageResult<Option<PluginCodeRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(id).cloned())
    }

    fn get_all(&self) -> StorageResult<Vec<PluginCodeRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.values().cloned().collect())
    }

    fn put(&self, record: PluginCodeRecord) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &str) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn put_get_round_trip() {
        let store = MemoryCodeStore::new();
        let record = PluginCodeRecord::new("p1", "plugin.exports = 1;", true);
        store.put(record.clone()).unwrap();

        assert_eq!(store.get_by_id("p1").unwrap(), Some(record));
        assert_eq!(store.get_by_id("missing").unwrap(), None);
    }

    #[test]
    fn put_replaces_existing() {
        let store = MemoryCodeStore::new();
        store.put(PluginCodeRecord::new("p1", "v1", false)).unwrap();
        store.put(PluginCodeRecord::new("p1", "v2", true)).unwrap();

        let record = store.get_by_id("p1").unwrap().unwrap();
        assert_eq!(record.source, "v2");
        assert!(record.enabled);
        assert_eq!(store.get_all().unwrap().len(), 1);
    }

    #[test]
    fn get_all_sorted_by_id() {
        let store = MemoryCodeStore::new();
        store.put(PluginCodeRecord::new("zz", "", false)).unwrap();
        store.put(PluginCodeRecord::new("aa", "", false)).unwrap();

        let ids: Vec<String> = store
            .get_all()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["aa".to_string(), "zz".to_string()]);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = MemoryCodeStore::new();
        store.put(PluginCodeRecord::new("p1", "", false)).unwrap();
        store.remove("p1").unwrap();
        store.remove("p1").unwrap();
        assert_eq!(store.get_by_id("p1").unwrap(), None);
    }
}
