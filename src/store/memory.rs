//! In-memory record store

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::MeshResult;

use super::key::RecordKey;
use super::RecordStore;

/// Record store kept in process memory
///
/// Clones share the same map, so several messengers built on clones of one
/// `MemoryStore` see each other's records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<RecordKey, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordKey, Vec<u8>>> {
        // A panic while holding the lock cannot leave a map entry half-written
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, key: &RecordKey, value: &[u8]) -> MeshResult<()> {
        self.lock().insert(key.clone(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> MeshResult<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    fn list(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, Vec<u8>)>> {
        Ok(self
            .lock()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.as_str().starts_with(prefix.as_str()))
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn delete(&self, key: &RecordKey) -> MeshResult<()> {
        self.lock().remove(key);
        Ok(())
    }
}
