//! Keyed record storage
//!
//! Everything sessions share lives behind the [`RecordStore`] trait:
//! - `FileStore` - one JSON file per record, atomic temp-file-then-rename writes
//! - `MemoryStore` - in-process map, for tests and single-process use
//!
//! Keys are `/`-separated paths such as `inbox/<session>/<message>`.
//! Values are opaque bytes; the typed stores in `session` and `messaging`
//! handle encoding.

pub mod file;
pub mod key;
pub mod memory;

pub use file::FileStore;
pub use key::RecordKey;
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;

use crate::core::{MeshError, MeshResult};

/// Durable keyed storage shared by every session
///
/// Implementations must make `put` atomic: a concurrent reader sees either the
/// old record or the new one, never a partial write. No cross-process locking
/// is expected beyond that.
pub trait RecordStore: Send + Sync {
    /// Create or replace the record at `key`
    fn put(&self, key: &RecordKey, value: &[u8]) -> MeshResult<()>;

    /// Read the record at `key`, `None` if absent
    fn get(&self, key: &RecordKey) -> MeshResult<Option<Vec<u8>>>;

    /// All records under `prefix`, recursively, sorted by key
    fn list(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, Vec<u8>)>>;

    /// Remove the record at `key`; removing an absent record is not an error
    fn delete(&self, key: &RecordKey) -> MeshResult<()>;
}

/// Decode a single record
pub(crate) fn decode<T: DeserializeOwned>(key: &RecordKey, bytes: &[u8]) -> MeshResult<T> {
    serde_json::from_slice(bytes).map_err(|e| MeshError::corrupt(key.as_str(), e))
}

/// Decode a scan, skipping records that fail to decode
pub(crate) fn decode_all<T: DeserializeOwned>(records: Vec<(RecordKey, Vec<u8>)>) -> Vec<(RecordKey, T)> {
    records
        .into_iter()
        .filter_map(|(key, bytes)| match decode(&key, &bytes) {
            Ok(record) => Some((key, record)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Skipping corrupt record");
                None
            }
        })
        .collect()
}
