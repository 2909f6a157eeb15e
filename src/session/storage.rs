//! Descriptor storage
//!
//! Reads and writes session descriptors under `sessions/<session_id>`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::{MeshError, MeshResult};
use crate::store::{self, RecordKey, RecordStore};

use super::descriptor::SessionDescriptor;

/// Collection that holds one descriptor per session
const SESSIONS_COLLECTION: &str = "sessions";

/// Typed access to session descriptors
#[derive(Clone)]
pub struct DescriptorStore {
    store: Arc<dyn RecordStore>,
}

impl DescriptorStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    fn collection() -> MeshResult<RecordKey> {
        RecordKey::root(SESSIONS_COLLECTION)
    }

    /// Get the key for a session's descriptor
    pub fn key(session_id: &str) -> MeshResult<RecordKey> {
        Self::collection()?.child(session_id)
    }

    /// Create or replace a descriptor
    pub fn save(&self, descriptor: &SessionDescriptor) -> MeshResult<()> {
        if !descriptor.status.is_persistable() {
            return Err(MeshError::InvalidStatus(descriptor.status.to_string()));
        }
        let key = Self::key(&descriptor.session_id)?;
        let bytes = serde_json::to_vec_pretty(descriptor)?;
        self.store.put(&key, &bytes)
    }

    /// Load a descriptor; absent and undecodable records both yield `None`
    pub fn load(&self, session_id: &str) -> MeshResult<Option<SessionDescriptor>> {
        let key = Self::key(session_id)?;
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        match store::decode(&key, &bytes) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Ignoring corrupt descriptor");
                Ok(None)
            }
        }
    }

    /// Load every decodable descriptor, sorted by session id
    pub fn list(&self) -> MeshResult<Vec<SessionDescriptor>> {
        let records = self.store.list(&Self::collection()?)?;
        let mut descriptors: Vec<SessionDescriptor> = store::decode_all(records)
            .into_iter()
            .map(|(_, descriptor)| descriptor)
            .collect();
        descriptors.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(descriptors)
    }

    /// Delete a descriptor; deleting an absent one is not an error
    pub fn delete(&self, session_id: &str) -> MeshResult<()> {
        self.store.delete(&Self::key(session_id)?)
    }

    /// Delete descriptors whose `last_active` is before `cutoff`
    ///
    /// Each candidate is re-read right before deletion, so a session that
    /// heartbeats while the sweep runs survives it. Returns the number deleted.
    pub fn purge_inactive_since(&self, cutoff: DateTime<Utc>) -> MeshResult<usize> {
        let mut removed = 0;

        for candidate in self.list()? {
            if candidate.last_active >= cutoff {
                continue;
            }

            match self.load(&candidate.session_id) {
                Ok(Some(current)) if current.last_active >= cutoff => {
                    tracing::debug!(session_id = %current.session_id, "Session heartbeated during cleanup");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id = %candidate.session_id, error = %e, "Skipping session during cleanup");
                    continue;
                }
            }

            match self.delete(&candidate.session_id) {
                Ok(()) => {
                    tracing::info!(
                        session_id = %candidate.session_id,
                        last_active = %candidate.last_active,
                        "Removed stale session"
                    );
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(session_id = %candidate.session_id, error = %e, "Failed to remove stale session");
                }
            }
        }

        Ok(removed)
    }
}
