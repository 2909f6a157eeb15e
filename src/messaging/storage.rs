//! Message storage
//!
//! Two collections:
//! - `inbox/<to_session>/<message_id>` - messages waiting for the target
//! - `replies/<from_session>/<message_id>` - the answer to one request,
//!   keyed by the request's id so it can't be mistaken for inbox mail

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::MeshResult;
use crate::store::{self, RecordKey, RecordStore};

use super::message::InterSessionMessage;

const INBOX_COLLECTION: &str = "inbox";
const REPLIES_COLLECTION: &str = "replies";

/// Typed access to inbox and reply-slot records
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn RecordStore>,
}

impl MessageStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Key of a message in `session_id`'s inbox
    pub fn inbox_key(session_id: &str, message_id: &str) -> MeshResult<RecordKey> {
        RecordKey::root(INBOX_COLLECTION)?.child(session_id)?.child(message_id)
    }

    /// Key of the reply slot for request `message_id` sent by `session_id`
    pub fn reply_key(session_id: &str, message_id: &str) -> MeshResult<RecordKey> {
        RecordKey::root(REPLIES_COLLECTION)?.child(session_id)?.child(message_id)
    }

    fn write(&self, key: &RecordKey, message: &InterSessionMessage) -> MeshResult<()> {
        let bytes = serde_json::to_vec_pretty(message)?;
        self.store.put(key, &bytes)
    }

    fn read_all(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, InterSessionMessage)>> {
        Ok(store::decode_all(self.store.list(prefix)?))
    }

    // =========================================================================
    // Inbox
    // =========================================================================

    /// Write a message into its target's inbox, replacing any earlier copy
    pub fn put_inbox(&self, message: &InterSessionMessage) -> MeshResult<()> {
        self.write(&Self::inbox_key(&message.to_session, &message.id)?, message)
    }

    /// Rewrite an inbox message only if it is still there
    ///
    /// Returns `false` without writing when the record has been removed.
    pub fn update_inbox(&self, message: &InterSessionMessage) -> MeshResult<bool> {
        let key = Self::inbox_key(&message.to_session, &message.id)?;
        if self.store.get(&key)?.is_none() {
            return Ok(false);
        }
        self.write(&key, message)?;
        Ok(true)
    }

    /// All decodable messages in `session_id`'s inbox, oldest first
    pub fn inbox(&self, session_id: &str) -> MeshResult<Vec<InterSessionMessage>> {
        let prefix = RecordKey::root(INBOX_COLLECTION)?.child(session_id)?;
        let mut messages: Vec<InterSessionMessage> =
            self.read_all(&prefix)?.into_iter().map(|(_, m)| m).collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Remove one message from `session_id`'s inbox
    pub fn delete_inbox(&self, session_id: &str, message_id: &str) -> MeshResult<()> {
        self.store.delete(&Self::inbox_key(session_id, message_id)?)
    }

    // =========================================================================
    // Reply slots
    // =========================================================================

    /// Write the answer to `original_id`, sent by `original_sender`
    pub fn put_reply(
        &self,
        original_sender: &str,
        original_id: &str,
        reply: &InterSessionMessage,
    ) -> MeshResult<()> {
        self.write(&Self::reply_key(original_sender, original_id)?, reply)
    }

    /// Read the reply slot for one request
    pub fn get_reply(&self, session_id: &str, original_id: &str) -> MeshResult<Option<InterSessionMessage>> {
        let key = Self::reply_key(session_id, original_id)?;
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        match store::decode(&key, &bytes) {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ignoring corrupt reply");
                Ok(None)
            }
        }
    }

    /// Every reply waiting for `session_id`, as `(original message id, reply)`
    pub fn replies(&self, session_id: &str) -> MeshResult<Vec<(String, InterSessionMessage)>> {
        let prefix = RecordKey::root(REPLIES_COLLECTION)?.child(session_id)?;
        Ok(self
            .read_all(&prefix)?
            .into_iter()
            .map(|(key, reply)| (key.last().to_string(), reply))
            .collect())
    }

    /// Remove a reply slot
    pub fn delete_reply(&self, session_id: &str, original_id: &str) -> MeshResult<()> {
        self.store.delete(&Self::reply_key(session_id, original_id)?)
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Delete inbox and reply records stamped before `cutoff`
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> MeshResult<usize> {
        self.purge_where(|message| message.timestamp < cutoff)
    }

    /// Delete inbox and reply records past their own TTL at `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> MeshResult<usize> {
        self.purge_where(|message| message.is_expired_at(now))
    }

    fn purge_where<F>(&self, should_remove: F) -> MeshResult<usize>
    where
        F: Fn(&InterSessionMessage) -> bool,
    {
        let mut removed = 0;

        for collection in [INBOX_COLLECTION, REPLIES_COLLECTION] {
            for (key, message) in self.read_all(&RecordKey::root(collection)?)? {
                if !should_remove(&message) {
                    continue;
                }
                match self.store.delete(&key) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(key = %key, error = %e, "Failed to remove old message"),
                }
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Purged messages");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageType;
    use crate::store::{FileStore, MemoryStore};
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn create_test_storage() -> (MessageStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = MessageStore::new(Arc::new(FileStore::new(temp_dir.path())));
        (storage, temp_dir)
    }

    #[test]
    fn test_inbox_round_trip() {
        let (storage, _temp) = create_test_storage();

        let msg = InterSessionMessage::new("a", "b", "hello", MessageType::Request);
        storage.put_inbox(&msg).unwrap();

        let inbox = storage.inbox("b").unwrap();
        assert_eq!(inbox, vec![msg]);
        assert!(storage.inbox("a").unwrap().is_empty());
    }

    #[test]
    fn test_inbox_sorted_by_timestamp() {
        let (storage, _temp) = create_test_storage();

        let mut late = InterSessionMessage::new("a", "b", "late", MessageType::Notification);
        let mut early = InterSessionMessage::new("a", "b", "early", MessageType::Notification);
        early.timestamp = late.timestamp - TimeDelta::seconds(5);
        late.id = "0-sorts-first-by-id".into();

        storage.put_inbox(&late).unwrap();
        storage.put_inbox(&early).unwrap();

        let contents: Vec<String> = storage.inbox("b").unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["early", "late"]);
    }

    #[test]
    fn test_update_inbox_skips_removed_message() {
        let (storage, _temp) = create_test_storage();

        let mut message = InterSessionMessage::new("a", "b", "hi", MessageType::Notification);
        storage.put_inbox(&message).unwrap();
        message.mark_read();
        assert!(storage.update_inbox(&message).unwrap());
        assert!(storage.inbox("b").unwrap()[0].read);

        storage.delete_inbox("b", &message.id).unwrap();
        assert!(!storage.update_inbox(&message).unwrap());
        assert!(storage.inbox("b").unwrap().is_empty());
    }

    #[test]
    fn test_reply_slot_separate_from_inbox() {
        let (storage, _temp) = create_test_storage();

        let request = InterSessionMessage::new("a", "b", "ping", MessageType::Request).with_reply_back(true);
        let reply = InterSessionMessage::response_to(&request, "pong");
        storage.put_reply("a", &request.id, &reply).unwrap();

        assert!(storage.inbox("a").unwrap().is_empty());
        assert_eq!(storage.get_reply("a", &request.id).unwrap(), Some(reply.clone()));

        let replies = storage.replies("a").unwrap();
        assert_eq!(replies, vec![(request.id.clone(), reply)]);

        storage.delete_reply("a", &request.id).unwrap();
        assert!(storage.get_reply("a", &request.id).unwrap().is_none());
    }

    #[test]
    fn test_rejects_unsafe_session_id() {
        let (storage, _temp) = create_test_storage();
        let msg = InterSessionMessage::new("a", "../escape", "x", MessageType::Request);
        assert!(storage.put_inbox(&msg).is_err());
    }

    #[test]
    fn test_purge_older_than_boundary() {
        let memory = MemoryStore::new();
        let storage = MessageStore::new(Arc::new(memory.clone()));
        let cutoff = Utc::now() - TimeDelta::seconds(300);

        let mut old = InterSessionMessage::new("a", "b", "old", MessageType::Request);
        old.timestamp = cutoff - TimeDelta::milliseconds(1);
        let mut edge = InterSessionMessage::new("a", "b", "edge", MessageType::Request);
        edge.timestamp = cutoff;
        let fresh = InterSessionMessage::new("a", "b", "fresh", MessageType::Request);
        let mut old_reply = InterSessionMessage::response_to(&fresh, "late answer");
        old_reply.timestamp = cutoff - TimeDelta::seconds(1);

        storage.put_inbox(&old).unwrap();
        storage.put_inbox(&edge).unwrap();
        storage.put_inbox(&fresh).unwrap();
        storage.put_reply("a", &fresh.id, &old_reply).unwrap();
        memory
            .put(&MessageStore::inbox_key("b", "garbage").unwrap(), b"not json")
            .unwrap();

        assert_eq!(storage.purge_older_than(cutoff).unwrap(), 2);

        let contents: Vec<String> = storage.inbox("b").unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["edge", "fresh"]);
        assert!(storage.replies("a").unwrap().is_empty());
        // Malformed records are skipped, not deleted
        assert!(memory
            .get(&MessageStore::inbox_key("b", "garbage").unwrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_purge_expired_uses_message_ttl() {
        let (storage, _temp) = create_test_storage();
        let now = Utc::now();

        let mut short = InterSessionMessage::new("a", "b", "short", MessageType::Notification).with_ttl(5);
        short.timestamp = now - TimeDelta::seconds(6);
        let mut long = InterSessionMessage::new("a", "b", "long", MessageType::Notification).with_ttl(600);
        long.timestamp = now - TimeDelta::seconds(6);

        storage.put_inbox(&short).unwrap();
        storage.put_inbox(&long).unwrap();

        assert_eq!(storage.purge_expired(now).unwrap(), 1);
        assert_eq!(storage.inbox("b").unwrap()[0].content, "long");
    }
}
