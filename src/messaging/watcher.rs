//! ReplyWatcher - one poll loop shared by every local request waiting for a reply
//!
//! Each blocking `send` registers a waiter keyed by its message id. While any
//! waiter exists, a single background task scans this session's reply slots
//! every poll interval, claims slots that have a waiter (hand the reply over,
//! then delete the record) and stops once nobody is waiting.
//!
//! Scans touch the record store synchronously, so they run on tokio's
//! blocking pool rather than on a runtime worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use super::message::InterSessionMessage;
use super::storage::MessageStore;

/// Default interval between reply-slot scans
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shortest interval the watcher will poll at
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct WatcherState {
    waiters: HashMap<String, oneshot::Sender<InterSessionMessage>>,
    polling: bool,
}

/// Fans reply-slot records out to local waiters
pub struct ReplyWatcher {
    session_id: String,
    messages: MessageStore,
    poll_interval: Duration,
    state: Mutex<WatcherState>,
}

/// Clears `polling` if the loop dies without reaching its idle exit
struct PollingGuard {
    watcher: Arc<ReplyWatcher>,
    armed: bool,
}

impl Drop for PollingGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(session_id = %self.watcher.session_id, "Reply watcher stopped unexpectedly");
            self.watcher.lock().polling = false;
        }
    }
}

impl ReplyWatcher {
    /// Create a watcher; `poll_interval` is raised to [`MIN_POLL_INTERVAL`] if shorter
    pub fn new(session_id: impl Into<String>, messages: MessageStore, poll_interval: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            state: Mutex::new(WatcherState {
                waiters: HashMap::new(),
                polling: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait for the reply to `message_id`
    ///
    /// Starts the poll loop if it isn't running. Must be called from within a
    /// tokio runtime.
    pub fn wait_for(self: &Arc<Self>, message_id: &str) -> oneshot::Receiver<InterSessionMessage> {
        let (tx, rx) = oneshot::channel();

        let start = {
            let mut state = self.lock();
            state.waiters.insert(message_id.to_string(), tx);
            !std::mem::replace(&mut state.polling, true)
        };

        if start {
            tracing::debug!(session_id = %self.session_id, "Starting reply watcher");
            tokio::spawn(Arc::clone(self).poll_loop());
        }
        rx
    }

    /// Stop waiting for `message_id`
    ///
    /// Returns `false` if the waiter was already gone, meaning the reply was
    /// claimed and its receiver resolves shortly.
    pub fn forget(&self, message_id: &str) -> bool {
        self.lock().waiters.remove(message_id).is_some()
    }

    /// Number of local requests currently waiting
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Take the waiter for `message_id` so only one party can answer it
    pub(crate) fn claim(&self, message_id: &str) -> Option<oneshot::Sender<InterSessionMessage>> {
        self.lock().waiters.remove(message_id)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut guard = PollingGuard {
            watcher: Arc::clone(&self),
            armed: true,
        };
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let watcher = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || watcher.poll_once()).await {
                tracing::error!(session_id = %self.session_id, error = %e, "Reply scan failed");
            }

            // Checked under the same lock `wait_for` takes, so a waiter that
            // arrives now either sees `polling == false` or is seen here
            let idle = {
                let mut state = self.lock();
                if state.waiters.is_empty() {
                    state.polling = false;
                }
                !state.polling
            };
            if idle {
                break;
            }
        }

        guard.armed = false;
        tracing::debug!(session_id = %self.session_id, "Reply watcher idle");
    }

    /// Scan reply slots once and deliver the ones somebody is waiting for
    pub fn poll_once(&self) {
        if self.lock().waiters.is_empty() {
            return;
        }

        let replies = match self.messages.replies(&self.session_id) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to scan reply slots");
                return;
            }
        };

        for (original_id, reply) in replies {
            let Some(waiter) = self.claim(&original_id) else {
                continue;
            };

            tracing::debug!(message_id = %original_id, from = %reply.from_session, "Reply received");
            // Receiver gone means the caller was dropped; the reply is discarded
            let _ = waiter.send(reply);

            if let Err(e) = self.messages.delete_reply(&self.session_id, &original_id) {
                tracing::warn!(message_id = %original_id, error = %e, "Failed to delete consumed reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MeshResult;
    use crate::messaging::MessageType;
    use crate::store::{MemoryStore, RecordKey, RecordStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Reply-slot deletes take a while, as on a slow disk
    struct SlowReplyDelete {
        inner: MemoryStore,
        delay: Duration,
    }

    impl RecordStore for SlowReplyDelete {
        fn put(&self, key: &RecordKey, value: &[u8]) -> MeshResult<()> {
            self.inner.put(key, value)
        }

        fn get(&self, key: &RecordKey) -> MeshResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn list(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, Vec<u8>)>> {
            self.inner.list(prefix)
        }

        fn delete(&self, key: &RecordKey) -> MeshResult<()> {
            if key.as_str().starts_with("replies/") {
                std::thread::sleep(self.delay);
            }
            self.inner.delete(key)
        }
    }

    /// The first scan panics, later ones work
    struct PanicsOnce {
        inner: MemoryStore,
        panicked: AtomicBool,
    }

    impl RecordStore for PanicsOnce {
        fn put(&self, key: &RecordKey, value: &[u8]) -> MeshResult<()> {
            self.inner.put(key, value)
        }

        fn get(&self, key: &RecordKey) -> MeshResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn list(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, Vec<u8>)>> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("scan blew up");
            }
            self.inner.list(prefix)
        }

        fn delete(&self, key: &RecordKey) -> MeshResult<()> {
            self.inner.delete(key)
        }
    }

    fn watcher(store: &MemoryStore) -> Arc<ReplyWatcher> {
        Arc::new(ReplyWatcher::new(
            "a",
            MessageStore::new(Arc::new(store.clone())),
            Duration::from_millis(10),
        ))
    }

    fn reply_for(messages: &MessageStore, request: &InterSessionMessage, text: &str) {
        let reply = InterSessionMessage::response_to(request, text);
        messages.put_reply(&request.from_session, &request.id, &reply).unwrap();
    }

    #[tokio::test]
    async fn test_delivers_and_consumes_reply() {
        let store = MemoryStore::new();
        let messages = MessageStore::new(Arc::new(store.clone()));
        let watcher = watcher(&store);

        let request = InterSessionMessage::new("a", "b", "ping", MessageType::Request).with_reply_back(true);
        let rx = watcher.wait_for(&request.id);
        reply_for(&messages, &request, "pong");

        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(reply.response.as_deref(), Some("pong"));
        assert!(messages.get_reply("a", &request.id).unwrap().is_none());
        assert_eq!(watcher.waiting(), 0);
    }

    #[tokio::test]
    async fn test_fans_out_to_several_waiters() {
        let store = MemoryStore::new();
        let messages = MessageStore::new(Arc::new(store.clone()));
        let watcher = watcher(&store);

        let first = InterSessionMessage::new("a", "b", "one", MessageType::Request).with_reply_back(true);
        let second = InterSessionMessage::new("a", "c", "two", MessageType::Request).with_reply_back(true);
        let rx1 = watcher.wait_for(&first.id);
        let rx2 = watcher.wait_for(&second.id);

        reply_for(&messages, &second, "second done");
        reply_for(&messages, &first, "first done");

        let r1 = tokio::time::timeout(Duration::from_secs(2), rx1).await.unwrap().unwrap();
        let r2 = tokio::time::timeout(Duration::from_secs(2), rx2).await.unwrap().unwrap();
        assert_eq!(r1.content, "first done");
        assert_eq!(r2.content, "second done");
    }

    #[tokio::test]
    async fn test_leaves_unclaimed_replies() {
        let store = MemoryStore::new();
        let messages = MessageStore::new(Arc::new(store.clone()));
        let watcher = watcher(&store);

        let orphan = InterSessionMessage::new("a", "b", "old", MessageType::Request).with_reply_back(true);
        reply_for(&messages, &orphan, "nobody waits");

        let request = InterSessionMessage::new("a", "b", "new", MessageType::Request).with_reply_back(true);
        let rx = watcher.wait_for(&request.id);
        reply_for(&messages, &request, "answer");
        tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();

        assert!(messages.get_reply("a", &orphan.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forget_stops_loop() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);

        let _rx = watcher.wait_for("m1");
        assert!(watcher.forget("m1"));
        assert!(!watcher.forget("m1"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!watcher.lock().polling);

        // A new waiter restarts the loop
        let messages = MessageStore::new(Arc::new(store.clone()));
        let request = InterSessionMessage::new("a", "b", "again", MessageType::Request).with_reply_back(true);
        let rx = watcher.wait_for(&request.id);
        reply_for(&messages, &request, "ok");
        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(reply.content, "ok");
    }

    #[tokio::test]
    async fn test_reply_handed_over_before_slot_delete() {
        let store = MemoryStore::new();
        let messages = MessageStore::new(Arc::new(store.clone()));
        let slow = SlowReplyDelete {
            inner: store.clone(),
            delay: Duration::from_millis(500),
        };
        let watcher = Arc::new(ReplyWatcher::new(
            "a",
            MessageStore::new(Arc::new(slow)),
            Duration::from_millis(10),
        ));

        let request = InterSessionMessage::new("a", "b", "ping", MessageType::Request).with_reply_back(true);
        let rx = watcher.wait_for(&request.id);
        reply_for(&messages, &request, "pong");

        // Well under the delete delay
        let reply = tokio::time::timeout(Duration::from_millis(250), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.content, "pong");
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised_to_minimum() {
        let store = MemoryStore::new();
        let messages = MessageStore::new(Arc::new(store.clone()));
        let watcher = Arc::new(ReplyWatcher::new("a", messages.clone(), Duration::ZERO));
        assert_eq!(watcher.poll_interval(), MIN_POLL_INTERVAL);

        let request = InterSessionMessage::new("a", "b", "ping", MessageType::Request).with_reply_back(true);
        let rx = watcher.wait_for(&request.id);
        reply_for(&messages, &request, "pong");

        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(reply.content, "pong");
    }

    #[tokio::test]
    async fn test_panicking_scan_does_not_kill_loop() {
        let store = MemoryStore::new();
        let messages = MessageStore::new(Arc::new(store.clone()));
        let flaky = PanicsOnce {
            inner: store.clone(),
            panicked: AtomicBool::new(false),
        };
        let watcher = Arc::new(ReplyWatcher::new(
            "a",
            MessageStore::new(Arc::new(flaky)),
            Duration::from_millis(10),
        ));

        let request = InterSessionMessage::new("a", "b", "ping", MessageType::Request).with_reply_back(true);
        let rx = watcher.wait_for(&request.id);
        reply_for(&messages, &request, "pong");

        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(reply.content, "pong");
    }

    #[test]
    fn test_polling_guard_resets_flag_only_when_armed() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);

        watcher.lock().polling = true;
        drop(PollingGuard {
            watcher: Arc::clone(&watcher),
            armed: false,
        });
        assert!(watcher.lock().polling);

        drop(PollingGuard {
            watcher: Arc::clone(&watcher),
            armed: true,
        });
        assert!(!watcher.lock().polling);
    }
}
