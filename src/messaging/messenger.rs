//! Messenger - sending and receiving messages between sessions
//!
//! A `Messenger` is bound to the caller's own session id and owns that
//! session's `SessionRegistry`:
//!
//! ```ignore
//! let messenger = Messenger::open(session_id, &config);
//! messenger.registry().register(Registration::new("coder"))?;
//!
//! if let Some(tester) = messenger.registry().find_one(Some("tester"), None)? {
//!     let sent = messenger
//!         .send(&tester.session_id, "run tests", SendOptions::request(Duration::from_secs(5)))
//!         .await?;
//!     if sent.delivered {
//!         println!("{}", sent.response.unwrap_or_default());
//!     }
//! }
//! ```
//!
//! Delivery is eventually consistent: a request that times out locally may
//! still be read and answered later, and the late answer expires by TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::MeshConfig;
use crate::core::{time, MeshResult};
use crate::session::{SessionFilter, SessionRegistry};
use crate::store::RecordStore;

use super::history::{self, TranscriptEntry, TranscriptSource};
use super::message::{InterSessionMessage, MessageType};
use super::storage::MessageStore;
use super::watcher::ReplyWatcher;

/// How a message is sent
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub message_type: MessageType,

    /// Wait for the target to reply
    pub reply_back: bool,

    /// How long to wait for a reply; `None` uses the configured default
    pub timeout: Option<Duration>,

    /// Abort the wait early
    pub cancel: Option<CancellationToken>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            message_type: MessageType::Request,
            reply_back: false,
            timeout: None,
            cancel: None,
        }
    }
}

impl SendOptions {
    /// Fire-and-forget request
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that waits up to `timeout` for a reply
    pub fn request(timeout: Duration) -> Self {
        Self {
            reply_back: true,
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    /// Fire-and-forget notification
    pub fn notification() -> Self {
        Self::default().with_message_type(MessageType::Notification)
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_reply_back(mut self, reply_back: bool) -> Self {
        self.reply_back = reply_back;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Sends, receives and answers messages for one session
///
/// Cheap to clone; clones share the reply watcher.
#[derive(Clone)]
pub struct Messenger {
    session_id: String,
    registry: SessionRegistry,
    messages: MessageStore,
    watcher: Arc<ReplyWatcher>,
    transcripts: Option<Arc<dyn TranscriptSource>>,
    message_ttl_secs: u64,
    default_timeout: Duration,
}

impl Messenger {
    /// Create a messenger for `session_id` on top of `store`
    pub fn new(session_id: impl Into<String>, store: Arc<dyn RecordStore>, config: &MeshConfig) -> Self {
        let session_id = session_id.into();
        let messages = MessageStore::new(Arc::clone(&store));
        let watcher = Arc::new(ReplyWatcher::new(
            &session_id,
            messages.clone(),
            config.reply_poll_interval(),
        ));

        Self {
            registry: SessionRegistry::new(&session_id, store, config.stale_display_threshold()),
            session_id,
            messages,
            watcher,
            transcripts: None,
            message_ttl_secs: config.message_ttl_secs,
            default_timeout: config.default_reply_timeout(),
        }
    }

    /// Create a messenger on the file store and transcripts named by `config`
    pub fn open(session_id: impl Into<String>, config: &MeshConfig) -> Self {
        let messenger = Self::new(session_id, Arc::new(config.file_store()), config);
        match config.transcripts() {
            Some(transcripts) => messenger.with_transcripts(Arc::new(transcripts)),
            None => messenger,
        }
    }

    /// Set where `get_history` reads transcripts from
    pub fn with_transcripts(mut self, transcripts: Arc<dyn TranscriptSource>) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the registry for this session
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send `content` to `target`
    ///
    /// The message is written to the target's inbox before anything else; a
    /// storage failure there is returned as an error. Without `reply_back` the
    /// call returns right after that write, whether or not the target exists.
    ///
    /// With `reply_back`, waits until the reply arrives, the timeout elapses or
    /// `cancel` fires. The returned message has `delivered == true` and
    /// `response` set only if a reply was consumed. Timing out is not an error.
    pub async fn send(
        &self,
        target: &str,
        content: impl Into<String>,
        options: SendOptions,
    ) -> MeshResult<InterSessionMessage> {
        let mut message = InterSessionMessage::new(&self.session_id, target, content, options.message_type)
            .with_reply_back(options.reply_back)
            .with_ttl(self.message_ttl_secs);

        self.messages.put_inbox(&message)?;
        tracing::debug!(
            message_id = %message.id,
            to = %target,
            message_type = ?message.message_type,
            reply_back = message.reply_back,
            "Message sent"
        );

        if !message.reply_back {
            return Ok(message);
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        match self.wait_for_reply(&message.id, timeout, options.cancel.as_ref()).await {
            Some(reply) => {
                message.response = Some(reply.response.unwrap_or(reply.content));
                message.delivered = true;
            }
            None => {
                tracing::debug!(message_id = %message.id, to = %target, ?timeout, "No reply before timeout");
            }
        }

        Ok(message)
    }

    async fn wait_for_reply(
        &self,
        message_id: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Option<InterSessionMessage> {
        let mut rx = self.watcher.wait_for(message_id);

        let received = tokio::select! {
            result = tokio::time::timeout(timeout, &mut rx) => result.ok().and_then(Result::ok),
            _ = cancelled(cancel) => None,
        };
        if received.is_some() {
            return received;
        }

        if self.watcher.forget(message_id) {
            None
        } else {
            // Claimed by the watcher as we gave up; the sender is in flight
            rx.await.ok()
        }
    }

    /// Send `content` to every other session matching the filters
    ///
    /// A failed send to one session is logged and does not stop the rest.
    /// Returns the number of sessions matched.
    pub async fn broadcast(
        &self,
        content: &str,
        agent_type: Option<&str>,
        capability: Option<&str>,
    ) -> MeshResult<usize> {
        let mut filter = SessionFilter::new();
        filter.agent_type = agent_type.map(str::to_string);
        filter.capability = capability.map(str::to_string);

        let targets = self.registry.list(&filter)?;
        let options = SendOptions::new().with_message_type(MessageType::Broadcast);

        let mut failed = 0;
        for target in &targets {
            if let Err(e) = self.send(&target.session_id, content, options.clone()).await {
                failed += 1;
                tracing::warn!(to = %target.session_id, error = %e, "Broadcast send failed");
            }
        }

        tracing::info!(targets = targets.len(), failed, "Broadcast sent");
        Ok(targets.len())
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Every message in this session's inbox, marked delivered and read
    ///
    /// Messages stay in the inbox, so a later call returns them again until
    /// they are acknowledged or expire.
    ///
    /// A message removed between the scan and the write-back (acknowledged by
    /// another caller, purged by a sweep) is neither recreated nor returned.
    pub fn check_messages(&self) -> MeshResult<Vec<InterSessionMessage>> {
        let mut messages = self.messages.inbox(&self.session_id)?;

        messages.retain_mut(|message| {
            if !message.mark_read() {
                return true;
            }
            match self.messages.update_inbox(message) {
                Ok(still_present) => still_present,
                Err(e) => {
                    tracing::warn!(message_id = %message.id, error = %e, "Failed to mark message read");
                    true
                }
            }
        });

        Ok(messages)
    }

    /// Number of inbox messages not yet returned by `check_messages`
    pub fn pending_count(&self) -> MeshResult<usize> {
        Ok(self
            .messages
            .inbox(&self.session_id)?
            .iter()
            .filter(|m| !m.read)
            .count())
    }

    /// Remove a handled message from this session's inbox
    pub fn acknowledge(&self, message: &InterSessionMessage) -> MeshResult<()> {
        if message.to_session != self.session_id {
            return Ok(());
        }
        self.messages.delete_inbox(&self.session_id, &message.id)
    }

    /// Answer `original`
    ///
    /// Only requests sent with `reply_back` can be answered; for anything else
    /// this writes nothing and returns `None`.
    pub fn reply(
        &self,
        original: &InterSessionMessage,
        response: impl Into<String>,
    ) -> MeshResult<Option<InterSessionMessage>> {
        if !original.reply_back {
            tracing::debug!(message_id = %original.id, "Ignoring reply to message that expects none");
            return Ok(None);
        }

        let reply = InterSessionMessage::response_to(original, response);
        self.messages.put_reply(&original.from_session, &original.id, &reply)?;

        tracing::debug!(message_id = %original.id, to = %original.from_session, "Reply written");
        Ok(Some(reply))
    }

    // =========================================================================
    // History
    // =========================================================================

    /// The last `limit` transcript entries of `session_id`, newer than `since`
    ///
    /// Falls back to a partial id match; never fails.
    pub fn get_history(
        &self,
        session_id: &str,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Vec<TranscriptEntry> {
        match &self.transcripts {
            Some(source) => history::lookup_history(source.as_ref(), session_id, limit, since),
            None => Vec::new(),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete inbox and reply records older than `max_age`
    pub fn cleanup_old_messages(&self, max_age: Duration) -> MeshResult<usize> {
        self.messages.purge_older_than(time::cutoff(Utc::now(), max_age))
    }

    /// Delete inbox and reply records past their own TTL
    pub fn cleanup_expired_messages(&self) -> MeshResult<usize> {
        self.messages.purge_expired(Utc::now())
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::history::DEFAULT_HISTORY_LIMIT;
    use crate::session::Registration;
    use crate::store::{MemoryStore, RecordKey};
    use std::time::Instant;

    /// Inbox records vanish right after every scan, as if acknowledged
    /// by another caller in between
    struct AcknowledgedDuringScan {
        inner: MemoryStore,
    }

    impl RecordStore for AcknowledgedDuringScan {
        fn put(&self, key: &RecordKey, value: &[u8]) -> MeshResult<()> {
            self.inner.put(key, value)
        }

        fn get(&self, key: &RecordKey) -> MeshResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn list(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, Vec<u8>)>> {
            let records = self.inner.list(prefix)?;
            if prefix.as_str().starts_with("inbox") {
                for (key, _) in &records {
                    self.inner.delete(key)?;
                }
            }
            Ok(records)
        }

        fn delete(&self, key: &RecordKey) -> MeshResult<()> {
            self.inner.delete(key)
        }
    }

    fn test_config() -> MeshConfig {
        MeshConfig::default().with_reply_poll_interval(Duration::from_millis(20))
    }

    fn messenger(store: &MemoryStore, session_id: &str) -> Messenger {
        Messenger::new(session_id, Arc::new(store.clone()), &test_config())
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_promptly() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");

        let start = Instant::now();
        let sent = a.send("nobody", "hello", SendOptions::notification()).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!sent.delivered);
        assert_eq!(sent.message_type, MessageType::Notification);
        assert_eq!(messenger(&store, "nobody").check_messages().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");

        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let sent = a.send("b", "anyone?", SendOptions::request(timeout)).await.unwrap();
        let elapsed = start.elapsed();

        assert!(!sent.delivered);
        assert!(sent.response.is_none());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
        assert_eq!(a.watcher.waiting(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait_and_keeps_target_message() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let sent = a
            .send("b", "long job", SendOptions::request(Duration::from_secs(30)).with_cancel(cancel))
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!sent.delivered);
        assert!(sent.response.is_none());
        assert_eq!(messenger(&store, "b").check_messages().unwrap()[0].id, sent.id);
    }

    #[tokio::test]
    async fn test_request_gets_reply() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let b = messenger(&store, "b");

        let responder = tokio::spawn(async move {
            loop {
                let inbox = b.check_messages().unwrap();
                if let Some(msg) = inbox.first() {
                    b.reply(msg, "pong").unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let timeout = Duration::from_secs(5);
        let start = Instant::now();
        let sent = a.send("b", "ping", SendOptions::request(timeout)).await.unwrap();
        responder.await.unwrap();

        assert!(start.elapsed() < timeout);
        assert!(sent.delivered);
        assert_eq!(sent.response.as_deref(), Some("pong"));
        // The reply slot was consumed
        assert!(MessageStore::new(Arc::new(store.clone()))
            .get_reply("a", &sent.id)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reply_claimed_as_wait_times_out_is_kept() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let request = InterSessionMessage::new("a", "b", "ping", MessageType::Request).with_reply_back(true);

        // Claim the waiter before the timeout, hand the reply over after it
        let watcher = Arc::clone(&a.watcher);
        let original = request.clone();
        let late = tokio::spawn(async move {
            loop {
                if let Some(waiter) = watcher.claim(&original.id) {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    let _ = waiter.send(InterSessionMessage::response_to(&original, "late pong"));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let reply = a.wait_for_reply(&request.id, Duration::from_millis(50), None).await;
        late.await.unwrap();

        assert_eq!(reply.and_then(|r| r.response).as_deref(), Some("late pong"));
    }

    #[tokio::test]
    async fn test_reply_without_reply_back_is_noop() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let b = messenger(&store, "b");

        let sent = a.send("b", "fyi", SendOptions::new()).await.unwrap();
        let inbox = b.check_messages().unwrap();
        let before = store.len();

        assert!(b.reply(&inbox[0], "thanks").unwrap().is_none());
        assert_eq!(store.len(), before);
        assert!(MessageStore::new(Arc::new(store.clone()))
            .get_reply("a", &sent.id)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_check_messages_marks_read_and_peeks() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let b = messenger(&store, "b");

        a.send("b", "one", SendOptions::new()).await.unwrap();
        a.send("b", "two", SendOptions::new()).await.unwrap();
        assert_eq!(b.pending_count().unwrap(), 2);

        let first = b.check_messages().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|m| m.delivered && m.read));
        assert_eq!(b.pending_count().unwrap(), 0);

        let second = b.check_messages().unwrap();
        assert_eq!(second.len(), 2);

        b.acknowledge(&second[0]).unwrap();
        assert_eq!(b.check_messages().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_messages_does_not_resurrect_acknowledged() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        a.send("b", "handled elsewhere", SendOptions::new()).await.unwrap();

        let b = Messenger::new(
            "b",
            Arc::new(AcknowledgedDuringScan { inner: store.clone() }),
            &test_config(),
        );
        assert!(b.check_messages().unwrap().is_empty());
        assert!(MessageStore::new(Arc::new(store.clone())).inbox("b").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_ignores_foreign_message() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let c = messenger(&store, "c");

        let sent = a.send("b", "for b", SendOptions::new()).await.unwrap();
        c.acknowledge(&sent).unwrap();
        assert_eq!(messenger(&store, "b").check_messages().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_matches_filter() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        a.registry().register(Registration::new("coder")).unwrap();
        for id in ["t1", "t2"] {
            messenger(&store, id).registry().register(Registration::new("tester")).unwrap();
        }
        messenger(&store, "r1").registry().register(Registration::new("reviewer")).unwrap();

        assert_eq!(a.broadcast("ping", Some("tester"), None).await.unwrap(), 2);

        for id in ["t1", "t2"] {
            let inbox = messenger(&store, id).check_messages().unwrap();
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].message_type, MessageType::Broadcast);
            assert!(!inbox[0].reply_back);
        }
        assert!(messenger(&store, "r1").check_messages().unwrap().is_empty());
        assert!(a.check_messages().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_old_messages() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        let messages = MessageStore::new(Arc::new(store.clone()));

        let mut old = InterSessionMessage::new("a", "b", "old", MessageType::Request);
        old.timestamp = Utc::now() - chrono::TimeDelta::seconds(600);
        messages.put_inbox(&old).unwrap();
        a.send("b", "new", SendOptions::new()).await.unwrap();

        assert_eq!(a.cleanup_old_messages(Duration::from_secs(300)).unwrap(), 1);
        let remaining = messenger(&store, "b").check_messages().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "new");
    }

    #[tokio::test]
    async fn test_messages_carry_configured_ttl() {
        let store = MemoryStore::new();
        let a = Messenger::new("a", Arc::new(store.clone()), &test_config().with_message_ttl(42));

        let sent = a.send("b", "x", SendOptions::new()).await.unwrap();
        assert_eq!(sent.ttl_seconds, 42);
        assert_eq!(a.cleanup_expired_messages().unwrap(), 0);
    }

    #[test]
    fn test_history_without_transcripts_is_empty() {
        let store = MemoryStore::new();
        let a = messenger(&store, "a");
        assert!(a.get_history("a", DEFAULT_HISTORY_LIMIT, None).is_empty());
    }
}
