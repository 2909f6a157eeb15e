//! Messaging between sessions
//!
//! This module provides the infrastructure for session-to-session messages:
//! - `Messenger` - send, check, reply, broadcast and cleanup for one session
//! - `MessageStore` - inbox and reply-slot records
//! - `ReplyWatcher` - shared poll loop waking local requests when replies land
//! - `history` - read-only transcript lookup
//!
//! Sessions never share memory; every message goes through the record store.
//! A request that wants an answer (`reply_back`) gets it through a reply slot
//! keyed by the request id, which only the original sender consumes.

pub mod history;
pub mod message;
pub mod messenger;
pub mod storage;
pub mod watcher;

pub use history::{FileTranscripts, TranscriptEntry, TranscriptSource, DEFAULT_HISTORY_LIMIT};
pub use message::{InterSessionMessage, MessageType, DEFAULT_MESSAGE_TTL_SECS};
pub use messenger::{Messenger, SendOptions};
pub use storage::MessageStore;
pub use watcher::{ReplyWatcher, DEFAULT_POLL_INTERVAL};
