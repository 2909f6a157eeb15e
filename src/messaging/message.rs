use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::time;

/// Default time-to-live for a message, in seconds
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 300;

/// Kind of inter-session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Broadcast,
}

/// One unit of communication between sessions
///
/// Stored in the target's inbox under `(to_session, id)`. If `reply_back` is
/// set, the answer goes to the reply slot `(from_session, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterSessionMessage {
    pub id: String,
    pub from_session: String,
    pub to_session: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,

    /// ID of the message this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// The sender is waiting for an answer
    #[serde(default)]
    pub reply_back: bool,

    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,

    /// The target has seen the message; on a returned request, the reply arrived
    #[serde(default)]
    pub delivered: bool,

    #[serde(default)]
    pub read: bool,

    /// Reply text, filled in on the sender's copy once the answer is consumed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

fn default_ttl() -> u64 {
    DEFAULT_MESSAGE_TTL_SECS
}

impl InterSessionMessage {
    /// Create a new message with a fresh id
    pub fn new(
        from_session: impl Into<String>,
        to_session: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_session: from_session.into(),
            to_session: to_session.into(),
            content: content.into(),
            timestamp: Utc::now(),
            message_type,
            reply_to: None,
            reply_back: false,
            ttl_seconds: DEFAULT_MESSAGE_TTL_SECS,
            delivered: false,
            read: false,
            response: None,
        }
    }

    /// Build the reply-slot record answering `original`
    pub fn response_to(original: &InterSessionMessage, response: impl Into<String>) -> Self {
        let response = response.into();
        let mut reply = Self::new(
            &original.to_session,
            &original.from_session,
            response.clone(),
            MessageType::Response,
        );
        reply.reply_to = Some(original.id.clone());
        reply.ttl_seconds = original.ttl_seconds;
        reply.response = Some(response);
        reply
    }

    pub fn with_reply_back(mut self, reply_back: bool) -> Self {
        self.reply_back = reply_back;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Mark as seen by the target; returns `true` if anything changed
    pub fn mark_read(&mut self) -> bool {
        let changed = !(self.delivered && self.read);
        self.delivered = true;
        self.read = true;
        changed
    }

    /// Check if the message is older than `max_age` at `now`
    pub fn is_older_than(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.timestamp < time::cutoff(now, max_age)
    }

    /// Check if the message outlived its own TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_older_than(now, Duration::from_secs(self.ttl_seconds))
    }
}
