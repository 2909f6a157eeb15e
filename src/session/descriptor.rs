//! Session descriptor types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use crate::core::time;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Running and accepting work
    Active,

    /// Running but not doing anything
    Idle,

    /// Running and occupied with a task
    Busy,

    /// Finished; the descriptor lingers until unregistered or cleaned up
    Terminated,

    /// Derived at read time from `last_active`; never persisted
    Stale,
}

impl SessionStatus {
    /// Check if this status may be written to storage
    pub fn is_persistable(&self) -> bool {
        !matches!(self, SessionStatus::Stale)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and liveness of one session
///
/// One descriptor is stored per session id. Peers discover each other by
/// listing descriptors and filtering on type, status and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    // --- Identity ---
    /// Unique session ID
    pub session_id: String,

    /// Role of the session (e.g., "coder", "tester")
    pub agent_type: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    // --- Liveness ---
    pub started_at: DateTime<Utc>,

    /// Last heartbeat or status update; never moves backwards
    pub last_active: DateTime<Utc>,

    pub status: SessionStatus,

    // --- Work ---
    /// What this session can do, matched by `capability` filters
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,

    // --- Lineage ---
    /// Parent session ID (for hierarchical swarms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,

    // --- Custom Metadata ---
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl SessionDescriptor {
    /// Build a fresh, active descriptor from a registration request
    pub fn new(session_id: impl Into<String>, registration: Registration) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            agent_type: registration.agent_type,
            agent_name: registration.agent_name,
            started_at: now,
            last_active: now,
            status: SessionStatus::Active,
            capabilities: registration.capabilities,
            current_task: None,
            parent_session_id: registration.parent_session_id,
            metadata: registration.metadata,
        }
    }

    /// Move `last_active` forward to `now`; an earlier `now` leaves it unchanged
    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    /// Move `last_active` forward to the current time
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    /// Check if the last heartbeat is more than `threshold` before `now`
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.last_active < time::cutoff(now, threshold)
    }

    /// The status to show at `now`: `Stale` overrides the persisted one
    pub fn display_status(&self, now: DateTime<Utc>, threshold: Duration) -> SessionStatus {
        if self.is_stale_at(now, threshold) {
            SessionStatus::Stale
        } else {
            self.status
        }
    }

    /// Check if this session advertises `capability`
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Check if this session was spawned by another session
    pub fn is_subagent(&self) -> bool {
        self.parent_session_id.is_some()
    }
}

/// What a session announces about itself when registering
///
/// ```ignore
/// let descriptor = registry.register(
///     Registration::new("tester")
///         .with_name("Test Runner")
///         .with_capability("cargo")
///         .with_parent("coordinator-1"),
/// )?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub agent_type: String,
    pub agent_name: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub parent_session_id: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl Registration {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            ..Default::default()
        }
    }

    /// Set the human-readable name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    /// Add one capability
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Add several capabilities
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Link to a parent session
    pub fn with_parent(mut self, parent_session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }

    /// Set a custom metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
