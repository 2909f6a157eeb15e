//! SessionRegistry - discovery and liveness for one session
//!
//! A registry is bound to the caller's own session id. It writes only that
//! session's descriptor but can read everyone's:
//!
//! ```ignore
//! let registry = SessionRegistry::new("coder-1", store, Duration::from_secs(60));
//! registry.register(Registration::new("coder"))?;
//!
//! // Later, from a timer
//! registry.heartbeat()?;
//!
//! // Discover a peer
//! if let Some(tester) = registry.find_one(Some("tester"), None)? {
//!     println!("found {}", tester.session_id);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::core::{time, MeshError, MeshResult};
use crate::store::RecordStore;

use super::descriptor::{Registration, SessionDescriptor, SessionStatus};
use super::storage::DescriptorStore;

/// Default age after which `list` reports a session as stale
pub const DEFAULT_STALE_DISPLAY_THRESHOLD: Duration = Duration::from_secs(60);

/// Default age after which `cleanup_stale_sessions` deletes a descriptor
pub const DEFAULT_STALE_CLEANUP_THRESHOLD: Duration = Duration::from_secs(120);

/// Filters applied by [`SessionRegistry::list`]
#[derive(Debug, Clone)]
pub struct SessionFilter {
    pub agent_type: Option<String>,

    /// Compared against the displayed status, so `Active` excludes stale sessions
    pub status: Option<SessionStatus>,

    pub capability: Option<String>,

    pub exclude_self: bool,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            agent_type: None,
            status: None,
            capability: None,
            exclude_self: true,
        }
    }
}

impl SessionFilter {
    /// Match every session except the caller
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Include the caller's own session in results
    pub fn including_self(mut self) -> Self {
        self.exclude_self = false;
        self
    }

    fn matches(&self, own_session_id: &str, descriptor: &SessionDescriptor) -> bool {
        if self.exclude_self && descriptor.session_id == own_session_id {
            return false;
        }
        if let Some(agent_type) = &self.agent_type {
            if &descriptor.agent_type != agent_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if descriptor.status != status {
                return false;
            }
        }
        if let Some(capability) = &self.capability {
            if !descriptor.has_capability(capability) {
                return false;
            }
        }
        true
    }
}

/// Registers the caller's session and discovers peers
#[derive(Clone)]
pub struct SessionRegistry {
    session_id: String,
    descriptors: DescriptorStore,
    stale_threshold: Duration,
}

impl SessionRegistry {
    /// Create a registry for `session_id`
    ///
    /// `stale_threshold` only affects how sessions are displayed; nothing is
    /// deleted until `cleanup_stale_sessions` runs.
    pub fn new(session_id: impl Into<String>, store: Arc<dyn RecordStore>, stale_threshold: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            descriptors: DescriptorStore::new(store),
            stale_threshold,
        }
    }

    /// Get the session ID this registry writes for
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the display staleness threshold
    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Publish a descriptor for this session, replacing any previous one
    pub fn register(&self, registration: Registration) -> MeshResult<SessionDescriptor> {
        let descriptor = SessionDescriptor::new(&self.session_id, registration);
        self.descriptors.save(&descriptor)?;

        tracing::info!(
            session_id = %descriptor.session_id,
            agent_type = %descriptor.agent_type,
            capabilities = ?descriptor.capabilities,
            "Registered session"
        );
        Ok(descriptor)
    }

    /// Refresh `last_active`; returns `false` if this session isn't registered
    pub fn heartbeat(&self) -> MeshResult<bool> {
        let Some(mut descriptor) = self.descriptors.load(&self.session_id)? else {
            tracing::debug!(session_id = %self.session_id, "Heartbeat for unregistered session");
            return Ok(false);
        };
        descriptor.touch();
        self.descriptors.save(&descriptor)?;
        Ok(true)
    }

    /// Change status and current task, refreshing `last_active`
    ///
    /// `current_task: None` clears the task. Returns `None` if this session
    /// isn't registered.
    pub fn update_status(
        &self,
        status: SessionStatus,
        current_task: Option<String>,
    ) -> MeshResult<Option<SessionDescriptor>> {
        if !status.is_persistable() {
            return Err(MeshError::InvalidStatus(status.to_string()));
        }
        let Some(mut descriptor) = self.descriptors.load(&self.session_id)? else {
            return Ok(None);
        };

        descriptor.status = status;
        descriptor.current_task = current_task;
        descriptor.touch();
        self.descriptors.save(&descriptor)?;

        tracing::debug!(session_id = %self.session_id, status = %status, "Updated session status");
        Ok(Some(descriptor))
    }

    /// Remove this session's descriptor
    pub fn unregister(&self) -> MeshResult<()> {
        self.descriptors.delete(&self.session_id)?;
        tracing::info!(session_id = %self.session_id, "Unregistered session");
        Ok(())
    }

    /// This session's stored descriptor, as persisted
    pub fn descriptor(&self) -> MeshResult<Option<SessionDescriptor>> {
        self.descriptors.load(&self.session_id)
    }

    /// Look up any session, with the stale overlay applied
    pub fn get(&self, session_id: &str) -> MeshResult<Option<SessionDescriptor>> {
        let now = Utc::now();
        Ok(self
            .descriptors
            .load(session_id)?
            .map(|descriptor| self.overlay(descriptor, now)))
    }

    /// List sessions matching `filter`, sorted by session id
    ///
    /// Sessions past the staleness threshold are reported with
    /// `SessionStatus::Stale`; storage is not modified.
    pub fn list(&self, filter: &SessionFilter) -> MeshResult<Vec<SessionDescriptor>> {
        let now = Utc::now();
        Ok(self
            .descriptors
            .list()?
            .into_iter()
            .map(|descriptor| self.overlay(descriptor, now))
            .filter(|descriptor| filter.matches(&self.session_id, descriptor))
            .collect())
    }

    /// First active, non-stale peer matching type and capability
    pub fn find_one(
        &self,
        agent_type: Option<&str>,
        capability: Option<&str>,
    ) -> MeshResult<Option<SessionDescriptor>> {
        let mut filter = SessionFilter::new().with_status(SessionStatus::Active);
        filter.agent_type = agent_type.map(str::to_string);
        filter.capability = capability.map(str::to_string);

        Ok(self.list(&filter)?.into_iter().next())
    }

    /// Sessions that name `parent_session_id` as their parent
    pub fn children(&self, parent_session_id: &str) -> MeshResult<Vec<SessionDescriptor>> {
        Ok(self
            .list(&SessionFilter::new().including_self())?
            .into_iter()
            .filter(|d| d.parent_session_id.as_deref() == Some(parent_session_id))
            .collect())
    }

    /// Delete every descriptor idle for longer than `max_age`, whatever its status
    ///
    /// Returns the number of descriptors removed.
    pub fn cleanup_stale_sessions(&self, max_age: Duration) -> MeshResult<usize> {
        let removed = self
            .descriptors
            .purge_inactive_since(time::cutoff(Utc::now(), max_age))?;
        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale sessions");
        }
        Ok(removed)
    }

    fn overlay(&self, mut descriptor: SessionDescriptor, now: chrono::DateTime<Utc>) -> SessionDescriptor {
        descriptor.status = descriptor.display_status(now, self.stale_threshold);
        descriptor
    }
}
