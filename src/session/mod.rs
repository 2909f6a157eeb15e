//! Session discovery
//!
//! This module provides `SessionRegistry` for publishing a session's
//! descriptor, keeping it alive with heartbeats, and finding peers by
//! type, status and capability.
//!
//! Sessions can be linked via `parent_session_id` for hierarchical swarms.

pub mod descriptor;
pub mod registry;
pub mod storage;

pub use descriptor::{Registration, SessionDescriptor, SessionStatus};
pub use registry::{
    SessionFilter, SessionRegistry, DEFAULT_STALE_CLEANUP_THRESHOLD, DEFAULT_STALE_DISPLAY_THRESHOLD,
};
pub use storage::DescriptorStore;
