pub mod core;
pub mod store;
pub mod session;
pub mod messaging;

// Configuration and process setup
pub mod config;
pub mod logging;

// Periodic cleanup of time-limited state
pub mod maintenance;

pub use config::MeshConfig;
pub use core::{MeshError, MeshResult};
pub use maintenance::{Janitor, SweepReport};
pub use messaging::{InterSessionMessage, MessageType, Messenger, SendOptions};
pub use session::{Registration, SessionDescriptor, SessionFilter, SessionRegistry, SessionStatus};
pub use store::{FileStore, MemoryStore, RecordStore};

/// Generate a fresh session id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
