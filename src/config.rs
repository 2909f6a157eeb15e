//! Mesh Configuration
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "root_dir": "/tmp/shadow-mesh",
//!   "stale_display_secs": 60,
//!   "stale_cleanup_secs": 120,
//!   "reply_poll_interval_ms": 250
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{MeshError, MeshResult};
use crate::messaging::history::FileTranscripts;
use crate::messaging::{DEFAULT_MESSAGE_TTL_SECS, DEFAULT_POLL_INTERVAL};
use crate::session::{DEFAULT_STALE_CLEANUP_THRESHOLD, DEFAULT_STALE_DISPLAY_THRESHOLD};
use crate::store::FileStore;

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "SHADOW_MESH_CONFIG";

/// Environment variable overriding `root_dir`
pub const ROOT_ENV: &str = "SHADOW_MESH_ROOT";

/// Environment variable overriding `transcripts_dir`
pub const TRANSCRIPTS_ENV: &str = "SHADOW_MESH_TRANSCRIPTS";

/// Configuration shared by every session on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Directory holding descriptors, inboxes and reply slots
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Directory holding `<session_id>/history.jsonl` transcripts
    #[serde(default = "default_transcripts_dir")]
    pub transcripts_dir: Option<PathBuf>,

    /// Age after which a session is listed as stale
    #[serde(default = "default_stale_display_secs")]
    pub stale_display_secs: u64,

    /// Age after which maintenance deletes a session's descriptor
    #[serde(default = "default_stale_cleanup_secs")]
    pub stale_cleanup_secs: u64,

    /// TTL stamped on outgoing messages and used by maintenance
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,

    #[serde(default = "default_reply_poll_interval_ms")]
    pub reply_poll_interval_ms: u64,

    /// Reply timeout used when a request doesn't set one
    #[serde(default = "default_reply_timeout_secs")]
    pub default_reply_timeout_secs: u64,

    /// Interval between maintenance sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Write JSON logs to daily files in this directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".shadow-mesh")
}

fn default_transcripts_dir() -> Option<PathBuf> {
    Some(PathBuf::from("sessions"))
}

fn default_stale_display_secs() -> u64 {
    DEFAULT_STALE_DISPLAY_THRESHOLD.as_secs()
}

fn default_stale_cleanup_secs() -> u64 {
    DEFAULT_STALE_CLEANUP_THRESHOLD.as_secs()
}

fn default_message_ttl_secs() -> u64 {
    DEFAULT_MESSAGE_TTL_SECS
}

fn default_reply_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_reply_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            transcripts_dir: default_transcripts_dir(),
            stale_display_secs: default_stale_display_secs(),
            stale_cleanup_secs: default_stale_cleanup_secs(),
            message_ttl_secs: default_message_ttl_secs(),
            reply_poll_interval_ms: default_reply_poll_interval_ms(),
            default_reply_timeout_secs: default_reply_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            log_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl MeshConfig {
    /// Create a default configuration rooted at `root_dir`
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: MeshConfig = serde_json::from_str(&content)
            .map_err(|e| MeshError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from the environment
    ///
    /// Reads the file named by `SHADOW_MESH_CONFIG` if set, then applies
    /// `SHADOW_MESH_ROOT` and `SHADOW_MESH_TRANSCRIPTS` overrides.
    pub fn from_env() -> MeshResult<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(root) = std::env::var_os(ROOT_ENV) {
            config.root_dir = PathBuf::from(root);
        }
        if let Some(dir) = std::env::var_os(TRANSCRIPTS_ENV) {
            config.transcripts_dir = Some(PathBuf::from(dir));
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the values make sense together
    pub fn validate(&self) -> MeshResult<()> {
        if self.reply_poll_interval_ms == 0 {
            return Err(MeshError::InvalidConfig("reply_poll_interval_ms must be > 0".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(MeshError::InvalidConfig("sweep_interval_secs must be > 0".into()));
        }
        // A session should be shown as stale before it disappears
        if self.stale_cleanup_secs < self.stale_display_secs {
            return Err(MeshError::InvalidConfig(format!(
                "stale_cleanup_secs ({}) must not be below stale_display_secs ({})",
                self.stale_cleanup_secs, self.stale_display_secs
            )));
        }
        Ok(())
    }

    pub fn with_transcripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcripts_dir = Some(dir.into());
        self
    }

    pub fn with_stale_thresholds(mut self, display_secs: u64, cleanup_secs: u64) -> Self {
        self.stale_display_secs = display_secs;
        self.stale_cleanup_secs = cleanup_secs;
        self
    }

    pub fn with_message_ttl(mut self, ttl_secs: u64) -> Self {
        self.message_ttl_secs = ttl_secs;
        self
    }

    /// Set the reply poll interval, rounded up to whole milliseconds
    pub fn with_reply_poll_interval(mut self, interval: Duration) -> Self {
        let millis = interval.as_micros().div_ceil(1000);
        self.reply_poll_interval_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    pub fn with_default_reply_timeout(mut self, timeout_secs: u64) -> Self {
        self.default_reply_timeout_secs = timeout_secs;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn stale_display_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_display_secs)
    }

    pub fn stale_cleanup_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_cleanup_secs)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn reply_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reply_poll_interval_ms)
    }

    pub fn default_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.default_reply_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// File store at `root_dir`
    pub fn file_store(&self) -> FileStore {
        FileStore::new(&self.root_dir)
    }

    /// Transcript reader at `transcripts_dir`, if configured
    pub fn transcripts(&self) -> Option<FileTranscripts> {
        self.transcripts_dir.as_ref().map(FileTranscripts::new)
    }
}
