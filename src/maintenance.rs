//! Janitor - periodic garbage collection of expired messages and stale sessions
//!
//! Any process may run a janitor; sweeps from several processes at once are
//! harmless because every delete is idempotent.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::MeshConfig;
use crate::core::{time, MeshResult};
use crate::messaging::MessageStore;
use crate::session::DescriptorStore;
use crate::store::RecordStore;

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub messages_removed: usize,
    pub sessions_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.messages_removed == 0 && self.sessions_removed == 0
    }
}

/// Removes messages past their TTL and descriptors past the cleanup threshold
pub struct Janitor {
    descriptors: DescriptorStore,
    messages: MessageStore,
    config: MeshConfig,
}

impl Janitor {
    pub fn new(store: Arc<dyn RecordStore>, config: MeshConfig) -> Self {
        Self {
            descriptors: DescriptorStore::new(Arc::clone(&store)),
            messages: MessageStore::new(store),
            config,
        }
    }

    /// Run one sweep
    pub fn sweep(&self) -> MeshResult<SweepReport> {
        let now = Utc::now();
        let report = SweepReport {
            messages_removed: self.messages.purge_expired(now)?,
            sessions_removed: self
                .descriptors
                .purge_inactive_since(time::cutoff(now, self.config.stale_cleanup_threshold()))?,
        };

        if report.is_empty() {
            tracing::debug!("Sweep found nothing to remove");
        } else {
            tracing::info!(
                messages_removed = report.messages_removed,
                sessions_removed = report.sessions_removed,
                "Sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `cancel` fires
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        tracing::info!(
            root = %self.config.root_dir.display(),
            interval = ?self.config.sweep_interval(),
            "Janitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                }
            }
        }

        tracing::info!("Janitor stopped");
    }
}
