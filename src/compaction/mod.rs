//! Background compaction driver.
//!
//! Compaction itself is a backend operation (it removes version history up to
//! a watermark and sweeps expired tombstones); this module only decides when
//! to call it. Two modes:
//!
//! - Periodic: every N seconds, compact up to `current - retain` revisions
//! - Revision: one-shot compaction to a specific revision

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::server::{Backend, Error};

/// Compaction strategy.
#[derive(Clone, Debug)]
pub enum CompactionMode {
    /// Periodically compact at a fixed interval.
    Periodic(Duration),

    /// Compact to a specific revision (one-shot).
    Revision(i64),
}

/// Drives [`Backend::compact`] from a background task.
pub struct Compactor<B> {
    backend: Arc<B>,
    mode: CompactionMode,

    /// For periodic mode: how many recent revisions to keep out of reach of
    /// the watermark.
    retain_revisions: i64,
}

impl<B: Backend + 'static> Compactor<B> {
    pub fn new(backend: Arc<B>, mode: CompactionMode, retain_revisions: i64) -> Self {
        Self {
            backend,
            mode,
            retain_revisions,
        }
    }

    /// Spawns the driver task.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic(every) => self.run_periodic(every).await,
                CompactionMode::Revision(revision) => self.compact_to(revision).await,
            }
        })
    }

    async fn run_periodic(&self, every: Duration) {
        let mut ticker = interval(every);

        info!(?every, retain = self.retain_revisions, "starting periodic compactor");

        loop {
            ticker.tick().await;

            let current = match self.backend.current_revision().await {
                Ok(current) => current,
                Err(err) => {
                    warn!(%err, "periodic compaction: reading current revision failed");
                    continue;
                }
            };

            let target = current - self.retain_revisions;
            if target > 0 {
                self.compact_to(target).await;
            }
        }
    }

    /// One compaction attempt. An already-compacted watermark is benign.
    pub async fn compact_to(&self, revision: i64) {
        match self.backend.compact(revision).await {
            Ok(compacted) => {
                info!(revision = compacted, "compaction completed");
            }
            Err(Error::Compacted) => {
                debug!(revision, "compaction target already compacted");
            }
            Err(err) => {
                warn!(revision, %err, "compaction failed");
            }
        }
    }
}
