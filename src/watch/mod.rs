//! Watcher registry and event fan-out.
//!
//! Each backend owns a [`WatcherHub`]. Registration hands back a bounded
//! channel; two producers feed it: the backend's historical-replay task and
//! the live dispatch performed by every committed mutation. Live dispatch is
//! strictly non-blocking — a watcher whose buffer is full loses the event
//! (slow consumers are shed rather than buffered without bound).
//!
//! A watcher is closed exactly once: a compare-and-swap on its closed flag
//! gates both unregistration and the channel teardown, so no send can race a
//! close.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::server::{Event, WatchResult};

/// Buffered event batches per watcher before the drop policy kicks in.
pub const EVENT_BUFFER_SIZE: usize = 1000;

/// A registered recipient of events for a prefix, starting after a revision.
pub struct Watcher {
    pub id: i64,
    pub prefix: String,
    pub start_revision: i64,
    tx: Mutex<Option<mpsc::Sender<Vec<Event>>>>,
    closed: AtomicBool,
}

impl Watcher {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the watcher closed and releases its sender, so the consumer
    /// observes end-of-stream. Returns true for the one caller that wins the
    /// flag and must unregister the watcher.
    fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.tx.lock().take();

        true
    }

    /// Non-blocking delivery for live dispatch; the batch is dropped when
    /// the buffer is full or the watcher is closed.
    fn try_send(&self, batch: Vec<Event>) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(batch).is_ok(),
            None => false,
        }
    }

    /// Waiting delivery for historical replay. Returns false once the
    /// watcher is gone; replay tasks stop at the first failure.
    pub async fn send(&self, batch: Vec<Event>) -> bool {
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return false,
        };

        !self.is_closed() && tx.send(batch).await.is_ok()
    }
}

/// Keyed registry of all active watchers of one backend.
pub struct WatcherHub {
    watchers: Arc<DashMap<i64, Arc<Watcher>>>,
    next_id: AtomicI64,
}

impl Default for WatcherHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherHub {
    pub fn new() -> Self {
        Self {
            watchers: Arc::new(DashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Registers a watcher and wires its teardown to `token`.
    ///
    /// On cancellation the registry entry is dropped and the sender released,
    /// so the receiver observes end-of-stream once any replay task finishes.
    pub fn subscribe(
        &self,
        token: CancellationToken,
        prefix: &str,
        start_revision: i64,
        current_revision: i64,
    ) -> (Arc<Watcher>, WatchResult) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let watcher = Arc::new(Watcher {
            id,
            prefix: normalize_prefix(prefix).to_string(),
            start_revision,
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });

        self.watchers.insert(id, watcher.clone());
        debug!(id, prefix, start_revision, "watcher registered");

        let watchers = self.watchers.clone();
        let w = watcher.clone();

        tokio::spawn(async move {
            token.cancelled().await;

            if w.close() {
                watchers.remove(&w.id);
                debug!(id = w.id, "watcher closed");
            }
        });

        let result = WatchResult {
            current_revision,
            events: rx,
        };

        (watcher, result)
    }

    /// Live dispatch, called by every mutation after its revision commits.
    ///
    /// An event is skipped per watcher when its revision is at or below the
    /// watcher's start revision, when the key does not carry the watcher's
    /// prefix, or when the watcher is closed.
    pub fn publish(&self, key: &str, event: &Event) {
        let revision = event.revision();

        for entry in self.watchers.iter() {
            let w = entry.value();

            if revision <= w.start_revision {
                continue;
            }

            if !w.prefix.is_empty() && !key.starts_with(&w.prefix) {
                continue;
            }

            if !w.try_send(vec![event.clone()]) {
                debug!(id = w.id, key, revision, "watch event dropped");
            }
        }
    }

    /// Number of live watchers (used by tests).
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

/// Strips the range-sentinel prefix byte and a single trailing separator, so
/// `"\u{ff}registry/"` and `"registry"` watch the same subtree.
pub fn normalize_prefix(prefix: &str) -> &str {
    let prefix = prefix.strip_prefix('\u{ff}').unwrap_or(prefix);

    prefix.strip_suffix('/').unwrap_or(prefix)
}
