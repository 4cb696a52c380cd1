//! The backend contract shared by every storage driver.
//!
//! Consumers (the gRPC shim, CLIs, tests) bind to the [`Backend`] trait and
//! the [`KeyValue`]/[`Event`] record shapes defined here, never to a concrete
//! driver. Exactly one backend is bound per process.
//!
//! Revision discipline: every mutating operation that takes effect consumes
//! exactly one value from the store-wide monotonic revision counter, and the
//! counter advances only together with the durable effect that consumed it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by backend operations.
#[derive(Error, Debug)]
pub enum Error {
    /// `create` on a key with a live (non-expired, non-tombstoned) head.
    #[error("key exists")]
    KeyExists,

    /// The key has no live head.
    #[error("key not found")]
    NotFound,

    /// `update` on an absent or dead key.
    #[error("operation not supported on an absent key")]
    NotSupported,

    /// The caller's revision does not match the key's current head.
    #[error("required revision is a future revision")]
    FutureRev,

    /// The requested revision has already been compacted away.
    #[error("required revision has been compacted")]
    Compacted,

    /// Malformed key (empty, embedded NUL, leading `\xff`, path escape).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid store construction parameters (e.g. a relative root path).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A key-value pair together with its MVCC metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    /// The key, an opaque path-like string.
    pub key: String,

    /// Revision at which the current life of the key began.
    pub create_revision: i64,

    /// Revision of the most recent mutation in that life.
    pub mod_revision: i64,

    /// The value bytes (may be empty).
    pub value: Vec<u8>,

    /// TTL in seconds recorded at write time, 0 when unleased.
    pub lease: i64,
}

/// A single change notification delivered to watchers.
///
/// A create carries no `prev_kv`; a delete carries a key-only `kv` whose
/// `mod_revision` is the tombstone revision, with `prev_kv` describing the
/// last live value; an update carries both.
#[derive(Clone, Debug, Default)]
pub struct Event {
    pub create: bool,
    pub delete: bool,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    /// The revision this event was committed at.
    pub fn revision(&self) -> i64 {
        if self.kv.mod_revision > 0 {
            return self.kv.mod_revision;
        }

        self.prev_kv.as_ref().map_or(-1, |kv| kv.mod_revision)
    }
}

/// The stream handle returned by [`Backend::watch`].
///
/// `current_revision` is the store revision at registration time; historical
/// replay (if any) covers `(start_revision, current_revision]` and live
/// events carry revisions greater than `current_revision`.
#[derive(Debug)]
pub struct WatchResult {
    pub current_revision: i64,
    pub events: mpsc::Receiver<Vec<Event>>,
}

/// The capability set every storage driver implements.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One-time initialization after construction (seeds the health key).
    async fn start(&self) -> Result<()>;

    /// Reads a single key at `revision` (0 means latest). Returns the current
    /// store revision and the visible version, if any.
    async fn get(
        &self,
        key: &str,
        range_end: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Option<KeyValue>)>;

    /// Creates a key, starting a new life. Fails with [`Error::KeyExists`]
    /// when a live head is present.
    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64>;

    /// Replaces the live head, preserving its create revision. `revision > 0`
    /// demands the head matches; `revision == 0` accepts any head.
    async fn update(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        lease: i64,
    ) -> Result<(i64, Option<KeyValue>, bool)>;

    /// Tombstones the live head. A mismatched `revision` reports
    /// `deleted == false` without error.
    async fn delete(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>, bool)>;

    /// Lists all keys under `prefix` at `revision`, ascending by key,
    /// starting at `start_key`, clipped to `limit` when positive.
    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>)>;

    /// Counts distinct keys under `prefix` at `revision` without reading
    /// values.
    async fn count(&self, prefix: &str, start_key: &str, revision: i64) -> Result<(i64, i64)>;

    /// Registers a watcher for `prefix` starting after `start_revision`.
    /// Cancelling `token` unregisters the watcher and closes the stream.
    async fn watch(
        &self,
        token: CancellationToken,
        prefix: &str,
        start_revision: i64,
    ) -> WatchResult;

    /// Removes version history up to `revision` (≤ 0 means up to current)
    /// and sweeps expired-TTL versions. Does not advance the counter.
    async fn compact(&self, revision: i64) -> Result<i64>;

    /// The highest revision allocated so far (0 if none).
    async fn current_revision(&self) -> Result<i64>;

    /// Total size in bytes of the persisted store.
    async fn db_size(&self) -> Result<i64>;
}

/// Validates a key at mutation entry.
///
/// Keys are opaque path-like strings: non-empty, no NUL byte, no leading
/// `\xff`, and no segment that would escape the store root on a filesystem
/// substrate.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("empty key".to_string()));
    }

    if key.contains('\0') {
        return Err(Error::InvalidKey("embedded NUL byte".to_string()));
    }

    if key.starts_with('\u{ff}') {
        return Err(Error::InvalidKey("leading \\xff".to_string()));
    }

    if key.starts_with('/') {
        return Err(Error::InvalidKey(format!("absolute path: {key}")));
    }

    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(Error::InvalidKey(format!("path escape: {key}")));
    }

    Ok(())
}
