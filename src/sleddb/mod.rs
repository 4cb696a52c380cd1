//! Embedded-LSM backend on sled.
//!
//! sled supplies ordered trees, multi-tree transactions and on-disk
//! compression, but no per-entry version stamps or TTL, so the version chain
//! is explicit: every write appends a row to the `versions` tree under
//! `"{key}\0{mod_revision:be64}"`, and the row payload carries the rest of
//! the [`Version`] record plus the value bytes. Deletion appends a tombstone
//! row instead of removing history, which keeps historical reads and watch
//! replay working until compaction.
//!
//! The revision counter lives in the `meta` tree and advances inside the same
//! sled transaction that inserts the version row, so a revision and the
//! effect that consumed it commit together or not at all. A store-wide write
//! lock serializes mutations; reads run without it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::transaction::TransactionError;
use sled::Transactional;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::{validate_key, Backend, Error, Event, KeyValue, Result, WatchResult};
use crate::version::{head_at, head_live, EventKind, Version};
use crate::watch::{normalize_prefix, Watcher, WatcherHub};

const VERSIONS_TREE: &str = "versions";
const META_TREE: &str = "meta";

const CURRENT_REVISION_KEY: &[u8] = b"current_revision";
const COMPACT_REVISION_KEY: &[u8] = b"compact_revision";

/// Fixed-width header of a version row: create_revision, create_time,
/// expire_time. The mod revision lives in the row key.
const ROW_HEADER_LEN: usize = 24;

/// Configuration for the sled-backed store.
#[derive(Clone, Debug)]
pub struct Config {
    /// Absolute path to the data directory.
    pub data_dir: PathBuf,

    /// Page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages to disk, in milliseconds.
    /// Mutations additionally flush synchronously on commit.
    pub flush_interval_ms: u64,

    /// Enable on-disk compression.
    pub compression: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            compression: true,
        }
    }
}

/// One decoded row of a key's version chain.
#[derive(Clone, Debug)]
struct VersionRow {
    version: Version,
    value: Vec<u8>,
}

/// The sled-backed [`Backend`].
pub struct SledBackend {
    db: sled::Db,
    versions: sled::Tree,
    meta: sled::Tree,
    hub: WatcherHub,
    write_lock: Mutex<()>,
    compact_revision: AtomicI64,
}

impl SledBackend {
    /// Opens (or creates) the store at `config.data_dir`.
    pub fn new(config: Config) -> Result<Self> {
        if !config.data_dir.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "database path must be absolute: {}",
                config.data_dir.display()
            )));
        }

        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .use_compression(config.compression)
            .open()?;

        let versions = db.open_tree(VERSIONS_TREE)?;
        let meta = db.open_tree(META_TREE)?;

        let compacted = meta
            .get(COMPACT_REVISION_KEY)?
            .map(|raw| decode_be(&raw))
            .unwrap_or(0);

        info!(
            path = %config.data_dir.display(),
            cache_size_mb = config.cache_size_mb,
            "sled backend opened"
        );

        Ok(Self {
            db,
            versions,
            meta,
            hub: WatcherHub::new(),
            write_lock: Mutex::new(()),
            compact_revision: AtomicI64::new(compacted),
        })
    }

    fn read_revision(&self) -> Result<i64> {
        Ok(self
            .meta
            .get(CURRENT_REVISION_KEY)?
            .map(|raw| decode_be(&raw))
            .unwrap_or(0))
    }

    /// Loads a key's full version chain, newest first.
    fn chain(&self, key: &str) -> Result<Vec<VersionRow>> {
        let mut rows = Vec::new();

        for item in self.versions.scan_prefix(row_prefix(key)) {
            let (raw_key, raw_value) = item?;
            rows.push(decode_row(&raw_key, &raw_value)?);
        }

        rows.reverse();

        Ok(rows)
    }

    /// Allocates the next revision and inserts the version row in one
    /// transaction. `carried_create_revision` is `None` for a create (the
    /// new revision starts the life) and the life's create revision
    /// otherwise.
    fn append_version(
        &self,
        key: &str,
        carried_create_revision: Option<i64>,
        create_time: i64,
        expire_time: i64,
        value: &[u8],
    ) -> Result<i64> {
        let revision = (&self.versions, &self.meta)
            .transaction(|(versions, meta)| {
                let next = match meta.get(CURRENT_REVISION_KEY)? {
                    Some(raw) => decode_be(&raw) + 1,
                    None => 1,
                };

                let version = Version {
                    create_revision: carried_create_revision.unwrap_or(next),
                    mod_revision: next,
                    create_time,
                    expire_time,
                };

                versions.insert(row_key(key, next), encode_row(&version, value))?;
                meta.insert(CURRENT_REVISION_KEY, next.to_be_bytes().to_vec())?;

                Ok(next)
            })
            .map_err(|err| match err {
                TransactionError::Storage(err) => Error::Engine(err),
                TransactionError::Abort(()) => {
                    Error::Engine(sled::Error::Unsupported("transaction aborted".to_string()))
                }
            })?;

        self.db.flush()?;

        Ok(revision)
    }

    /// Groups every version row under `prefix` by key, chains newest first.
    fn collect_chains(&self, prefix: &str) -> Result<BTreeMap<String, Vec<VersionRow>>> {
        let mut grouped: BTreeMap<String, Vec<VersionRow>> = BTreeMap::new();

        for item in self.versions.scan_prefix(prefix.as_bytes()) {
            let (raw_key, raw_value) = item?;
            let key = decode_row_key(&raw_key)?;
            grouped
                .entry(key)
                .or_default()
                .push(decode_row(&raw_key, &raw_value)?);
        }

        for rows in grouped.values_mut() {
            rows.reverse();
        }

        Ok(grouped)
    }

    /// Shared walk behind `list` and `count`.
    fn collect(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        with_values: bool,
    ) -> Result<(i64, Vec<KeyValue>)> {
        if revision > 0 && revision < self.compact_revision.load(Ordering::SeqCst) {
            return Err(Error::Compacted);
        }

        let now = unix_now();
        let prefix = normalize_prefix(prefix);
        let mut kvs = Vec::new();

        for (key, rows) in self.collect_chains(prefix)? {
            if !start_key.is_empty() && key.as_str() < start_key {
                continue;
            }

            if limit > 0 && kvs.len() as i64 >= limit {
                break;
            }

            let versions: Vec<Version> = rows.iter().map(|r| r.version).collect();
            let selected = if revision == 0 {
                head_live(&versions, now)
            } else {
                head_at(&versions, revision, now)
            };

            if let Some(version) = selected {
                kvs.push(make_kv(&key, version, &rows, with_values));
            }
        }

        Ok((self.read_revision()?, kvs))
    }
}

#[async_trait]
impl Backend for SledBackend {
    async fn start(&self) -> Result<()> {
        // the kubernetes apiserver probes this key before anything else
        match self
            .create("registry/health", br#"{"health":"true"}"#, 0)
            .await
        {
            Ok(_) | Err(Error::KeyExists) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn get(
        &self,
        key: &str,
        _range_end: &str,
        _limit: i64,
        revision: i64,
    ) -> Result<(i64, Option<KeyValue>)> {
        if revision > 0 && revision < self.compact_revision.load(Ordering::SeqCst) {
            return Err(Error::Compacted);
        }

        let now = unix_now();
        let rows = self.chain(key)?;
        let versions: Vec<Version> = rows.iter().map(|r| r.version).collect();

        let selected = if revision == 0 {
            head_live(&versions, now)
        } else {
            head_at(&versions, revision, now)
        };

        let current = self.read_revision()?;

        let Some(version) = selected else {
            return Ok((current, None));
        };

        if version.mod_revision == 0 || version.create_revision == 0 {
            panic!(
                "corrupt version chain: key={key} revision={revision} found={},{}",
                version.create_revision, version.mod_revision
            );
        }

        Ok((current, Some(make_kv(key, version, &rows, true))))
    }

    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64> {
        validate_key(key)?;

        let _guard = self.write_lock.lock();
        let now = unix_now();

        let rows = self.chain(key)?;
        let versions: Vec<Version> = rows.iter().map(|r| r.version).collect();

        if head_live(&versions, now).is_some() {
            return Err(Error::KeyExists);
        }

        let expire_time = if lease > 0 { now + lease } else { 0 };
        let revision = self.append_version(key, None, now, expire_time, value)?;

        debug!(key, revision, "created");

        self.hub.publish(
            key,
            &Event {
                create: true,
                kv: KeyValue {
                    key: key.to_string(),
                    create_revision: revision,
                    mod_revision: revision,
                    value: value.to_vec(),
                    lease,
                },
                ..Default::default()
            },
        );

        Ok(revision)
    }

    async fn update(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        lease: i64,
    ) -> Result<(i64, Option<KeyValue>, bool)> {
        validate_key(key)?;

        let _guard = self.write_lock.lock();
        let now = unix_now();

        let rows = self.chain(key)?;
        let versions: Vec<Version> = rows.iter().map(|r| r.version).collect();

        let head = head_live(&versions, now).ok_or(Error::NotSupported)?;

        if revision > 0 && head.mod_revision != revision {
            return Err(Error::FutureRev);
        }

        let prev_kv = make_kv(key, head, &rows, true);

        let expire_time = if lease > 0 { now + lease } else { 0 };
        let new_revision =
            self.append_version(key, Some(head.create_revision), now, expire_time, value)?;

        let new_kv = KeyValue {
            key: key.to_string(),
            create_revision: head.create_revision,
            mod_revision: new_revision,
            value: value.to_vec(),
            lease,
        };

        debug!(key, revision = new_revision, "updated");

        self.hub.publish(
            key,
            &Event {
                kv: new_kv.clone(),
                prev_kv: Some(prev_kv),
                ..Default::default()
            },
        );

        Ok((new_revision, Some(new_kv), true))
    }

    async fn delete(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>, bool)> {
        validate_key(key)?;

        let _guard = self.write_lock.lock();
        let now = unix_now();

        let rows = self.chain(key)?;
        let versions: Vec<Version> = rows.iter().map(|r| r.version).collect();

        let Some(head) = head_live(&versions, now) else {
            return Ok((self.read_revision()?, None, false));
        };

        if revision > 0 && head.mod_revision != revision {
            return Ok((self.read_revision()?, None, false));
        }

        let prev_kv = make_kv(key, head, &rows, true);

        // a tombstone row: expiry pinned at the write instant
        let new_revision = self.append_version(key, Some(head.create_revision), now, now, &[])?;

        debug!(key, revision = new_revision, "deleted");

        self.hub.publish(
            key,
            &Event {
                delete: true,
                kv: KeyValue {
                    key: key.to_string(),
                    mod_revision: new_revision,
                    ..Default::default()
                },
                prev_kv: Some(prev_kv.clone()),
                ..Default::default()
            },
        );

        Ok((new_revision, Some(prev_kv), true))
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>)> {
        self.collect(prefix, start_key, limit, revision, true)
    }

    async fn count(&self, prefix: &str, start_key: &str, revision: i64) -> Result<(i64, i64)> {
        let (current, kvs) = self.collect(prefix, start_key, 0, revision, false)?;

        Ok((current, kvs.len() as i64))
    }

    async fn watch(
        &self,
        token: CancellationToken,
        prefix: &str,
        start_revision: i64,
    ) -> WatchResult {
        let current = self.read_revision().unwrap_or(0);
        let (watcher, result) = self.hub.subscribe(token.clone(), prefix, start_revision, current);

        if start_revision > 0 && start_revision < current {
            let versions = self.versions.clone();
            let prefix = normalize_prefix(prefix).to_string();

            tokio::spawn(async move {
                replay_history(versions, watcher, token, prefix, start_revision, current).await;
            });
        }

        result
    }

    async fn compact(&self, revision: i64) -> Result<i64> {
        let _guard = self.write_lock.lock();

        let current = self.read_revision()?;
        let target = if revision <= 0 { current } else { revision };

        if target <= self.compact_revision.load(Ordering::SeqCst) {
            return Ok(target);
        }

        let now = unix_now();
        let mut batch = sled::Batch::default();
        let mut removed = 0u64;

        for (key, rows) in self.collect_chains("")? {
            let versions: Vec<Version> = rows.iter().map(|r| r.version).collect();
            let live_head = head_live(&versions, now).map(|v| v.mod_revision);

            // once a tombstone lies in the past, its whole life goes with it
            let tombstone_cutoff = versions
                .iter()
                .filter(|v| v.is_tombstone() && v.has_expired(now))
                .map(|v| v.mod_revision)
                .max()
                .unwrap_or(i64::MIN);

            for version in &versions {
                if Some(version.mod_revision) == live_head {
                    continue;
                }

                if version.mod_revision <= target
                    || version.has_expired(now)
                    || version.mod_revision <= tombstone_cutoff
                {
                    batch.remove(row_key(&key, version.mod_revision));
                    removed += 1;
                }
            }
        }

        self.versions.apply_batch(batch)?;
        self.meta
            .insert(COMPACT_REVISION_KEY, target.to_be_bytes().to_vec())?;
        self.compact_revision.store(target, Ordering::SeqCst);
        self.db.flush()?;

        info!(target, removed, "compacted");

        Ok(target)
    }

    async fn current_revision(&self) -> Result<i64> {
        self.read_revision()
    }

    async fn db_size(&self) -> Result<i64> {
        Ok(self.db.size_on_disk()? as i64)
    }
}

/// Replays `(start_revision, end_revision]` for one watcher: per key the
/// newest version in the window, as one event batch per event, ordered by
/// revision ascending.
async fn replay_history(
    versions: sled::Tree,
    watcher: std::sync::Arc<Watcher>,
    token: CancellationToken,
    prefix: String,
    start_revision: i64,
    end_revision: i64,
) {
    let mut grouped: BTreeMap<String, Vec<VersionRow>> = BTreeMap::new();

    for item in versions.scan_prefix(prefix.as_bytes()) {
        let row = item
            .map_err(|err| warn!(%err, "historical replay scan failed"))
            .ok()
            .and_then(|(raw_key, raw_value)| {
                let key = decode_row_key(&raw_key).ok()?;
                let row = decode_row(&raw_key, &raw_value).ok()?;
                Some((key, row))
            });

        let Some((key, row)) = row else {
            continue;
        };

        grouped.entry(key).or_default().push(row);
    }

    let mut events = Vec::new();

    for (key, rows) in &grouped {
        let Some(row) = rows
            .iter()
            .filter(|r| {
                r.version.mod_revision > start_revision && r.version.mod_revision <= end_revision
            })
            .max_by_key(|r| r.version.mod_revision)
        else {
            continue;
        };

        if let Some(event) = replay_event(key, row, rows) {
            events.push(event);
        }
    }

    events.sort_by_key(|event| event.revision());

    for event in events {
        tokio::select! {
            _ = token.cancelled() => return,
            sent = watcher.send(vec![event]) => {
                if !sent {
                    return;
                }
            }
        }
    }
}

/// Builds the replayed event for a key's newest in-window version, deriving
/// the kind from the version record.
fn replay_event(key: &str, row: &VersionRow, rows: &[VersionRow]) -> Option<Event> {
    let version = row.version;
    let prev_kv = || {
        rows.iter()
            .filter(|r| {
                r.version.mod_revision < version.mod_revision
                    && !r.version.is_tombstone()
                    && !r.version.has_expired(version.create_time)
            })
            .max_by_key(|r| r.version.mod_revision)
            .map(|r| row_kv(key, r))
    };

    match version.event_kind() {
        EventKind::Create => Some(Event {
            create: true,
            kv: row_kv(key, row),
            ..Default::default()
        }),
        EventKind::Update => Some(Event {
            kv: row_kv(key, row),
            prev_kv: prev_kv(),
            ..Default::default()
        }),
        EventKind::Delete => Some(Event {
            delete: true,
            kv: KeyValue {
                key: key.to_string(),
                mod_revision: version.mod_revision,
                ..Default::default()
            },
            prev_kv: prev_kv(),
            ..Default::default()
        }),
        EventKind::Unknown => None,
    }
}

fn row_kv(key: &str, row: &VersionRow) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        create_revision: row.version.create_revision,
        mod_revision: row.version.mod_revision,
        value: row.value.clone(),
        lease: row.version.lease_ttl(),
    }
}

/// Builds the outgoing KeyValue for a selected version of a chain.
fn make_kv(key: &str, version: Version, rows: &[VersionRow], with_value: bool) -> KeyValue {
    let value = if with_value {
        rows.iter()
            .find(|r| r.version.mod_revision == version.mod_revision)
            .map(|r| r.value.clone())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    KeyValue {
        key: key.to_string(),
        create_revision: version.create_revision,
        mod_revision: version.mod_revision,
        value,
        lease: version.lease_ttl(),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn decode_be(raw: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);

    i64::from_be_bytes(buf)
}

fn row_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(0);

    prefix
}

fn row_key(key: &str, revision: i64) -> Vec<u8> {
    let mut raw = row_prefix(key);
    raw.extend_from_slice(&revision.to_be_bytes());

    raw
}

fn decode_row_key(raw: &[u8]) -> Result<String> {
    let sep = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| corrupt("version row key without separator"))?;

    String::from_utf8(raw[..sep].to_vec()).map_err(|_| corrupt("version row key is not UTF-8"))
}

fn encode_row(version: &Version, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ROW_HEADER_LEN + value.len());
    buf.extend_from_slice(&version.create_revision.to_le_bytes());
    buf.extend_from_slice(&version.create_time.to_le_bytes());
    buf.extend_from_slice(&version.expire_time.to_le_bytes());
    buf.extend_from_slice(value);

    buf
}

fn decode_row(raw_key: &[u8], raw_value: &[u8]) -> Result<VersionRow> {
    if raw_key.len() < 9 || raw_value.len() < ROW_HEADER_LEN {
        return Err(corrupt("version row too short"));
    }

    let mod_revision = {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw_key[raw_key.len() - 8..]);
        i64::from_be_bytes(buf)
    };

    let field = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw_value[at..at + 8]);
        i64::from_le_bytes(buf)
    };

    Ok(VersionRow {
        version: Version {
            create_revision: field(0),
            mod_revision,
            create_time: field(8),
            expire_time: field(16),
        },
        value: raw_value[ROW_HEADER_LEN..].to_vec(),
    })
}

fn corrupt(message: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    ))
}
