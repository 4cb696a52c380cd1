//! Filesystem backend: a directory per key, a file per version.
//!
//! Layout under an absolute store root:
//!
//! ```text
//! <root>/counter                                      last allocated revision
//! <root>/<key>/<createRev:20>.<modRev:20>.<ctime>.<expireTime>
//! ```
//!
//! File contents are the opaque value bytes; all metadata lives in the name.
//! Deletion renames the live version file to a tombstone name
//! (`expireTime == ctime`) in place, so the value bytes become the
//! tombstone's payload and readers never observe a partial state.
//!
//! One in-process `actions` mutex serializes every operation that interleaves
//! revision allocation with directory traversal; the counter file has its own
//! lock. The counter is advanced before the version write, so an aborted
//! write leaves a gap revision that produces no events.

mod counter;
mod fsio;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::server::{validate_key, Backend, Error, Event, KeyValue, Result, WatchResult};
use crate::version::{head_at, head_live, EventKind, Version};
use crate::watch::{normalize_prefix, Watcher, WatcherHub};

pub use counter::{RevisionCounter, COUNTER_FILE_NAME};

/// The filesystem [`Backend`].
pub struct LocalFsBackend {
    root: PathBuf,
    counter: RevisionCounter,
    hub: WatcherHub,
    actions_lock: Mutex<()>,

    /// Highest compaction target seen so far; `None` until the first
    /// compaction, so a fresh store accepts any target. Only touched under
    /// `actions_lock`.
    compacted_revision: Mutex<Option<i64>>,
}

impl LocalFsBackend {
    /// Opens (or creates) the store rooted at `root`, which must be an
    /// absolute path.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "database path must be absolute: {}",
                root.display()
            )));
        }

        fs::create_dir_all(&root)?;

        let counter = RevisionCounter::new(root.join(COUNTER_FILE_NAME));

        info!(root = %root.display(), "localfs backend opened");

        Ok(Self {
            root,
            counter,
            hub: WatcherHub::new(),
            actions_lock: Mutex::new(()),
            compacted_revision: Mutex::new(None),
        })
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// The key's chain, newest first. A missing directory is an empty chain.
    fn versions_of(&self, key: &str) -> Result<Vec<Version>> {
        Ok(fsio::read_dir_versions(&self.key_dir(key))?)
    }

    /// Selects and reads the version visible at `revision` (0 means latest).
    fn load(&self, key: &str, revision: i64, now: i64) -> Result<Option<(Version, Vec<u8>)>> {
        let versions = self.versions_of(key)?;

        let selected = if revision == 0 {
            head_live(&versions, now)
        } else {
            head_at(&versions, revision, now)
        };

        let Some(version) = selected else {
            return Ok(None);
        };

        match fs::read(self.key_dir(key).join(version.to_string())) {
            Ok(content) => Ok(Some((version, content))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Allocates a revision and writes the version file exclusively.
    /// `carried_create_revision == 0` starts a new life.
    fn write_version(
        &self,
        key: &str,
        value: &[u8],
        carried_create_revision: i64,
        lease: i64,
        now: i64,
    ) -> Result<KeyValue> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)?;

        let mod_revision = self.counter.increment()?;

        let version = Version {
            create_revision: if carried_create_revision == 0 {
                mod_revision
            } else {
                carried_create_revision
            },
            mod_revision,
            create_time: now,
            expire_time: if lease > 0 { now + lease } else { 0 },
        };

        fsio::write_version_file(&dir.join(version.to_string()), value)?;

        Ok(KeyValue {
            key: key.to_string(),
            create_revision: version.create_revision,
            mod_revision,
            value: value.to_vec(),
            lease,
        })
    }

    /// Shared walk behind `list` and `count`: one KeyValue per key visible at
    /// `revision`, ascending by key.
    fn select_kvs(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        with_content: bool,
        now: i64,
    ) -> Result<Vec<KeyValue>> {
        let prefix = normalize_prefix(prefix);
        let mut chains: BTreeMap<String, Vec<Version>> = BTreeMap::new();

        for (key, version) in fsio::walk_versions(&self.root)? {
            if !prefix.is_empty() && !key.starts_with(prefix) {
                continue;
            }

            chains.entry(key).or_default().push(version);
        }

        let mut kvs = Vec::new();

        for (key, mut versions) in chains {
            if !start_key.is_empty() && key.as_str() < start_key {
                continue;
            }

            if limit > 0 && kvs.len() as i64 >= limit {
                break;
            }

            versions.sort_by_key(|v| std::cmp::Reverse(v.mod_revision));

            let selected = if revision == 0 {
                head_live(&versions, now)
            } else {
                head_at(&versions, revision, now)
            };

            let Some(version) = selected else {
                continue;
            };

            let value = if with_content {
                match fs::read(self.key_dir(&key).join(version.to_string())) {
                    Ok(content) => content,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                }
            } else {
                Vec::new()
            };

            kvs.push(KeyValue {
                key,
                create_revision: version.create_revision,
                mod_revision: version.mod_revision,
                value,
                lease: version.lease_ttl(),
            });
        }

        Ok(kvs)
    }
}

#[async_trait]
impl Backend for LocalFsBackend {
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
        let _guard = self.actions_lock.lock();
        let now = unix_now();

        let loaded = self.load(key, revision, now)?;
        let current = self.counter.read();

        let Some((version, content)) = loaded else {
            return Ok((current, None));
        };

        if version.mod_revision == 0 || version.create_revision == 0 {
            panic!(
                "corrupt version file for key={key} revision={revision} found={},{}",
                version.create_revision, version.mod_revision
            );
        }

        let kv = KeyValue {
            key: key.to_string(),
            create_revision: version.create_revision,
            mod_revision: version.mod_revision,
            value: content,
            lease: version.lease_ttl(),
        };

        Ok((current, Some(kv)))
    }

    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64> {
        validate_key(key)?;

        let _guard = self.actions_lock.lock();
        let now = unix_now();

        if head_live(&self.versions_of(key)?, now).is_some() {
            return Err(Error::KeyExists);
        }

        let kv = self.write_version(key, value, 0, lease, now)?;

        debug!(key, revision = kv.mod_revision, "created");

        self.hub.publish(
            key,
            &Event {
                create: true,
                kv: kv.clone(),
                ..Default::default()
            },
        );

        Ok(kv.mod_revision)
    }

    async fn update(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        lease: i64,
    ) -> Result<(i64, Option<KeyValue>, bool)> {
        validate_key(key)?;

        let _guard = self.actions_lock.lock();
        let now = unix_now();

        let Some((head, content)) = self.load(key, 0, now)? else {
            // absent key: not updated, no error
            return Ok((self.counter.read(), None, false));
        };

        let prev_kv = KeyValue {
            key: key.to_string(),
            create_revision: head.create_revision,
            mod_revision: head.mod_revision,
            value: content,
            lease: head.lease_ttl(),
        };

        if revision > 0 && head.mod_revision != revision {
            return Ok((prev_kv.mod_revision, Some(prev_kv), false));
        }

        let new_kv = self.write_version(key, value, head.create_revision, lease, now)?;

        debug!(key, revision = new_kv.mod_revision, "updated");

        self.hub.publish(
            key,
            &Event {
                kv: new_kv.clone(),
                prev_kv: Some(prev_kv),
                ..Default::default()
            },
        );

        Ok((new_kv.mod_revision, Some(new_kv), true))
    }

    async fn delete(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>, bool)> {
        validate_key(key)?;

        let _guard = self.actions_lock.lock();
        let now = unix_now();

        let Some((head, content)) = self.load(key, 0, now)? else {
            return Ok((self.counter.read(), None, false));
        };

        if revision > 0 && head.mod_revision != revision {
            return Ok((self.counter.read(), None, false));
        }

        let dir = self.key_dir(key);
        let old_path = dir.join(head.to_string());

        let tombstone = Version {
            create_revision: head.create_revision,
            mod_revision: self.counter.increment()?,
            create_time: now,
            expire_time: now,
        };

        // the rename is the commit point: value bytes become the tombstone's
        // payload and readers never see a half-deleted key
        match fs::rename(&old_path, dir.join(tombstone.to_string())) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok((self.counter.read(), None, false));
            }
            Err(err) => return Err(err.into()),
        }

        let prev_kv = KeyValue {
            key: key.to_string(),
            create_revision: head.create_revision,
            mod_revision: head.mod_revision,
            value: content,
            lease: head.lease_ttl(),
        };

        debug!(key, revision = tombstone.mod_revision, "deleted");

        self.hub.publish(
            key,
            &Event {
                delete: true,
                kv: KeyValue {
                    key: key.to_string(),
                    mod_revision: tombstone.mod_revision,
                    ..Default::default()
                },
                prev_kv: Some(prev_kv.clone()),
                ..Default::default()
            },
        );

        Ok((tombstone.mod_revision, Some(prev_kv), true))
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>)> {
        let _guard = self.actions_lock.lock();
        let now = unix_now();

        let kvs = self.select_kvs(prefix, start_key, limit, revision, true, now)?;

        Ok((self.counter.read(), kvs))
    }

    async fn count(&self, prefix: &str, start_key: &str, revision: i64) -> Result<(i64, i64)> {
        let _guard = self.actions_lock.lock();
        let now = unix_now();

        let kvs = self.select_kvs(prefix, start_key, 0, revision, false, now)?;

        Ok((self.counter.read(), kvs.len() as i64))
    }

    async fn watch(
        &self,
        token: CancellationToken,
        prefix: &str,
        start_revision: i64,
    ) -> WatchResult {
        let current = self.counter.read();
        let (watcher, result) = self.hub.subscribe(token.clone(), prefix, start_revision, current);

        if start_revision > 0 && start_revision < current {
            let root = self.root.clone();
            let prefix = normalize_prefix(prefix).to_string();

            tokio::spawn(async move {
                replay_history(root, watcher, token, prefix, start_revision, current).await;
            });
        }

        result
    }

    async fn compact(&self, revision: i64) -> Result<i64> {
        let _guard = self.actions_lock.lock();

        let current = self.counter.read();
        let target = if revision <= 0 { current } else { revision };

        let mut compacted = self.compacted_revision.lock();
        if compacted.map_or(false, |watermark| target <= watermark) {
            return Err(Error::Compacted);
        }

        let now = unix_now();
        let mut chains: BTreeMap<String, Vec<Version>> = BTreeMap::new();

        for (key, version) in fsio::walk_versions(&self.root)? {
            chains.entry(key).or_default().push(version);
        }

        let mut removed = 0u64;

        for (key, mut versions) in chains {
            versions.sort_by_key(|v| std::cmp::Reverse(v.mod_revision));

            let live_head = head_live(&versions, now).map(|v| v.mod_revision);

            // once a tombstone lies in the past, its whole life goes with it
            let tombstone_cutoff = versions
                .iter()
                .filter(|v| v.is_tombstone() && v.has_expired(now))
                .map(|v| v.mod_revision)
                .max()
                .unwrap_or(i64::MIN);

            let dir = self.key_dir(&key);

            for version in &versions {
                if Some(version.mod_revision) == live_head {
                    continue;
                }

                if version.mod_revision <= target
                    || version.has_expired(now)
                    || version.mod_revision <= tombstone_cutoff
                {
                    if fs::remove_file(dir.join(version.to_string())).is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        fsio::prune_empty_dirs(&self.root)?;
        *compacted = Some(target);

        info!(target, removed, "compacted");

        Ok(target)
    }

    async fn current_revision(&self) -> Result<i64> {
        Ok(self.counter.read())
    }

    async fn db_size(&self) -> Result<i64> {
        Ok(fsio::tree_size(&self.root)?)
    }
}

/// Replays `(start_revision, end_revision]` for one watcher: per key the
/// newest version file in the window, as one event batch per event, ordered
/// by revision ascending.
async fn replay_history(
    root: PathBuf,
    watcher: Arc<Watcher>,
    token: CancellationToken,
    prefix: String,
    start_revision: i64,
    end_revision: i64,
) {
    let mut chains: BTreeMap<String, Vec<Version>> = BTreeMap::new();

    let walked = match fsio::walk_versions(&root) {
        Ok(walked) => walked,
        Err(_) => return,
    };

    for (key, version) in walked {
        if !prefix.is_empty() && !key.starts_with(prefix.as_str()) {
            continue;
        }

        chains.entry(key).or_default().push(version);
    }

    let mut events = Vec::new();

    for (key, versions) in &chains {
        let Some(version) = versions
            .iter()
            .filter(|v| v.mod_revision > start_revision && v.mod_revision <= end_revision)
            .max_by_key(|v| v.mod_revision)
        else {
            continue;
        };

        if let Some(event) = replay_event(&root, key, *version) {
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
/// the kind from the file name.
fn replay_event(root: &Path, key: &str, version: Version) -> Option<Event> {
    match version.event_kind() {
        EventKind::Create => Some(Event {
            create: true,
            kv: read_kv(root, key, version)?,
            ..Default::default()
        }),
        EventKind::Update => Some(Event {
            kv: read_kv(root, key, version)?,
            prev_kv: find_previous(root, key, version.mod_revision),
            ..Default::default()
        }),
        EventKind::Delete => Some(Event {
            delete: true,
            kv: KeyValue {
                key: key.to_string(),
                mod_revision: version.mod_revision,
                ..Default::default()
            },
            prev_kv: find_previous(root, key, version.mod_revision),
            ..Default::default()
        }),
        EventKind::Unknown => None,
    }
}

fn read_kv(root: &Path, key: &str, version: Version) -> Option<KeyValue> {
    let content = fs::read(root.join(key).join(version.to_string())).ok()?;

    Some(KeyValue {
        key: key.to_string(),
        create_revision: version.create_revision,
        mod_revision: version.mod_revision,
        value: content,
        lease: version.lease_ttl(),
    })
}

/// The newest surviving live version below `before_revision`, used as the
/// `prev_kv` of replayed update and delete events.
fn find_previous(root: &Path, key: &str, before_revision: i64) -> Option<KeyValue> {
    let now = unix_now();

    let versions = fsio::read_dir_versions(&root.join(key)).ok()?;

    let previous = versions
        .into_iter()
        .filter(|v| v.mod_revision < before_revision && !v.has_expired(now))
        .max_by_key(|v| v.mod_revision)?;

    read_kv(root, key, previous)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LocalFsBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalFsBackend::new(dir.path().to_path_buf()).unwrap();

        (backend, dir)
    }

    #[test]
    fn test_relative_root_rejected() {
        assert!(matches!(
            LocalFsBackend::new("relative/dir"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_create_writes_layout() {
        let (b, dir) = setup();

        let rev = b.create("registry/pods/web", b"spec", 0).await.unwrap();
        assert_eq!(rev, 1);

        // <root>/<key>/<createRev:20>.<modRev:20>.<ctime>.<expireTime>
        let key_dir = dir.path().join("registry/pods/web");
        let names: Vec<String> = fs::read_dir(&key_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("00000000000000000001.00000000000000000001."));
        assert!(names[0].ends_with(".0"));

        assert_eq!(
            fs::read(key_dir.join(&names[0])).unwrap(),
            b"spec",
            "file contents are the opaque value bytes"
        );

        // the counter file holds the revision as big-endian i64
        let raw = fs::read(dir.path().join(COUNTER_FILE_NAME)).unwrap();
        assert_eq!(raw, 1i64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_create_collision_and_invalid_keys() {
        let (b, _dir) = setup();

        b.create("a", b"b", 0).await.unwrap();
        assert!(matches!(
            b.create("a", b"x", 0).await,
            Err(Error::KeyExists)
        ));

        assert!(matches!(
            b.create("", b"x", 0).await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            b.create("../escape", b"x", 0).await,
            Err(Error::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_update_carries_create_revision() {
        let (b, _dir) = setup();

        let rev1 = b.create("a", b"b", 0).await.unwrap();

        let (rev2, kv, updated) = b.update("a", b"c", rev1, 0).await.unwrap();
        assert!(updated);
        assert_eq!(rev2, rev1 + 1);
        let kv = kv.unwrap();
        assert_eq!(kv.create_revision, rev1);
        assert_eq!(kv.mod_revision, rev2);

        let (current, kv) = b.get("a", "", 0, 0).await.unwrap();
        let kv = kv.unwrap();
        assert_eq!(current, rev2);
        assert_eq!(kv.create_revision, rev1);
        assert_eq!(kv.value, b"c");
    }

    #[tokio::test]
    async fn test_update_mismatch_returns_head() {
        let (b, _dir) = setup();

        let rev1 = b.create("a", b"b", 0).await.unwrap();

        let (rev, kv, updated) = b.update("a", b"c", rev1 + 9, 0).await.unwrap();
        assert!(!updated);
        assert_eq!(rev, rev1);
        assert_eq!(kv.unwrap().value, b"b");

        let (_, kv, updated) = b.update("absent", b"c", 0, 0).await.unwrap();
        assert!(!updated);
        assert!(kv.is_none());
    }

    #[tokio::test]
    async fn test_delete_renames_to_tombstone() {
        let (b, dir) = setup();

        let rev1 = b.create("k", b"1", 0).await.unwrap();
        let (rev2, prev, deleted) = b.delete("k", rev1).await.unwrap();
        assert!(deleted);
        assert_eq!(rev2, 2);

        let prev = prev.unwrap();
        assert_eq!(prev.mod_revision, rev1);
        assert_eq!(prev.value, b"1");

        // exactly one file remains: the tombstone carrying the old bytes
        let names: Vec<String> = fs::read_dir(dir.path().join("k"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);

        let tombstone = Version::parse(&names[0]);
        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.mod_revision, rev2);
        assert_eq!(tombstone.create_revision, rev1);
        assert_eq!(fs::read(dir.path().join("k").join(&names[0])).unwrap(), b"1");

        let (_, kv) = b.get("k", "", 0, 0).await.unwrap();
        assert!(kv.is_none());

        // rebirth starts a new life
        let rev3 = b.create("k", b"2", 0).await.unwrap();
        assert_eq!(rev3, 3);
        let (_, kv) = b.get("k", "", 0, 0).await.unwrap();
        let kv = kv.unwrap();
        assert_eq!(kv.create_revision, rev3);
        assert_eq!(kv.value, b"2");
    }

    #[tokio::test]
    async fn test_delete_revision_mismatch() {
        let (b, _dir) = setup();

        let rev = b.create("k", b"1", 0).await.unwrap();
        let (_, kv, deleted) = b.delete("k", rev + 5).await.unwrap();
        assert!(!deleted);
        assert!(kv.is_none());

        let (_, kv) = b.get("k", "", 0, 0).await.unwrap();
        assert!(kv.is_some());
    }

    #[tokio::test]
    async fn test_historical_get() {
        let (b, _dir) = setup();

        let rev1 = b.create("k", b"v1", 0).await.unwrap();
        let (rev2, _, _) = b.update("k", b"v2", rev1, 0).await.unwrap();

        let (_, kv) = b.get("k", "", 0, rev1).await.unwrap();
        let kv = kv.unwrap();
        assert_eq!(kv.value, b"v1");
        assert_eq!(kv.mod_revision, rev1);

        let (_, kv) = b.get("k", "", 0, rev2).await.unwrap();
        assert_eq!(kv.unwrap().value, b"v2");

        // a revision before the key existed
        let rev3 = b.create("other", b"x", 0).await.unwrap();
        let (_, kv) = b.get("other", "", 0, rev3 - 3).await.unwrap();
        assert!(kv.is_none());
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let (b, _dir) = setup();

        for key in [
            "users/alice",
            "users/bob",
            "users/admin/root",
            "config/app",
            "config/db",
        ] {
            b.create(key, b"x", 0).await.unwrap();
        }

        let (_, kvs) = b.list("users", "", 0, 0).await.unwrap();
        let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["users/admin/root", "users/alice", "users/bob"]);

        let (_, kvs) = b.list("", "", 2, 0).await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert!(kvs[0].key < kvs[1].key);

        let (_, count) = b.count("users", "", 0).await.unwrap();
        assert_eq!(count, 3);

        // a trailing separator on the prefix is tolerated
        let (_, count) = b.count("users/", "", 0).await.unwrap();
        assert_eq!(count, 3);

        let (_, kvs) = b.list("users", "users/alice", 0, 0).await.unwrap();
        let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["users/alice", "users/bob"]);

        // count skips value reads but agrees with list
        let (_, kvs_at) = b.list("", "", 0, 3).await.unwrap();
        let (_, count_at) = b.count("", "", 3).await.unwrap();
        assert_eq!(kvs_at.len() as i64, count_at);
    }

    #[tokio::test]
    async fn test_compact_preserves_head_and_prunes_dirs() {
        let (b, dir) = setup();

        let rev1 = b.create("k", b"v1", 0).await.unwrap();
        let (rev2, _, _) = b.update("k", b"v2", rev1, 0).await.unwrap();
        let (rev3, _, _) = b.update("k", b"v3", rev2, 0).await.unwrap();

        let gone = b.create("dead/leaf", b"x", 0).await.unwrap();
        b.delete("dead/leaf", gone).await.unwrap();

        assert_eq!(b.compact(rev2).await.unwrap(), rev2);

        // the live head survives its own compaction point
        let (_, kv) = b.get("k", "", 0, 0).await.unwrap();
        let kv = kv.unwrap();
        assert_eq!(kv.mod_revision, rev3);
        assert_eq!(kv.value, b"v3");

        // compacted history is simply gone
        let (_, kv) = b.get("k", "", 0, rev1).await.unwrap();
        assert!(kv.is_none());

        // the tombstoned life is swept and its directories pruned
        assert!(!dir.path().join("dead").exists());
    }

    #[tokio::test]
    async fn test_compact_below_watermark_is_compacted_error() {
        let (b, _dir) = setup();

        let rev1 = b.create("k", b"v1", 0).await.unwrap();
        let (rev2, _, _) = b.update("k", b"v2", rev1, 0).await.unwrap();

        b.compact(rev2).await.unwrap();

        assert!(matches!(b.compact(rev1).await, Err(Error::Compacted)));
        assert!(matches!(b.compact(rev2).await, Err(Error::Compacted)));

        // state unchanged either way
        let (_, kv) = b.get("k", "", 0, 0).await.unwrap();
        assert_eq!(kv.unwrap().mod_revision, rev2);
    }

    #[tokio::test]
    async fn test_first_compact_on_empty_store() {
        let (b, _dir) = setup();

        // a never-compacted store accepts any target, including "up to
        // current" on an empty tree
        assert_eq!(b.compact(0).await.unwrap(), 0);

        // only a repeat of an actual compaction is rejected
        assert!(matches!(b.compact(0).await, Err(Error::Compacted)));

        // the store keeps working and can be compacted past the watermark
        let rev = b.create("k", b"v", 0).await.unwrap();
        assert_eq!(b.compact(rev).await.unwrap(), rev);

        let (_, kv) = b.get("k", "", 0, 0).await.unwrap();
        assert_eq!(kv.unwrap().mod_revision, rev);
    }

    #[tokio::test]
    async fn test_revision_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let b = LocalFsBackend::new(dir.path().to_path_buf()).unwrap();
        b.create("k", b"v", 0).await.unwrap();
        b.create("k2", b"v", 0).await.unwrap();
        drop(b);

        let b = LocalFsBackend::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(b.current_revision().await.unwrap(), 2);

        let rev = b.create("k3", b"v", 0).await.unwrap();
        assert_eq!(rev, 3);
    }

    #[tokio::test]
    async fn test_db_size_counts_files() {
        let (b, _dir) = setup();

        let empty = b.db_size().await.unwrap();

        b.create("k", &[0u8; 1024], 0).await.unwrap();

        let grown = b.db_size().await.unwrap();
        assert!(grown >= empty + 1024);
    }

    #[tokio::test]
    async fn test_watch_live_events() {
        let (b, _dir) = setup();

        let rev1 = b.create("test/key1", b"v1", 0).await.unwrap();
        let rev2 = b.create("test/key2", b"v2", 0).await.unwrap();

        let token = CancellationToken::new();
        let mut result = b.watch(token.clone(), "test/", rev2).await;
        assert_eq!(result.current_revision, rev2);

        b.update("test/key1", b"v1b", rev1, 0).await.unwrap();
        b.create("test/key3", b"v3", 0).await.unwrap();
        b.delete("test/key2", 0).await.unwrap();
        b.create("outside", b"x", 0).await.unwrap();

        let batch = result.events.recv().await.unwrap();
        assert!(!batch[0].create && !batch[0].delete);
        assert_eq!(batch[0].kv.value, b"v1b");
        assert_eq!(batch[0].prev_kv.as_ref().unwrap().value, b"v1");

        let batch = result.events.recv().await.unwrap();
        assert!(batch[0].create);
        assert_eq!(batch[0].kv.key, "test/key3");

        let batch = result.events.recv().await.unwrap();
        assert!(batch[0].delete);
        assert_eq!(batch[0].kv.key, "test/key2");
        assert_eq!(batch[0].prev_kv.as_ref().unwrap().value, b"v2");

        token.cancel();
        assert!(result.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_historical_replay() {
        let (b, _dir) = setup();

        let rev1 = b.create("test/key1", b"v1", 0).await.unwrap();
        let (rev2, _, _) = b.update("test/key1", b"v2", rev1, 0).await.unwrap();
        b.create("other/key", b"x", 0).await.unwrap();

        let token = CancellationToken::new();
        let mut result = b.watch(token.clone(), "test/", rev1).await;

        let batch = result.events.recv().await.unwrap();
        assert_eq!(batch[0].kv.key, "test/key1");
        assert_eq!(batch[0].kv.mod_revision, rev2);
        assert_eq!(batch[0].kv.value, b"v2");
        assert!(!batch[0].create && !batch[0].delete);

        token.cancel();
        assert!(result.events.recv().await.is_none());
    }
}
