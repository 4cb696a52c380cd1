//! # kined: an embedded multi-version key-value store with etcd-v3 semantics
//!
//! kined is the storage engine behind an etcd-compatible shim for
//! Kubernetes-style control planes that need monotonic revision numbering,
//! historical reads and change notifications, but no consensus layer. It
//! provides:
//!
//! - **Revision discipline**: a store-wide monotonic `int64` counter, one
//!   revision per effective mutation, crash-safe across restarts
//! - **Version chains**: per-key ordered version history with create-revision
//!   carry-over, tombstones and absolute-TTL leases
//! - **Watch streams**: prefix-filtered, start-revision-gated event fan-out
//!   with historical replay and a bounded-buffer slow-consumer policy
//! - **Compaction**: GC of version history up to a watermark and of expired
//!   TTL tombstones
//! - **Two persistence layouts** behind one [`Backend`] trait: an embedded
//!   engine on sled and a directory-per-key filesystem layout
//!
//! # Usage
//!
//! ```no_run
//! use kined::{Backend, LocalFsBackend};
//!
//! # async fn demo() -> kined::Result<()> {
//! let store = LocalFsBackend::new("/var/lib/kined")?;
//! store.start().await?;
//!
//! let revision = store.create("registry/pods/web", b"spec", 0).await?;
//! let (current, kv) = store.get("registry/pods/web", "", 0, 0).await?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod compaction;
pub mod localfs;
pub mod server;
pub mod sleddb;
pub mod version;
pub mod watch;

// Re-export main types at crate root for convenience
pub use compaction::{CompactionMode, Compactor};
pub use localfs::LocalFsBackend;
pub use server::{Backend, Error, Event, KeyValue, Result, WatchResult};
pub use sleddb::{Config as SledConfig, SledBackend};
pub use version::Version;
pub use watch::WatcherHub;
