//! Persistent revision counter for the filesystem backend.
//!
//! The counter is a single 8-byte file holding the last allocated revision
//! as a big-endian signed 64-bit integer. It is opened with `O_SYNC` so every
//! increment is durable before the caller proceeds to write the version file
//! that consumes the revision; a crash between the two leaves a tolerated gap
//! revision that produces no events.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::server::Result;

pub const COUNTER_FILE_NAME: &str = "counter";

const COUNTER_FILE_MODE: u32 = 0o644;

fn platform_flags() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::O_NOATIME | libc::O_NOFOLLOW
    }
    #[cfg(not(target_os = "linux"))]
    {
        libc::O_NOFOLLOW
    }
}

/// Store-scoped counter: one instance per backend, guarding its own file.
pub struct RevisionCounter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RevisionCounter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// The last allocated revision, 0 when the file is missing or short.
    pub fn read(&self) -> i64 {
        let _guard = self.lock.lock();

        read_counter(&self.path)
    }

    /// Allocates the next revision and persists it before returning.
    pub fn increment(&self) -> Result<i64> {
        let _guard = self.lock.lock();

        increment_counter(&self.path)
    }
}

fn read_counter(path: &Path) -> i64 {
    let mut fd = match OpenOptions::new()
        .read(true)
        .custom_flags(platform_flags())
        .open(path)
    {
        Ok(fd) => fd,
        Err(_) => return 0,
    };

    let mut buf = [0u8; 8];
    match fd.read_exact(&mut buf) {
        Ok(()) => i64::from_be_bytes(buf),
        Err(_) => 0,
    }
}

fn increment_counter(path: &Path) -> Result<i64> {
    let mut fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(COUNTER_FILE_MODE)
        .custom_flags(libc::O_SYNC | platform_flags())
        .open(path)?;

    let mut buf = [0u8; 8];
    let value = match fd.read_exact(&mut buf) {
        Ok(()) => i64::from_be_bytes(buf),
        Err(_) => 0, // fresh or truncated file counts from zero
    };

    let next = value + 1;

    fd.seek(SeekFrom::Start(0))?;
    fd.write_all(&next.to_be_bytes())?;

    Ok(next)
}
