//! Low-level file and directory helpers for the on-disk layout.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::version::Version;

/// Version files are immutable once written.
const VERSION_FILE_MODE: u32 = 0o444;

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

/// Creates a version file exclusively and writes it through to disk. The
/// exclusive create is what ties a revision to exactly one on-disk effect.
pub(crate) fn write_version_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut fd = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(VERSION_FILE_MODE)
        .custom_flags(libc::O_SYNC | platform_flags())
        .open(path)?;

    fd.write_all(data)
}

/// Parses every well-formed version file name in a key directory, newest
/// first. A missing directory is an empty chain; malformed names are strays
/// and skipped.
pub(crate) fn read_dir_versions(dir: &Path) -> io::Result<Vec<Version>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut versions = Vec::new();

    for entry in entries {
        let entry = entry?;

        if let Some(name) = entry.file_name().to_str() {
            let version = Version::parse(name);
            if !version.is_zero() {
                versions.push(version);
            }
        }
    }

    versions.sort_by_key(|v| std::cmp::Reverse(v.mod_revision));

    Ok(versions)
}

/// Walks the store tree and yields `(key, version)` for every well-formed
/// version file. The counter file and other strays parse as zero and are
/// skipped; keys are directory paths relative to the root with `/`
/// separators.
pub(crate) fn walk_versions(root: &Path) -> io::Result<Vec<(String, Version)>> {
    let mut out = Vec::new();
    visit(root, root, &mut out)?;

    Ok(out)
}

fn visit(root: &Path, dir: &Path, out: &mut Vec<(String, Version)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            visit(root, &path, out)?;
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        let version = Version::parse(name);
        if version.is_zero() {
            continue;
        }

        let Ok(rel) = dir.strip_prefix(root) else {
            continue;
        };

        let Some(key) = rel.to_str() else {
            continue;
        };

        out.push((key.to_string(), version));
    }

    Ok(())
}

/// Total size of all regular files below `root`.
pub(crate) fn tree_size(root: &Path) -> io::Result<i64> {
    let mut total = 0i64;

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            total += tree_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len() as i64;
        }
    }

    Ok(total)
}

pub(crate) fn is_dir_empty(dir: &Path) -> bool {
    fs::read_dir(dir).map_or(false, |mut entries| entries.next().is_none())
}

/// Removes directories left empty after compaction, deepest first.
pub(crate) fn prune_empty_dirs(root: &Path) -> io::Result<()> {
    let mut dirs = Vec::new();
    collect_dirs(root, &mut dirs)?;

    dirs.sort_by(|a, b| b.cmp(a));

    for dir in dirs {
        if is_dir_empty(&dir) {
            let _ = fs::remove_dir(&dir);
        }
    }

    Ok(())
}

fn collect_dirs(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;

        if entry.file_type()?.is_dir() {
            let path = entry.path();
            collect_dirs(&path, out)?;
            out.push(path);
        }
    }

    Ok(())
}
