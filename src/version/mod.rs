//! Version metadata shared by both storage drivers.
//!
//! Every write produces an immutable [`Version`] record `(create_revision,
//! mod_revision, create_time, expire_time)`. The filesystem driver encodes
//! the record into the version file's name; the embedded driver stores it in
//! the row payload. A version is a tombstone iff `expire_time > 0` and
//! `expire_time <= create_time` — deletion is encoded, not erased, so
//! historical reads and watch replay keep working.

use std::fmt;

/// The kind of change a version represents, derived from its metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Unknown,
}

/// Immutable metadata of one version of one key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version {
    /// Revision at which the version's life began.
    pub create_revision: i64,

    /// Revision allocated to this write; globally unique, strictly
    /// increasing within a key's chain.
    pub mod_revision: i64,

    /// Wall-clock unix seconds at write.
    pub create_time: i64,

    /// 0 for no expiry, otherwise `create_time + lease`. Equal to
    /// `create_time` for tombstones.
    pub expire_time: i64,
}

impl Version {
    /// Parses a version from a file name (or a full path; only the final
    /// component is considered). Anything that does not split into exactly
    /// four integer fields yields the zero value, so stray files are
    /// silently skipped by directory scans.
    pub fn parse(loc: &str) -> Version {
        let base = loc.rsplit('/').next().unwrap_or(loc);

        let mut fields = [0i64; 4];
        let mut count = 0;

        for part in base.split('.') {
            if count == 4 {
                return Version::default();
            }

            match part.parse::<i64>() {
                Ok(v) => fields[count] = v,
                Err(_) => return Version::default(),
            }

            count += 1;
        }

        if count != 4 {
            return Version::default();
        }

        Version {
            create_revision: fields[0],
            mod_revision: fields[1],
            create_time: fields[2],
            expire_time: fields[3],
        }
    }

    /// A parse failure or an uninitialized record.
    pub fn is_zero(&self) -> bool {
        self.create_revision == 0 || self.mod_revision == 0 || self.create_time == 0
    }

    /// Deletion marker: expiry pinned at (or before) the write instant.
    pub fn is_tombstone(&self) -> bool {
        self.expire_time > 0 && self.expire_time <= self.create_time
    }

    /// Whether the version's TTL has elapsed at `now` (unix seconds).
    /// Tombstones are always expired.
    pub fn has_expired(&self, now: i64) -> bool {
        self.expire_time > 0 && self.expire_time <= now
    }

    /// The TTL recorded at write time, 0 when unleased.
    pub fn lease_ttl(&self) -> i64 {
        (self.expire_time - self.create_time).max(0)
    }

    /// Derives the change kind for watch replay.
    pub fn event_kind(&self) -> EventKind {
        if self.is_zero() {
            return EventKind::Unknown;
        }

        if self.is_tombstone() {
            return EventKind::Delete;
        }

        if self.create_revision == self.mod_revision {
            return EventKind::Create;
        }

        if self.create_revision < self.mod_revision {
            return EventKind::Update;
        }

        EventKind::Unknown
    }
}

impl fmt::Display for Version {
    /// The on-disk name: both revisions zero-padded to 20 digits so
    /// lexicographic order within a directory matches numeric order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:020}.{:020}.{}.{}",
            self.create_revision, self.mod_revision, self.create_time, self.expire_time
        )
    }
}

/// The most recent live version: newest first, stopping at a tombstone,
/// falling through expired entries. `versions` must be sorted by
/// `mod_revision` descending.
pub fn head_live(versions: &[Version], now: i64) -> Option<Version> {
    for v in versions {
        if v.is_tombstone() {
            return None;
        }

        if v.has_expired(now) {
            continue;
        }

        return Some(*v);
    }

    None
}

/// The version visible to a reader at `revision`: the greatest
/// `mod_revision <= revision`, absent when that version is a tombstone or
/// has expired. `versions` must be sorted by `mod_revision` descending.
pub fn head_at(versions: &[Version], revision: i64, now: i64) -> Option<Version> {
    let v = versions.iter().find(|v| v.mod_revision <= revision)?;

    if v.is_tombstone() || v.has_expired(now) {
        return None;
    }

    Some(*v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let v = Version::parse("12345.67890.1620000000.1620086400");
        assert_eq!(v.create_revision, 12345);
        assert_eq!(v.mod_revision, 67890);
        assert_eq!(v.create_time, 1620000000);
        assert_eq!(v.expire_time, 1620086400);
    }

    #[test]
    fn test_parse_full_path() {
        let v = Version::parse("/some/directory/12345.67890.1620000000.1620086400");
        assert_eq!(v.create_revision, 12345);
        assert_eq!(v.mod_revision, 67890);
    }

    #[test]
    fn test_parse_malformed() {
        let locs = [
            "invalid",
            "12345.67890.1620000000",
            "12345.67890.abc.1620086400",
            "1.2.3.4.5",
            "",
        ];

        for loc in locs {
            assert!(Version::parse(loc).is_zero(), "expected zero for {loc:?}");
        }
    }

    #[test]
    fn test_round_trip() {
        let v = Version {
            create_revision: 12345,
            mod_revision: 67890,
            create_time: 1620000000,
            expire_time: 1620086400,
        };

        let name = v.to_string();
        assert_eq!(
            name,
            "00000000000000012345.00000000000000067890.1620000000.1620086400"
        );
        assert_eq!(Version::parse(&name), v);
    }

    #[test]
    fn test_tombstone_and_expiry() {
        let tomb = Version {
            create_revision: 1,
            mod_revision: 2,
            create_time: 100,
            expire_time: 100,
        };
        assert!(tomb.is_tombstone());
        assert!(tomb.has_expired(100));
        assert_eq!(tomb.event_kind(), EventKind::Delete);

        let leased = Version {
            create_revision: 3,
            mod_revision: 3,
            create_time: 100,
            expire_time: 105,
        };
        assert!(!leased.is_tombstone());
        assert!(!leased.has_expired(104));
        assert!(leased.has_expired(105));
        assert_eq!(leased.lease_ttl(), 5);

        let plain = Version {
            create_revision: 4,
            mod_revision: 4,
            create_time: 100,
            expire_time: 0,
        };
        assert!(!plain.has_expired(i64::MAX));
        assert_eq!(plain.lease_ttl(), 0);
    }

    #[test]
    fn test_event_kind() {
        let create = Version {
            create_revision: 5,
            mod_revision: 5,
            create_time: 100,
            expire_time: 0,
        };
        assert_eq!(create.event_kind(), EventKind::Create);

        let update = Version {
            create_revision: 5,
            mod_revision: 8,
            create_time: 110,
            expire_time: 0,
        };
        assert_eq!(update.event_kind(), EventKind::Update);

        assert_eq!(Version::default().event_kind(), EventKind::Unknown);
    }

    #[test]
    fn test_head_live() {
        let now = 1000;
        let chain = [
            Version {
                create_revision: 1,
                mod_revision: 3,
                create_time: 900,
                expire_time: 950, // expired
            },
            Version {
                create_revision: 1,
                mod_revision: 2,
                create_time: 800,
                expire_time: 0,
            },
            Version {
                create_revision: 1,
                mod_revision: 1,
                create_time: 700,
                expire_time: 0,
            },
        ];

        // the expired head falls through to the previous live version
        assert_eq!(head_live(&chain, now).map(|v| v.mod_revision), Some(2));

        let deleted = [
            Version {
                create_revision: 1,
                mod_revision: 4,
                create_time: 950,
                expire_time: 950, // tombstone
            },
            chain[1],
        ];
        assert_eq!(head_live(&deleted, now), None);
    }

    #[test]
    fn test_head_at() {
        let now = 1000;
        let chain = [
            Version {
                create_revision: 1,
                mod_revision: 5,
                create_time: 900,
                expire_time: 0,
            },
            Version {
                create_revision: 1,
                mod_revision: 2,
                create_time: 800,
                expire_time: 0,
            },
        ];

        assert_eq!(head_at(&chain, 7, now).map(|v| v.mod_revision), Some(5));
        assert_eq!(head_at(&chain, 4, now).map(|v| v.mod_revision), Some(2));
        assert_eq!(head_at(&chain, 1, now), None);

        let tombstoned = [
            Version {
                create_revision: 1,
                mod_revision: 6,
                create_time: 950,
                expire_time: 950,
            },
            chain[0],
        ];
        assert_eq!(head_at(&tombstoned, 6, now), None);
        assert_eq!(
            head_at(&tombstoned, 5, now).map(|v| v.mod_revision),
            Some(5)
        );
    }
}
