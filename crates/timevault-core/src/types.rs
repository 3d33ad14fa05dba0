use chrono::{DateTime, FixedOffset, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One immutable record asserting what a file's contents were at one
/// session's timestamp. The catalog owns all FileVersions; they are never
/// mutated after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Wall-clock instant the backup session began, with local-zone offset.
    pub timestamp: DateTime<FixedOffset>,
    /// Absolute path of the containing directory at source.
    pub directory: String,
    /// Absolute path of the file at source.
    pub orig_path: String,
    /// SHA-224 of `orig_path` (56 hex chars); the opaque server-side name.
    pub path_hash: String,
    /// SHA-256 of the plaintext content (64 hex chars); version identity.
    pub content_hash: String,
    /// Plaintext size in bytes.
    pub plain_size: u64,
    /// Size after compression + encryption (the on-wire footprint).
    pub packed_size: u64,
}

impl FileVersion {
    /// File name component of `orig_path`.
    pub fn file_name(&self) -> &str {
        Path::new(&self.orig_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.orig_path)
    }
}

/// A single entry of a file's version history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub content_hash: String,
    pub plain_size: u64,
}

/// Per-file summary for catalog browsing.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub orig_path: String,
    pub directory: String,
    pub file_name: String,
    pub latest_version: DateTime<FixedOffset>,
    pub version_count: u64,
    pub plain_size: u64,
}

/// Aggregate counters over the whole catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub record_count: u64,
    pub plain_bytes: u64,
    pub packed_bytes: u64,
}

/// A file the scanner decided must be backed up in this session.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub orig_path: String,
    pub directory: String,
    pub plain_size: u64,
    pub path_hash: String,
    pub content_hash: String,
}

/// The shared timestamp of one backup session.
///
/// Captured once at session start; every FileVersion committed by the
/// session carries this instant. The identifier form `YYYYMMDD-HHMMSS`
/// (local time) names the session's shard directory and catalog snapshot
/// on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStamp(DateTime<FixedOffset>);

impl SessionStamp {
    /// Capture the current local wall-clock instant.
    pub fn now() -> Self {
        Self(Local::now().fixed_offset())
    }

    /// Wrap an explicit instant (tests, replays).
    pub fn at(instant: DateTime<FixedOffset>) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> DateTime<FixedOffset> {
        self.0
    }

    /// Session identifier: `YYYYMMDD-HHMMSS` in the session's local time.
    pub fn id(&self) -> String {
        self.0.format("%Y%m%d-%H%M%S").to_string()
    }

    /// Wire form used in restore requests: `YYYY-MM-DDThh:mm:ss`, naive
    /// local time.
    pub fn wire_form(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    /// Whole-second part of this stamp, for the distinct-second throttle.
    pub fn whole_second(&self) -> i64 {
        self.0.timestamp()
    }
}

/// Name of the `NNNNNN`-indexed shard of a session, 1-based.
pub fn shard_name(session_id: &str, index: u32) -> String {
    format!("{session_id}-{index:06}.tar")
}

/// Inclusive upper bound (epoch milliseconds) for at-or-before-`t`
/// queries.
///
/// The requested instant is floored to the whole second and extended by
/// one second, exclusive; the slack absorbs sub-second truncation in
/// user-facing strings without ever reaching a session whose whole-second
/// stamp exceeds the requested second.
pub fn query_bound_millis(t: DateTime<FixedOffset>) -> i64 {
    let floored = t.with_nanosecond(0).unwrap_or(t);
    floored.timestamp_millis() + 1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    #[test]
    fn session_id_format() {
        let t = tz().with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let stamp = SessionStamp::at(t);
        assert_eq!(stamp.id(), "20240115-100000");
        assert_eq!(stamp.wire_form(), "2024-01-15T10:00:00");
    }

    #[test]
    fn shard_names_are_zero_padded() {
        assert_eq!(shard_name("20240115-100000", 1), "20240115-100000-000001.tar");
        assert_eq!(shard_name("20240115-100000", 42), "20240115-100000-000042.tar");
    }

    #[test]
    fn query_bound_absorbs_subsecond_truncation_only() {
        let t = tz().with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let bound = query_bound_millis(t);

        // A session at 10:00:00.091 is within the bound...
        let same_second = t.timestamp_millis() + 91;
        assert!(same_second < bound);

        // ...but one at exactly 10:00:01 is not.
        let next_second = t.timestamp_millis() + 1_000;
        assert!(next_second >= bound);
    }
}
