//! Catalog snapshot export and import.
//!
//! A snapshot is a self-contained copy of the catalog database, written
//! to a separate file so it can be sealed and shipped off-site, and
//! merged back with full-tuple replacement on recovery. Importing the
//! same snapshot twice is a no-op.

use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use tracing::{debug, info};

use timevault_core::{VaultError, VaultResult};

use crate::store::{db_err, init_schema, Catalog};

impl Catalog {
    /// Write a self-contained copy of the current state to `dest`.
    pub fn export_snapshot(&self, dest: &Path) -> VaultResult<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        let mut dest_conn = Connection::open(dest).map_err(db_err)?;
        init_schema(&dest_conn).map_err(db_err)?;

        let src_conn = self.connection()?;
        let mut stmt = src_conn
            .prepare(
                "SELECT ts, ts_unix, directory, orig_path, path_hash, content_hash, \
                        plain_size, packed_size FROM file_versions",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;

        let tx = dest_conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut count = 0u64;
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO file_versions \
                     (ts, ts_unix, directory, orig_path, path_hash, content_hash, plain_size, packed_size) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(db_err)?;
            while let Some(row) = rows.next().map_err(db_err)? {
                insert
                    .execute(params![
                        row.get::<_, String>(0).map_err(db_err)?,
                        row.get::<_, i64>(1).map_err(db_err)?,
                        row.get::<_, String>(2).map_err(db_err)?,
                        row.get::<_, String>(3).map_err(db_err)?,
                        row.get::<_, String>(4).map_err(db_err)?,
                        row.get::<_, String>(5).map_err(db_err)?,
                        row.get::<_, i64>(6).map_err(db_err)?,
                        row.get::<_, i64>(7).map_err(db_err)?,
                    ])
                    .map_err(db_err)?;
                count += 1;
            }
        }
        tx.commit().map_err(db_err)?;
        debug!(records = count, dest = %dest.display(), "catalog snapshot exported");
        Ok(())
    }

    /// Merge records from a snapshot file into this catalog.
    ///
    /// Conflicts resolve by full-tuple replacement: a record with the same
    /// `(orig_path, timestamp)` key overwrites the existing one, so
    /// re-importing is idempotent. A file that is not a catalog snapshot
    /// at all yields `Integrity`.
    pub fn import_snapshot(&self, src: &Path) -> VaultResult<u64> {
        let src_conn = Connection::open_with_flags(
            src,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| VaultError::Integrity(format!("cannot open snapshot: {e}")))?;

        let mut stmt = src_conn
            .prepare(
                "SELECT ts, ts_unix, directory, orig_path, path_hash, content_hash, \
                        plain_size, packed_size FROM file_versions",
            )
            .map_err(|e| VaultError::Integrity(format!("not a catalog snapshot: {e}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| VaultError::Integrity(format!("unreadable snapshot: {e}")))?;

        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut count = 0u64;
        {
            let mut insert = tx
                .prepare(
                    "INSERT OR REPLACE INTO file_versions \
                     (ts, ts_unix, directory, orig_path, path_hash, content_hash, plain_size, packed_size) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(db_err)?;
            while let Some(row) = rows
                .next()
                .map_err(|e| VaultError::Integrity(format!("corrupt snapshot row: {e}")))?
            {
                insert
                    .execute(params![
                        row.get::<_, String>(0).map_err(db_err)?,
                        row.get::<_, i64>(1).map_err(db_err)?,
                        row.get::<_, String>(2).map_err(db_err)?,
                        row.get::<_, String>(3).map_err(db_err)?,
                        row.get::<_, String>(4).map_err(db_err)?,
                        row.get::<_, String>(5).map_err(db_err)?,
                        row.get::<_, i64>(6).map_err(db_err)?,
                        row.get::<_, i64>(7).map_err(db_err)?,
                    ])
                    .map_err(db_err)?;
                count += 1;
            }
        }
        tx.commit().map_err(db_err)?;
        info!(records = count, src = %src.display(), "catalog snapshot imported");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset, TimeZone};
    use tempfile::TempDir;
    use timevault_core::types::FileVersion;

    fn at(s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 10, 0, s)
            .unwrap()
    }

    fn version(path: &str, s: u32, hash: &str) -> FileVersion {
        FileVersion {
            timestamp: at(s),
            directory: "/data".into(),
            orig_path: path.into(),
            path_hash: format!("ph-{path}"),
            content_hash: hash.into(),
            plain_size: 5,
            packed_size: 40,
        }
    }

    fn all_versions(catalog: &Catalog) -> Vec<FileVersion> {
        let mut out = Vec::new();
        for info in catalog.files_with_info().unwrap() {
            for entry in catalog.history(&info.orig_path).unwrap() {
                out.push(
                    catalog
                        .file_at_time(&info.orig_path, entry.timestamp)
                        .unwrap()
                        .unwrap(),
                );
            }
        }
        out.sort_by(|a, b| {
            (&a.orig_path, a.timestamp).cmp(&(&b.orig_path, b.timestamp))
        });
        out
    }

    #[test]
    fn export_import_roundtrip() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(&dir.path().join("main.db")).unwrap();
        catalog
            .add_entries(&[
                version("/data/a.txt", 0, "h1"),
                version("/data/a.txt", 2, "h2"),
                version("/data/b.txt", 2, "b1"),
            ])
            .unwrap();

        let snapshot = dir.path().join("snapshot.db");
        catalog.export_snapshot(&snapshot).unwrap();

        let restored = Catalog::open(&dir.path().join("restored.db")).unwrap();
        let imported = restored.import_snapshot(&snapshot).unwrap();
        assert_eq!(imported, 3);
        assert_eq!(all_versions(&restored), all_versions(&catalog));
    }

    #[test]
    fn reimport_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(&dir.path().join("main.db")).unwrap();
        catalog
            .add_entries(&[version("/data/a.txt", 0, "h1")])
            .unwrap();

        let snapshot = dir.path().join("snapshot.db");
        catalog.export_snapshot(&snapshot).unwrap();

        catalog.import_snapshot(&snapshot).unwrap();
        catalog.import_snapshot(&snapshot).unwrap();
        assert_eq!(catalog.stats().unwrap().record_count, 1);
    }

    #[test]
    fn import_merges_disjoint_snapshots() {
        let dir = TempDir::new().unwrap();
        let first = Catalog::open(&dir.path().join("first.db")).unwrap();
        first
            .add_entries(&[version("/data/a.txt", 0, "h1")])
            .unwrap();
        let second = Catalog::open(&dir.path().join("second.db")).unwrap();
        second
            .add_entries(&[
                version("/data/a.txt", 0, "h1"),
                version("/data/a.txt", 2, "h2"),
            ])
            .unwrap();

        let snap_a = dir.path().join("a.snap");
        let snap_b = dir.path().join("b.snap");
        first.export_snapshot(&snap_a).unwrap();
        second.export_snapshot(&snap_b).unwrap();

        let merged = Catalog::open(&dir.path().join("merged.db")).unwrap();
        merged.import_snapshot(&snap_a).unwrap();
        merged.import_snapshot(&snap_b).unwrap();

        assert_eq!(merged.stats().unwrap().record_count, 2);
        let history = merged.history("/data/a.txt").unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn garbage_file_is_an_integrity_error() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(&dir.path().join("main.db")).unwrap();

        let bogus = dir.path().join("bogus.db");
        std::fs::write(&bogus, b"this is not a sqlite database at all").unwrap();

        let err = catalog.import_snapshot(&bogus).unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)), "got {err:?}");
    }

    #[test]
    fn export_overwrites_stale_snapshot() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(&dir.path().join("main.db")).unwrap();
        catalog
            .add_entries(&[version("/data/a.txt", 0, "h1")])
            .unwrap();

        let snapshot = dir.path().join("snapshot.db");
        catalog.export_snapshot(&snapshot).unwrap();
        catalog
            .add_entries(&[version("/data/b.txt", 2, "b1")])
            .unwrap();
        catalog.export_snapshot(&snapshot).unwrap();

        let fresh = Catalog::open(&dir.path().join("fresh.db")).unwrap();
        assert_eq!(fresh.import_snapshot(&snapshot).unwrap(), 2);
    }
}
