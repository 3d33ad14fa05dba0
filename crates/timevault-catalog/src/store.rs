use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use timevault_core::types::{
    query_bound_millis, CatalogStats, FileInfo, FileVersion, HistoryEntry,
};
use timevault_core::{VaultError, VaultResult};

/// The local backup catalog.
///
/// Connections are opened per operation against a WAL-journaled database,
/// so UI reads run concurrently with a session's writer and always see a
/// consistent snapshot that excludes the in-flight session until commit.
#[derive(Debug, Clone)]
pub struct Catalog {
    db_path: PathBuf,
}

pub(crate) fn db_err(e: rusqlite::Error) -> VaultError {
    VaultError::Catalog(e.to_string())
}

pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // Timestamps are stored twice: RFC 3339 text with the local-zone
    // offset (authoritative), and epoch milliseconds for ordering and
    // range predicates. UNIQUE(orig_path, ts_unix) makes snapshot import
    // idempotent by full-tuple replacement.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS file_versions (
            ts           TEXT NOT NULL,
            ts_unix      INTEGER NOT NULL,
            directory    TEXT NOT NULL,
            orig_path    TEXT NOT NULL,
            path_hash    TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            plain_size   INTEGER NOT NULL,
            packed_size  INTEGER NOT NULL,
            UNIQUE(orig_path, ts_unix)
        );
        CREATE INDEX IF NOT EXISTS file_versions_path_ts ON file_versions(orig_path, ts_unix);
        CREATE INDEX IF NOT EXISTS file_versions_ts ON file_versions(ts_unix);
        CREATE INDEX IF NOT EXISTS file_versions_hash ON file_versions(path_hash);
        "#,
    )
}

pub(crate) fn row_to_version(row: &Row<'_>) -> rusqlite::Result<FileVersion> {
    let ts_text: String = row.get(0)?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(FileVersion {
        timestamp,
        directory: row.get(1)?,
        orig_path: row.get(2)?,
        path_hash: row.get(3)?,
        content_hash: row.get(4)?,
        plain_size: row.get::<_, i64>(5)? as u64,
        packed_size: row.get::<_, i64>(6)? as u64,
    })
}

const VERSION_COLUMNS: &str =
    "ts, directory, orig_path, path_hash, content_hash, plain_size, packed_size";

impl Catalog {
    /// Open (or create) the catalog at the given database path.
    pub fn open(db_path: &Path) -> VaultResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let catalog = Catalog {
            db_path: db_path.to_path_buf(),
        };
        let conn = catalog.connection()?;
        init_schema(&conn).map_err(db_err)?;
        Ok(catalog)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn connection(&self) -> VaultResult<Connection> {
        let conn = Connection::open(&self.db_path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(10)).map_err(db_err)?;
        Ok(conn)
    }

    /// Atomic append of all `versions` or none.
    pub fn add_entries(&self, versions: &[FileVersion]) -> VaultResult<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO file_versions \
                     (ts, ts_unix, directory, orig_path, path_hash, content_hash, plain_size, packed_size) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(db_err)?;
            for v in versions {
                stmt.execute(params![
                    v.timestamp.to_rfc3339(),
                    v.timestamp.timestamp_millis(),
                    v.directory,
                    v.orig_path,
                    v.path_hash,
                    v.content_hash,
                    v.plain_size as i64,
                    v.packed_size as i64,
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        debug!(count = versions.len(), "catalog commit");
        Ok(())
    }

    /// The newest version of `orig_path`, if any.
    pub fn latest_version(&self, orig_path: &str) -> VaultResult<Option<FileVersion>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM file_versions \
                 WHERE orig_path = ?1 ORDER BY ts_unix DESC LIMIT 1"
            ),
            params![orig_path],
            row_to_version,
        )
        .optional()
        .map_err(db_err)
    }

    /// Whether a file must be backed up: true iff it is unknown or its
    /// latest recorded content hash differs. Size is accepted for future
    /// policy but currently ignored.
    pub fn needs_backup(
        &self,
        orig_path: &str,
        current_content_hash: &str,
        _current_size: u64,
    ) -> VaultResult<bool> {
        match self.latest_version(orig_path)? {
            None => Ok(true),
            Some(latest) => Ok(latest.content_hash != current_content_hash),
        }
    }

    /// The version of `orig_path` in effect at `t` (at-or-before rule).
    pub fn file_at_time(
        &self,
        orig_path: &str,
        t: DateTime<FixedOffset>,
    ) -> VaultResult<Option<FileVersion>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM file_versions \
                 WHERE orig_path = ?1 AND ts_unix < ?2 \
                 ORDER BY ts_unix DESC LIMIT 1"
            ),
            params![orig_path, query_bound_millis(t)],
            row_to_version,
        )
        .optional()
        .map_err(db_err)
    }

    /// One version per extant path, each the newest at-or-before `t`.
    /// Paths whose only versions are later than `t` are absent.
    pub fn files_at_time(&self, t: DateTime<FixedOffset>) -> VaultResult<Vec<FileVersion>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT v.ts, v.directory, v.orig_path, v.path_hash, v.content_hash, \
                        v.plain_size, v.packed_size \
                 FROM file_versions v \
                 INNER JOIN ( \
                     SELECT orig_path, MAX(ts_unix) AS max_ts \
                     FROM file_versions WHERE ts_unix < ?1 GROUP BY orig_path \
                 ) latest ON v.orig_path = latest.orig_path AND v.ts_unix = latest.max_ts \
                 ORDER BY v.directory, v.orig_path",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![query_bound_millis(t)], row_to_version)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// As `files_at_time`, restricted to paths beginning with
    /// `dir_prefix`.
    pub fn files_in_dir_at_time(
        &self,
        dir_prefix: &str,
        t: DateTime<FixedOffset>,
    ) -> VaultResult<Vec<FileVersion>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM file_versions v \
                 WHERE v.orig_path LIKE ?1 || '%' \
                   AND v.ts_unix = ( \
                       SELECT MAX(w.ts_unix) FROM file_versions w \
                       WHERE w.orig_path = v.orig_path AND w.ts_unix < ?2 \
                   ) \
                 ORDER BY v.orig_path"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![dir_prefix, query_bound_millis(t)], row_to_version)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Full version history of a path, newest first.
    pub fn history(&self, orig_path: &str) -> VaultResult<Vec<HistoryEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT ts, content_hash, plain_size FROM file_versions \
                 WHERE orig_path = ?1 ORDER BY ts_unix DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![orig_path], |row| {
                let ts_text: String = row.get(0)?;
                let timestamp = DateTime::parse_from_rfc3339(&ts_text).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(HistoryEntry {
                    timestamp,
                    content_hash: row.get(1)?,
                    plain_size: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// All distinct session timestamps, newest first. Drives the
    /// time-travel UI.
    pub fn distinct_timestamps(&self) -> VaultResult<Vec<DateTime<FixedOffset>>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT ts, ts_unix FROM file_versions ORDER BY ts_unix DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for text in rows {
            let text = text.map_err(db_err)?;
            let ts = DateTime::parse_from_rfc3339(&text)
                .map_err(|e| VaultError::Catalog(format!("bad timestamp {text:?}: {e}")))?;
            out.push(ts);
        }
        Ok(out)
    }

    /// All distinct source directories, sorted.
    pub fn distinct_directories(&self) -> VaultResult<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT directory FROM file_versions ORDER BY directory")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Every known path with its latest version, version count and latest
    /// size.
    pub fn files_with_info(&self) -> VaultResult<Vec<FileInfo>> {
        self.file_info_query(
            "SELECT v.orig_path, v.directory, \
             (SELECT ts FROM file_versions w WHERE w.orig_path = v.orig_path \
              ORDER BY w.ts_unix DESC LIMIT 1), \
             COUNT(*), \
             (SELECT plain_size FROM file_versions w WHERE w.orig_path = v.orig_path \
              ORDER BY w.ts_unix DESC LIMIT 1) \
             FROM file_versions v GROUP BY v.orig_path \
             ORDER BY v.directory, v.orig_path",
            params![],
        )
    }

    /// Per-directory browse listing (exact directory match).
    pub fn files_in_dir(&self, directory: &str) -> VaultResult<Vec<FileInfo>> {
        self.file_info_query(
            "SELECT v.orig_path, v.directory, \
             (SELECT ts FROM file_versions w WHERE w.orig_path = v.orig_path \
              ORDER BY w.ts_unix DESC LIMIT 1), \
             COUNT(*), \
             (SELECT plain_size FROM file_versions w WHERE w.orig_path = v.orig_path \
              ORDER BY w.ts_unix DESC LIMIT 1) \
             FROM file_versions v WHERE v.directory = ?1 GROUP BY v.orig_path \
             ORDER BY v.orig_path",
            params![directory],
        )
    }

    fn file_info_query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> VaultResult<Vec<FileInfo>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, |row| {
                let orig_path: String = row.get(0)?;
                let ts_text: String = row.get(2)?;
                let latest_version = DateTime::parse_from_rfc3339(&ts_text).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let file_name = Path::new(&orig_path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(orig_path.as_str())
                    .to_string();
                Ok(FileInfo {
                    directory: row.get(1)?,
                    latest_version,
                    version_count: row.get::<_, i64>(3)? as u64,
                    plain_size: row.get::<_, i64>(4)? as u64,
                    file_name,
                    orig_path,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Reverse lookup of a server-side object name, tolerating a trailing
    /// `.enc`.
    pub fn lookup_orig_path(&self, hashed_name: &str) -> VaultResult<Option<String>> {
        let hashed = hashed_name.strip_suffix(".enc").unwrap_or(hashed_name);
        let conn = self.connection()?;
        conn.query_row(
            "SELECT orig_path FROM file_versions WHERE path_hash = ?1 LIMIT 1",
            params![hashed],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Record count plus total plain and packed bytes.
    pub fn stats(&self) -> VaultResult<CatalogStats> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(plain_size), 0), COALESCE(SUM(packed_size), 0) \
             FROM file_versions",
            [],
            |row| {
                Ok(CatalogStats {
                    record_count: row.get::<_, i64>(0)? as u64,
                    plain_bytes: row.get::<_, i64>(1)? as u64,
                    packed_bytes: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(db_err)
    }

    /// Whether the catalog holds no records at all.
    pub fn is_empty(&self) -> VaultResult<bool> {
        Ok(self.stats()?.record_count == 0)
    }

    /// Delete every record.
    pub fn clear_all(&self) -> VaultResult<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM file_versions", [])
            .map_err(db_err)?;
        Ok(())
    }
}
