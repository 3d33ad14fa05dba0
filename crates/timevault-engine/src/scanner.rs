//! Incremental scanner: walk the configured roots and emit the set of
//! files whose content changed since their latest catalog entry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use timevault_catalog::Catalog;
use timevault_core::progress::{Phase, Progress, ProgressSink};
use timevault_core::types::ChangeRecord;
use timevault_core::VaultResult;
use timevault_crypto::{hash_content_file, hash_path};

use crate::session::SessionGuard;

const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub changes: Vec<ChangeRecord>,
    pub scanned: u64,
    pub unchanged: u64,
}

impl ScanOutcome {
    pub fn to_backup(&self) -> u64 {
        self.changes.len() as u64
    }
}

/// Walk every root in configured order and collect the files that need
/// backup. Per-file I/O errors skip that file; the scan itself never
/// aborts for one bad entry.
pub fn scan_roots(
    roots: &[PathBuf],
    extension_blacklist: &[String],
    catalog: &Catalog,
    progress: &ProgressSink,
    guard: &SessionGuard,
) -> VaultResult<ScanOutcome> {
    let blacklist: HashSet<String> = extension_blacklist
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut outcome = ScanOutcome::default();
    // Overlapping roots must not back a file up twice.
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for root in roots {
        debug!(root = %root.display(), "scanning root");
        for entry in walkdir::WalkDir::new(root) {
            guard.checkpoint()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %entry.path().display(), "skipping, stat failed: {e}");
                    continue;
                }
            };
            if metadata.len() == 0 {
                continue;
            }

            let abs_path = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if !seen.insert(abs_path.clone()) {
                continue;
            }

            if is_blacklisted(&abs_path, &blacklist) {
                continue;
            }

            outcome.scanned += 1;
            if outcome.scanned % PROGRESS_EVERY == 0 {
                let mut report = Progress::phase(Phase::Scanning).with_message(format!(
                    "{} scanned, {} unchanged",
                    outcome.scanned, outcome.unchanged
                ));
                report.current_dir = root.display().to_string();
                report.done_files = outcome.scanned;
                progress.emit(report);
            }

            let content_hash = match hash_content_file(&abs_path) {
                Ok(h) => h,
                Err(e) => {
                    debug!(path = %abs_path.display(), "skipping, unreadable: {e}");
                    continue;
                }
            };

            let orig_path = abs_path.to_string_lossy().into_owned();
            if catalog.needs_backup(&orig_path, &content_hash, metadata.len())? {
                outcome.changes.push(ChangeRecord {
                    directory: abs_path
                        .parent()
                        .unwrap_or(Path::new(""))
                        .to_string_lossy()
                        .into_owned(),
                    path_hash: hash_path(&orig_path),
                    orig_path,
                    plain_size: metadata.len(),
                    content_hash,
                });
            } else {
                outcome.unchanged += 1;
            }
        }
    }

    debug!(
        scanned = outcome.scanned,
        unchanged = outcome.unchanged,
        to_backup = outcome.to_backup(),
        "scan complete"
    );
    Ok(outcome)
}

fn is_blacklisted(path: &Path, blacklist: &HashSet<String>) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| blacklist.contains(&e.to_ascii_lowercase()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use tempfile::TempDir;
    use timevault_core::types::FileVersion;

    fn scan(
        roots: &[PathBuf],
        blacklist: &[String],
        catalog: &Catalog,
    ) -> ScanOutcome {
        scan_roots(
            roots,
            blacklist,
            catalog,
            &ProgressSink::disabled(),
            &SessionGuard::new(),
        )
        .unwrap()
    }

    fn empty_catalog(dir: &TempDir) -> Catalog {
        Catalog::open(&dir.path().join("catalog.db")).unwrap()
    }

    #[test]
    fn finds_new_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"world").unwrap();

        let catalog = empty_catalog(&dir);
        let outcome = scan(&[root], &[], &catalog);
        assert_eq!(outcome.to_backup(), 2);
        assert_eq!(outcome.scanned, 2);
        assert_eq!(outcome.unchanged, 0);
        assert!(outcome
            .changes
            .iter()
            .all(|c| c.path_hash.len() == 56 && c.content_hash.len() == 64));
    }

    #[test]
    fn zero_byte_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("empty"), b"").unwrap();

        let catalog = empty_catalog(&dir);
        let outcome = scan(&[root], &[], &catalog);
        assert_eq!(outcome.scanned, 0);
        assert_eq!(outcome.to_backup(), 0);
    }

    #[test]
    fn blacklist_matches_with_and_without_dot_any_case() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("movie.ISO"), b"xx").unwrap();
        std::fs::write(root.join("song.mp3"), b"yy").unwrap();
        std::fs::write(root.join("keep.txt"), b"zz").unwrap();

        let catalog = empty_catalog(&dir);
        let outcome = scan(
            &[root],
            &["iso".to_string(), ".MP3".to_string()],
            &catalog,
        );
        assert_eq!(outcome.to_backup(), 1);
        assert!(outcome.changes[0].orig_path.ends_with("keep.txt"));
    }

    #[test]
    fn unchanged_content_emits_no_record() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        let file = root.join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let catalog = empty_catalog(&dir);
        let first = scan(&[root.clone()], &[], &catalog);
        assert_eq!(first.to_backup(), 1);
        let record = &first.changes[0];

        // Commit the version the packer would have written.
        catalog
            .add_entries(&[FileVersion {
                timestamp: FixedOffset::east_opt(0)
                    .unwrap()
                    .with_ymd_and_hms(2024, 1, 15, 10, 0, 0)
                    .unwrap(),
                directory: record.directory.clone(),
                orig_path: record.orig_path.clone(),
                path_hash: record.path_hash.clone(),
                content_hash: record.content_hash.clone(),
                plain_size: record.plain_size,
                packed_size: 40,
            }])
            .unwrap();

        let second = scan(&[root.clone()], &[], &catalog);
        assert_eq!(second.to_backup(), 0);
        assert_eq!(second.unchanged, 1);

        // A content change re-arms the path.
        std::fs::write(&file, b"hello!").unwrap();
        let third = scan(&[root], &[], &catalog);
        assert_eq!(third.to_backup(), 1);
    }

    #[test]
    fn overlapping_roots_deduplicate() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();

        let catalog = empty_catalog(&dir);
        let outcome = scan(&[root.clone(), root], &[], &catalog);
        assert_eq!(outcome.to_backup(), 1);
        assert_eq!(outcome.scanned, 1);
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();

        let catalog = empty_catalog(&dir);
        let guard = SessionGuard::new();
        let _permit = guard.try_begin().unwrap();
        guard.request_stop();

        let err = scan_roots(
            &[root],
            &[],
            &catalog,
            &ProgressSink::disabled(),
            &guard,
        )
        .unwrap_err();
        assert!(matches!(err, timevault_core::VaultError::Cancelled));
    }
}
