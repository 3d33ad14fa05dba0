//! Point-in-time restore planner.
//!
//! Read-only against the catalog: resolves a (path-or-subtree, instant)
//! query to the exact FileVersions in effect, requests the smallest
//! sufficient shard member set from the store, then decrypts and
//! materializes the originals.

use chrono::{DateTime, FixedOffset};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use timevault_catalog::Catalog;
use timevault_core::progress::{Phase, Progress, ProgressSink};
use timevault_core::types::FileVersion;
use timevault_core::{VaultError, VaultResult};
use timevault_crypto::{open, MasterKey};
use timevault_remote::{RemoteStore, RestoreItem, RestoreRequest};

use crate::session::SessionGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub requested: u64,
    pub restored: u64,
}

enum Placement<'a> {
    /// Single file: `{root}/{basename}`.
    Flat(&'a Path),
    /// Subtree: `{root}/{path relative to the prefix}`.
    Relative { root: &'a Path, prefix: &'a str },
    /// Whole snapshot: `{root}/{full original path}`.
    Mirrored(&'a Path),
    /// No destination root: write back over the original path.
    InPlace,
}

impl Placement<'_> {
    fn destination(&self, orig_path: &str) -> PathBuf {
        match self {
            Placement::InPlace => PathBuf::from(orig_path),
            Placement::Flat(root) => {
                let base = Path::new(orig_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| orig_path.trim_start_matches('/').to_string());
                root.join(base)
            }
            Placement::Relative { root, prefix } => {
                let rel = orig_path
                    .strip_prefix(prefix)
                    .unwrap_or(orig_path)
                    .trim_start_matches('/');
                root.join(rel)
            }
            Placement::Mirrored(root) => root.join(orig_path.trim_start_matches('/')),
        }
    }
}

pub struct RestorePlanner {
    catalog: Catalog,
    remote: Arc<dyn RemoteStore>,
    key: MasterKey,
    guard: Arc<SessionGuard>,
    progress: ProgressSink,
}

impl RestorePlanner {
    pub fn new(
        catalog: Catalog,
        remote: Arc<dyn RemoteStore>,
        key: MasterKey,
        guard: Arc<SessionGuard>,
        progress: ProgressSink,
    ) -> Self {
        RestorePlanner {
            catalog,
            remote,
            key,
            guard,
            progress,
        }
    }

    /// Restore one file as it existed at `target_time`.
    pub async fn restore_file(
        &self,
        orig_path: &str,
        target_time: DateTime<FixedOffset>,
        destination_root: Option<&Path>,
    ) -> VaultResult<RestoreSummary> {
        let version = self
            .catalog
            .file_at_time(orig_path, target_time)?
            .ok_or_else(|| {
                VaultError::NotFoundAtTime(format!("{orig_path} has no version at {target_time}"))
            })?;
        let placement = match destination_root {
            Some(root) => Placement::Flat(root),
            None => Placement::InPlace,
        };
        self.run(vec![version], placement).await
    }

    /// Restore every file under `dir_prefix` as of `target_time`.
    pub async fn restore_directory(
        &self,
        dir_prefix: &str,
        target_time: DateTime<FixedOffset>,
        destination_root: Option<&Path>,
    ) -> VaultResult<RestoreSummary> {
        let versions = self.catalog.files_in_dir_at_time(dir_prefix, target_time)?;
        if versions.is_empty() {
            return Err(VaultError::NotFoundAtTime(format!(
                "nothing under {dir_prefix} at {target_time}"
            )));
        }
        let placement = match destination_root {
            Some(root) => Placement::Relative {
                root,
                prefix: dir_prefix,
            },
            None => Placement::InPlace,
        };
        self.run(versions, placement).await
    }

    /// Restore the complete snapshot as of `target_time`.
    pub async fn restore_snapshot(
        &self,
        target_time: DateTime<FixedOffset>,
        destination_root: Option<&Path>,
    ) -> VaultResult<RestoreSummary> {
        let versions = self.catalog.files_at_time(target_time)?;
        if versions.is_empty() {
            return Err(VaultError::NotFoundAtTime(format!(
                "no backed-up files at {target_time}"
            )));
        }
        let placement = match destination_root {
            Some(root) => Placement::Mirrored(root),
            None => Placement::InPlace,
        };
        self.run(versions, placement).await
    }

    async fn run(
        &self,
        versions: Vec<FileVersion>,
        placement: Placement<'_>,
    ) -> VaultResult<RestoreSummary> {
        let permit = self.guard.try_begin()?;
        let result = self.fetch_and_materialize(&versions, &placement).await;
        drop(permit);

        match &result {
            Ok(summary) => {
                let mut report = Progress::phase(Phase::Complete).with_message(format!(
                    "{} of {} files restored",
                    summary.restored, summary.requested
                ));
                report.total_files = summary.requested;
                report.done_files = summary.restored;
                report.percent = 100.0;
                self.progress.emit(report);
            }
            Err(VaultError::Cancelled) => {
                self.progress.emit(Progress::phase(Phase::Cancelled));
            }
            Err(e) => {
                self.progress
                    .emit(Progress::phase(Phase::Failed).with_message(e.to_string()));
            }
        }
        result
    }

    async fn fetch_and_materialize(
        &self,
        versions: &[FileVersion],
        placement: &Placement<'_>,
    ) -> VaultResult<RestoreSummary> {
        let total = versions.len() as u64;
        let mut report = Progress::phase(Phase::Downloading)
            .with_message(format!("requesting {total} files"));
        report.total_files = total;
        self.progress.emit(report);

        // The request carries each version's OWN timestamp, not the
        // instant the user asked for: the store locates the shard by
        // session directory, and the session may have started a few
        // hundred milliseconds before the user's whole-second query.
        let request = RestoreRequest {
            files: versions
                .iter()
                .map(|v| RestoreItem {
                    hashed_name: v.path_hash.clone(),
                    target_date: v.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
                })
                .collect(),
        };
        let response = self.remote.fetch_files(&request).await?;

        let by_hash: HashMap<&str, &FileVersion> = versions
            .iter()
            .map(|v| (v.path_hash.as_str(), v))
            .collect();

        self.progress
            .emit(Progress::phase(Phase::Extracting).with_message("decrypting files"));

        let mut archive = tar::Archive::new(GzDecoder::new(response.as_slice()));
        let mut restored = 0u64;
        for entry in archive.entries()? {
            self.guard.checkpoint()?;

            let mut entry = entry?;
            let member_name = entry.path()?.to_string_lossy().into_owned();
            let base = member_name.rsplit('/').next().unwrap_or(&member_name);
            let hashed = base.strip_suffix(".enc").unwrap_or(base).to_string();
            let Some(version) = by_hash.get(hashed.as_str()) else {
                debug!(member = %member_name, "unrequested member in response, skipping");
                continue;
            };

            let mut sealed = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut sealed)?;

            // Wrong key or bit-rot on one member must not sink the rest.
            let plaintext = match open(&sealed, &self.key) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %version.orig_path, "skipping member, decrypt failed: {e}");
                    continue;
                }
            };

            let dest = placement.destination(&version.orig_path);
            if let Err(e) = write_restored(&dest, &plaintext) {
                warn!(path = %dest.display(), "skipping member, write failed: {e}");
                continue;
            }
            restored += 1;

            let mut report = Progress::phase(Phase::Extracting)
                .with_message(format!("{restored}/{total} restored"));
            report.current_file = version.file_name().to_string();
            report.total_files = total;
            report.done_files = restored;
            report.percent = restored as f64 / total as f64 * 100.0;
            self.progress.emit(report);
        }

        info!(requested = total, restored, "restore finished");
        Ok(RestoreSummary {
            requested: total,
            restored,
        })
    }
}

/// Create missing parents (0755) and overwrite the destination.
fn write_restored(dest: &Path, plaintext: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, plaintext)
}
