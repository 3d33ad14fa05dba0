//! Backup driver: orchestrates one session end to end.
//!
//! scan → pack/upload → catalog commit → snapshot upload. The catalog
//! commit is the durability point; everything uploaded before it is
//! unreachable until the commit lands, and nothing after it can undo it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use timevault_catalog::Catalog;
use timevault_core::config::VaultConfig;
use timevault_core::progress::{Phase, Progress, ProgressSink};
use timevault_core::types::{CatalogStats, SessionStamp};
use timevault_core::{VaultError, VaultResult};
use timevault_crypto::{key_from_config, seal, MasterKey};
use timevault_remote::RemoteStore;

use crate::packer::{pack_session, PackContext};
use crate::scanner::scan_roots;
use crate::session::{DriverState, SessionGuard};

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub scanned: u64,
    pub unchanged: u64,
    pub files_backed_up: u64,
    pub shards_uploaded: u32,
    pub bytes_read: u64,
}

#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub state: DriverState,
    pub device_id: u64,
    pub device_name: String,
    pub catalog: CatalogStats,
}

#[derive(Clone)]
pub struct BackupDriver {
    catalog: Catalog,
    remote: Arc<dyn RemoteStore>,
    config: VaultConfig,
    guard: Arc<SessionGuard>,
    progress: ProgressSink,
}

impl BackupDriver {
    pub fn new(
        catalog: Catalog,
        remote: Arc<dyn RemoteStore>,
        config: VaultConfig,
        guard: Arc<SessionGuard>,
        progress: ProgressSink,
    ) -> Self {
        BackupDriver {
            catalog,
            remote,
            config,
            guard,
            progress,
        }
    }

    /// Derive the session key from the configured passphrase.
    pub fn session_key(&self) -> VaultResult<MasterKey> {
        key_from_config(&self.config.crypto)
    }

    /// Run one backup session to completion.
    pub async fn run(&self) -> VaultResult<SessionSummary> {
        let permit = self.guard.try_begin()?;
        self.progress.emit(Progress::phase(Phase::Starting));

        if let Err(e) = self.config.check_ready_for_backup() {
            self.emit_failed(&e);
            return Err(e);
        }

        let result = self.run_session().await;
        drop(permit);

        match &result {
            Ok(summary) => {
                let mut report = Progress::phase(Phase::Complete).with_message(format!(
                    "{} files backed up in {} shards",
                    summary.files_backed_up, summary.shards_uploaded
                ));
                report.total_files = summary.files_backed_up;
                report.done_files = summary.files_backed_up;
                report.percent = 100.0;
                self.progress.emit(report);
            }
            Err(VaultError::Cancelled) => {
                self.progress.emit(Progress::phase(Phase::Cancelled));
            }
            Err(e) => self.emit_failed(e),
        }
        result
    }

    /// Cooperative stop; the session observes it at the next file
    /// boundary.
    pub fn stop(&self) {
        self.guard.request_stop();
    }

    pub fn status(&self) -> VaultResult<DriverStatus> {
        Ok(DriverStatus {
            state: self.guard.state(),
            device_id: self.config.device.device_id,
            device_name: self.config.device.device_name.clone(),
            catalog: self.catalog.stats()?,
        })
    }

    fn emit_failed(&self, e: &VaultError) {
        self.progress
            .emit(Progress::phase(Phase::Failed).with_message(e.to_string()));
    }

    async fn run_session(&self) -> VaultResult<SessionSummary> {
        let key = self.session_key()?;
        let session = self.claim_distinct_second().await;
        let session_id = session.id();
        info!(session = %session_id, "backup session starting");

        let temp_dir = self.temp_dir(&session_id);
        std::fs::create_dir_all(&temp_dir)?;
        let result = self.run_phases(&key, session, &temp_dir).await;
        if let Err(e) = std::fs::remove_dir_all(&temp_dir) {
            warn!(dir = %temp_dir.display(), "failed to clean session temp dir: {e}");
        }
        result
    }

    async fn run_phases(
        &self,
        key: &MasterKey,
        session: SessionStamp,
        temp_dir: &std::path::Path,
    ) -> VaultResult<SessionSummary> {
        let session_id = session.id();

        self.progress
            .emit(Progress::phase(Phase::Scanning).with_message("scanning roots"));
        let scan = scan_roots(
            &self.config.backup.roots,
            &self.config.backup.extension_blacklist,
            &self.catalog,
            &self.progress,
            &self.guard,
        )?;

        let mut report = Progress::phase(Phase::Scanning).with_message(format!(
            "scan complete: {} scanned, {} unchanged, {} to back up",
            scan.scanned,
            scan.unchanged,
            scan.to_backup()
        ));
        report.total_files = scan.to_backup();
        self.progress.emit(report);

        if scan.changes.is_empty() {
            info!(session = %session_id, scanned = scan.scanned, "nothing changed");
            return Ok(SessionSummary {
                session_id,
                scanned: scan.scanned,
                unchanged: scan.unchanged,
                files_backed_up: 0,
                shards_uploaded: 0,
                bytes_read: 0,
            });
        }

        let ctx = PackContext {
            remote: self.remote.as_ref(),
            key,
            session,
            max_shard_bytes: self.config.backup.max_shard_bytes,
            temp_dir,
            progress: &self.progress,
            guard: &self.guard,
        };
        let packed = pack_session(&ctx, &scan.changes).await?;

        // Commit point: after this the session's versions are durable.
        self.progress
            .emit(Progress::phase(Phase::UpdatingCatalog).with_message("committing catalog"));
        self.catalog.add_entries(&packed.entries)?;
        info!(
            session = %session_id,
            entries = packed.entries.len(),
            "catalog committed"
        );

        self.progress.emit(
            Progress::phase(Phase::UploadingCatalog).with_message("uploading catalog snapshot"),
        );
        let snapshot_path = temp_dir.join("catalog.snapshot");
        self.catalog.export_snapshot(&snapshot_path)?;
        let sealed = seal(&std::fs::read(&snapshot_path)?, key)?;
        self.remote
            .upload_catalog_snapshot(&sealed, &session_id)
            .await?;
        let _ = std::fs::remove_file(&snapshot_path);

        info!(
            session = %session_id,
            files = packed.entries.len(),
            shards = packed.shards_uploaded,
            "backup session complete"
        );
        Ok(SessionSummary {
            session_id,
            scanned: scan.scanned,
            unchanged: scan.unchanged,
            files_backed_up: packed.entries.len() as u64,
            shards_uploaded: packed.shards_uploaded,
            bytes_read: packed.bytes_read,
        })
    }

    /// Stamp the session, sleeping as needed so two sessions in the same
    /// process never share a whole second.
    async fn claim_distinct_second(&self) -> SessionStamp {
        loop {
            let stamp = SessionStamp::now();
            if self.guard.claim_session_second(stamp.whole_second()) {
                return stamp;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn temp_dir(&self, session_id: &str) -> PathBuf {
        self.config
            .backup
            .data_dir
            .join(format!("tmp-{session_id}"))
    }
}
