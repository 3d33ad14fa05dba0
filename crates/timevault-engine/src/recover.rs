//! Catalog recovery: rebuild an empty local catalog from the encrypted
//! snapshots stored with the backups.
//!
//! Every snapshot the store lists is tried; ones sealed under a different
//! passphrase or corrupted in transit are skipped. Importing all of them
//! rather than just the newest is deliberate: snapshots are full exports
//! and the merge rule is idempotent, so extra imports cost nothing and
//! cover a truncated newest snapshot.

use std::path::Path;
use tracing::{info, warn};

use timevault_catalog::Catalog;
use timevault_core::{VaultError, VaultResult};
use timevault_crypto::{open, MasterKey};
use timevault_remote::RemoteStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub snapshots_listed: u64,
    pub snapshots_merged: u64,
    pub records_imported: u64,
}

pub async fn recover_catalog(
    catalog: &Catalog,
    remote: &dyn RemoteStore,
    key: &MasterKey,
    work_dir: &Path,
) -> VaultResult<RecoverySummary> {
    std::fs::create_dir_all(work_dir)?;

    let names = remote.list_catalog_snapshots().await?;
    let mut summary = RecoverySummary {
        snapshots_listed: names.len() as u64,
        ..RecoverySummary::default()
    };

    for name in &names {
        let sealed = match remote.download_catalog_snapshot(name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(snapshot = %name, "download failed, skipping: {e}");
                continue;
            }
        };
        let plain = match open(&sealed, key) {
            Ok(bytes) => bytes,
            Err(VaultError::Integrity(e)) => {
                warn!(snapshot = %name, "cannot decrypt, skipping: {e}");
                continue;
            }
            Err(e) => return Err(e),
        };

        let temp = work_dir.join("snapshot.import");
        std::fs::write(&temp, &plain)?;
        match catalog.import_snapshot(&temp) {
            Ok(records) => {
                summary.snapshots_merged += 1;
                summary.records_imported += records;
            }
            Err(VaultError::Integrity(e)) => {
                warn!(snapshot = %name, "not a usable snapshot, skipping: {e}");
            }
            Err(e) => {
                let _ = std::fs::remove_file(&temp);
                return Err(e);
            }
        }
        let _ = std::fs::remove_file(&temp);
    }

    info!(
        listed = summary.snapshots_listed,
        merged = summary.snapshots_merged,
        records = summary.records_imported,
        "catalog recovery finished"
    );
    Ok(summary)
}
