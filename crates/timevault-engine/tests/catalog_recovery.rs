//! Disaster recovery: rebuilding the catalog on a clean machine from the
//! encrypted snapshots a device uploaded.

use std::sync::Arc;
use tempfile::TempDir;

use timevault_catalog::Catalog;
use timevault_core::config::{KdfMode, VaultConfig};
use timevault_core::progress::ProgressSink;
use timevault_engine::{recover_catalog, BackupDriver, SessionGuard};
use timevault_remote::DirStore;

fn driver_for(
    tmp: &TempDir,
    store: &Arc<DirStore>,
    catalog: &Catalog,
    root: &std::path::Path,
) -> BackupDriver {
    let mut config = VaultConfig::default();
    config.server.user_email = "user@example.com".into();
    config.device.device_id = 1;
    config.crypto.passphrase = "pw".into();
    config.crypto.kdf = KdfMode::Legacy;
    config.backup.roots = vec![root.to_path_buf()];
    config.backup.data_dir = tmp.path().join("state");

    BackupDriver::new(
        catalog.clone(),
        store.clone(),
        config,
        Arc::new(SessionGuard::new()),
        ProgressSink::disabled(),
    )
}

#[tokio::test]
async fn clean_machine_recovers_the_full_catalog() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("data");
    std::fs::create_dir_all(&root).unwrap();
    let store = Arc::new(DirStore::new(&tmp.path().join("remote"), "user@example.com", 1));

    // Two sessions with an edit in between, like a real device history.
    let original = Catalog::open(&tmp.path().join("state/catalog.db")).unwrap();
    let driver = driver_for(&tmp, &store, &original, &root);
    let file = root.join("a.txt");
    std::fs::write(&file, b"hello").unwrap();
    driver.run().await.unwrap();
    std::fs::write(&file, b"hello!").unwrap();
    driver.run().await.unwrap();

    assert_eq!(original.stats().unwrap().record_count, 2);

    // A clean machine: empty catalog, same passphrase and device.
    let fresh = Catalog::open(&tmp.path().join("fresh/catalog.db")).unwrap();
    assert!(fresh.is_empty().unwrap());

    let key = driver.session_key().unwrap();
    let summary = recover_catalog(
        &fresh,
        store.as_ref(),
        &key,
        &tmp.path().join("fresh/work"),
    )
    .await
    .unwrap();

    // One snapshot per session; all merge.
    assert_eq!(summary.snapshots_listed, 2);
    assert_eq!(summary.snapshots_merged, 2);

    // Multi-set equality with the original catalog.
    assert_eq!(fresh.stats().unwrap(), original.stats().unwrap());
    let orig_path = &original.files_with_info().unwrap()[0].orig_path;
    assert_eq!(
        fresh.history(orig_path).unwrap(),
        original.history(orig_path).unwrap()
    );
}

#[tokio::test]
async fn foreign_snapshots_are_skipped_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("data");
    std::fs::create_dir_all(&root).unwrap();
    let store = Arc::new(DirStore::new(&tmp.path().join("remote"), "user@example.com", 1));

    let original = Catalog::open(&tmp.path().join("state/catalog.db")).unwrap();
    let driver = driver_for(&tmp, &store, &original, &root);
    std::fs::write(root.join("a.txt"), b"hello").unwrap();
    driver.run().await.unwrap();

    // A snapshot sealed under someone else's passphrase sits alongside.
    use timevault_remote::RemoteStore;
    let foreign_key = timevault_crypto::MasterKey::from_bytes([42u8; 32]);
    let sealed = timevault_crypto::seal(b"not ours", &foreign_key).unwrap();
    store
        .upload_catalog_snapshot(&sealed, "20200101-000000")
        .await
        .unwrap();

    let fresh = Catalog::open(&tmp.path().join("fresh/catalog.db")).unwrap();
    let key = driver.session_key().unwrap();
    let summary = recover_catalog(
        &fresh,
        store.as_ref(),
        &key,
        &tmp.path().join("fresh/work"),
    )
    .await
    .unwrap();

    assert_eq!(summary.snapshots_listed, 2);
    assert_eq!(summary.snapshots_merged, 1);
    assert_eq!(fresh.stats().unwrap().record_count, 1);
}
