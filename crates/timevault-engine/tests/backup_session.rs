//! End-to-end backup sessions against a directory-tree store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use timevault_catalog::Catalog;
use timevault_core::config::{KdfMode, VaultConfig};
use timevault_core::progress::ProgressSink;
use timevault_engine::{BackupDriver, SessionGuard};
use timevault_remote::DirStore;

struct Rig {
    _tmp: TempDir,
    root: PathBuf,
    driver: BackupDriver,
    catalog: Catalog,
    store: Arc<DirStore>,
}

fn rig() -> Rig {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("data");
    std::fs::create_dir_all(&root).unwrap();

    let remote_root = tmp.path().join("remote");
    let store = Arc::new(DirStore::new(&remote_root, "user@example.com", 1));

    let mut config = VaultConfig::default();
    config.server.user_email = "user@example.com".into();
    config.device.device_id = 1;
    config.crypto.passphrase = "pw".into();
    config.crypto.kdf = KdfMode::Legacy;
    config.backup.roots = vec![root.clone()];
    config.backup.data_dir = tmp.path().join("state");

    let catalog = Catalog::open(&tmp.path().join("state/catalog.db")).unwrap();
    let driver = BackupDriver::new(
        catalog.clone(),
        store.clone(),
        config,
        Arc::new(SessionGuard::new()),
        ProgressSink::disabled(),
    );

    Rig {
        _tmp: tmp,
        root,
        driver,
        catalog,
        store,
    }
}

fn shard_files(device_dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !device_dir.exists() {
        return out;
    }
    for session in std::fs::read_dir(device_dir).unwrap() {
        let session = session.unwrap();
        if !session.file_type().unwrap().is_dir()
            || session.file_name().to_string_lossy() == "catalogs"
        {
            continue;
        }
        for entry in std::fs::read_dir(session.path()).unwrap() {
            out.push(entry.unwrap().path());
        }
    }
    out.sort();
    out
}

#[tokio::test]
async fn first_backup_of_one_file() {
    let rig = rig();
    std::fs::write(rig.root.join("a.txt"), b"hello").unwrap();

    let summary = rig.driver.run().await.unwrap();
    assert_eq!(summary.files_backed_up, 1);
    assert_eq!(summary.shards_uploaded, 1);
    assert_eq!(summary.bytes_read, 5);

    let infos = rig.catalog.files_with_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].orig_path.ends_with("a.txt"));
    assert_eq!(infos[0].version_count, 1);
    assert_eq!(infos[0].plain_size, 5);

    // Exactly one shard, named {session_id}-000001.tar inside the
    // session directory.
    let shards = shard_files(rig.store.device_dir());
    assert_eq!(shards.len(), 1);
    let name = shards[0].file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(name, format!("{}-000001.tar", summary.session_id));

    // One encrypted catalog snapshot accompanies the session.
    let snapshot = rig
        .store
        .device_dir()
        .join("catalogs")
        .join(format!("{}.katalog.enc", summary.session_id));
    assert!(snapshot.exists());
}

#[tokio::test]
async fn unchanged_rebackup_uploads_nothing() {
    let rig = rig();
    std::fs::write(rig.root.join("a.txt"), b"hello").unwrap();

    let first = rig.driver.run().await.unwrap();
    let second = rig.driver.run().await.unwrap();

    assert_eq!(second.files_backed_up, 0);
    assert_eq!(second.shards_uploaded, 0);
    assert_eq!(second.scanned, 1);
    assert_eq!(second.unchanged, 1);

    // Still a single FileVersion and a single shard on the store.
    assert_eq!(rig.catalog.stats().unwrap().record_count, 1);
    assert_eq!(shard_files(rig.store.device_dir()).len(), 1);

    // Sessions in one process never share a whole second.
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn content_change_appends_a_version() {
    let rig = rig();
    let file = rig.root.join("a.txt");
    std::fs::write(&file, b"hello").unwrap();
    rig.driver.run().await.unwrap();

    std::fs::write(&file, b"hello!").unwrap();
    let summary = rig.driver.run().await.unwrap();
    assert_eq!(summary.files_backed_up, 1);

    let infos = rig.catalog.files_with_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].version_count, 2);
    assert_eq!(infos[0].plain_size, 6);

    let history = rig
        .catalog
        .history(&infos[0].orig_path)
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp > history[1].timestamp);
}

#[tokio::test]
async fn preflight_rejects_unconfigured_device() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(DirStore::new(&tmp.path().join("remote"), "u@e", 1));
    let config = VaultConfig::default();
    let catalog = Catalog::open(&tmp.path().join("catalog.db")).unwrap();
    let driver = BackupDriver::new(
        catalog,
        store,
        config,
        Arc::new(SessionGuard::new()),
        ProgressSink::disabled(),
    );

    assert!(driver.run().await.is_err());
}
