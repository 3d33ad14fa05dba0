//! Shard packer: stream changed files through the crypto pipeline into
//! size-bounded tar shards, uploading each sealed shard in turn.
//!
//! A shard may overflow `max_shard_bytes` slightly: the member that tips
//! the size is always included before the shard is closed.

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use timevault_core::progress::{Phase, Progress, ProgressSink};
use timevault_core::types::{shard_name, ChangeRecord, FileVersion, SessionStamp};
use timevault_core::VaultResult;
use timevault_crypto::{seal, MasterKey};
use timevault_remote::RemoteStore;

use crate::session::SessionGuard;

pub struct PackContext<'a> {
    pub remote: &'a dyn RemoteStore,
    pub key: &'a MasterKey,
    pub session: SessionStamp,
    pub max_shard_bytes: u64,
    pub temp_dir: &'a Path,
    pub progress: &'a ProgressSink,
    pub guard: &'a SessionGuard,
}

#[derive(Debug, Default)]
pub struct PackOutcome {
    /// FileVersions for everything that made it into an uploaded shard,
    /// ready for the catalog commit.
    pub entries: Vec<FileVersion>,
    pub shards_uploaded: u32,
    pub bytes_read: u64,
}

struct ShardWriter {
    builder: tar::Builder<File>,
    path: PathBuf,
    member_bytes: u64,
}

fn open_shard(temp_dir: &Path, session_id: &str, index: u32) -> VaultResult<ShardWriter> {
    let path = temp_dir.join(shard_name(session_id, index));
    let file = File::create(&path)?;
    Ok(ShardWriter {
        builder: tar::Builder::new(file),
        path,
        member_bytes: 0,
    })
}

async fn seal_and_upload(
    writer: ShardWriter,
    ctx: &PackContext<'_>,
    session_id: &str,
    index: u32,
) -> VaultResult<()> {
    let mut file = writer.builder.into_inner()?;
    use std::io::Write;
    file.flush()?;
    drop(file);

    let bytes = std::fs::read(&writer.path)?;
    ctx.remote.upload_shard(&bytes, session_id, index).await?;
    std::fs::remove_file(&writer.path)?;
    info!(shard = %shard_name(session_id, index), bytes = bytes.len(), "shard uploaded");
    Ok(())
}

/// Pack every change record into shards and upload them. Committing the
/// returned FileVersions is the caller's job; they become durable only
/// through `Catalog::add_entries`.
pub async fn pack_session(
    ctx: &PackContext<'_>,
    changes: &[ChangeRecord],
) -> VaultResult<PackOutcome> {
    let session_id = ctx.session.id();
    let total_files = changes.len() as u64;
    let total_bytes: u64 = changes.iter().map(|c| c.plain_size).sum();

    let mut outcome = PackOutcome::default();
    let mut shard_index = 1u32;
    let mut writer = open_shard(ctx.temp_dir, &session_id, shard_index)?;

    for (done, change) in changes.iter().enumerate() {
        ctx.guard.checkpoint()?;

        let mut report = Progress::phase(Phase::Encrypting)
            .with_message(format!("sealing {}", file_name(&change.orig_path)));
        report.current_file = file_name(&change.orig_path).to_string();
        report.total_files = total_files;
        report.done_files = done as u64;
        report.total_bytes = total_bytes;
        report.done_bytes = outcome.bytes_read;
        report.percent = percent(done as u64, total_files);
        ctx.progress.emit(report);

        // Per-file failures drop the file: no member, no catalog entry.
        let plaintext = match std::fs::read(&change.orig_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %change.orig_path, "dropped from session, read failed: {e}");
                continue;
            }
        };
        let sealed = match seal(&plaintext, ctx.key) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %change.orig_path, "dropped from session, seal failed: {e}");
                continue;
            }
        };

        let mut header = tar::Header::new_gnu();
        header.set_size(sealed.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(ctx.session.instant().timestamp() as u64);
        writer.builder.append_data(
            &mut header,
            format!("{}.enc", change.path_hash),
            sealed.as_slice(),
        )?;
        writer.member_bytes += sealed.len() as u64;
        outcome.bytes_read += plaintext.len() as u64;

        outcome.entries.push(FileVersion {
            timestamp: ctx.session.instant(),
            directory: change.directory.clone(),
            orig_path: change.orig_path.clone(),
            path_hash: change.path_hash.clone(),
            content_hash: change.content_hash.clone(),
            plain_size: change.plain_size,
            packed_size: sealed.len() as u64,
        });

        if writer.member_bytes > ctx.max_shard_bytes {
            let mut report = Progress::phase(Phase::Uploading)
                .with_message(format!("uploading shard {shard_index}"));
            report.total_files = total_files;
            report.done_files = done as u64 + 1;
            report.total_bytes = total_bytes;
            report.done_bytes = outcome.bytes_read;
            report.percent = percent(done as u64 + 1, total_files);
            ctx.progress.emit(report);

            seal_and_upload(writer, ctx, &session_id, shard_index).await?;
            outcome.shards_uploaded += 1;
            shard_index += 1;
            writer = open_shard(ctx.temp_dir, &session_id, shard_index)?;
        }
    }

    if writer.member_bytes > 0 {
        let mut report =
            Progress::phase(Phase::Uploading).with_message("uploading final shard");
        report.total_files = total_files;
        report.done_files = total_files;
        report.total_bytes = total_bytes;
        report.done_bytes = outcome.bytes_read;
        report.percent = 95.0;
        ctx.progress.emit(report);

        seal_and_upload(writer, ctx, &session_id, shard_index).await?;
        outcome.shards_uploaded += 1;
    } else {
        // Trailing empty shard file from the last rollover.
        drop(writer.builder.into_inner()?);
        let _ = std::fs::remove_file(&writer.path);
    }

    Ok(outcome)
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

impl std::fmt::Debug for PackContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackContext")
            .field("session", &self.session.id())
            .field("max_shard_bytes", &self.max_shard_bytes)
            .field("temp_dir", &self.temp_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use timevault_crypto::hash_path;
    use timevault_remote::DirStore;

    fn key() -> MasterKey {
        MasterKey::from_bytes([9u8; 32])
    }

    fn change_for(path: &Path) -> ChangeRecord {
        let orig = path.to_string_lossy().into_owned();
        ChangeRecord {
            directory: path.parent().unwrap().to_string_lossy().into_owned(),
            path_hash: hash_path(&orig),
            orig_path: orig,
            plain_size: std::fs::metadata(path).unwrap().len(),
            content_hash: "unused-here".into(),
        }
    }

    async fn pack(
        changes: &[ChangeRecord],
        store: &DirStore,
        max_shard_bytes: u64,
        temp: &Path,
    ) -> PackOutcome {
        let guard = SessionGuard::new();
        let ctx = PackContext {
            remote: store,
            key: &key(),
            session: SessionStamp::now(),
            max_shard_bytes,
            temp_dir: temp,
            progress: &ProgressSink::disabled(),
            guard: &guard,
        };
        pack_session(&ctx, changes).await.unwrap()
    }

    fn shard_members(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.push((name, data));
        }
        out
    }

    #[tokio::test]
    async fn single_shard_holds_sealed_members() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"hello").unwrap();
        let change = change_for(&src.join("a.txt"));

        let store = DirStore::new(&dir.path().join("remote"), "u@e", 1);
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();

        let outcome = pack(std::slice::from_ref(&change), &store, 1 << 20, &temp).await;
        assert_eq!(outcome.shards_uploaded, 1);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].plain_size, 5);
        assert!(outcome.entries[0].packed_size > 0);

        // Temp directory is clean again.
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);

        // The uploaded member decrypts back to the original content.
        let session_dir = std::fs::read_dir(store.device_dir())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let shard = std::fs::read_dir(&session_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let members = shard_members(&shard);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, format!("{}.enc", change.path_hash));
        assert_eq!(
            timevault_crypto::open(&members[0].1, &key()).unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn rollover_splits_and_covers_every_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut changes = Vec::new();
        for i in 0..30 {
            // Incompressible content so sealed sizes stay predictable.
            let mut content = vec![0u8; 1024];
            rng.fill_bytes(&mut content);
            let path = src.join(format!("f{i:02}.bin"));
            std::fs::write(&path, &content).unwrap();
            changes.push(change_for(&path));
        }

        let store = DirStore::new(&dir.path().join("remote"), "u@e", 1);
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();

        let outcome = pack(&changes, &store, 8 * 1024, &temp).await;
        assert!(outcome.shards_uploaded >= 2, "expected a rollover");
        assert_eq!(outcome.entries.len(), 30);

        // Union of shard members equals the input set, each exactly once.
        let session_dir = std::fs::read_dir(store.device_dir())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let mut member_names = Vec::new();
        for shard in std::fs::read_dir(&session_dir).unwrap() {
            for (name, _) in shard_members(&shard.unwrap().path()) {
                member_names.push(name);
            }
        }
        member_names.sort();
        let mut expected: Vec<_> = changes
            .iter()
            .map(|c| format!("{}.enc", c.path_hash))
            .collect();
        expected.sort();
        assert_eq!(member_names, expected);
    }

    #[tokio::test]
    async fn unreadable_file_is_dropped_silently() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"hello").unwrap();
        let good = change_for(&src.join("a.txt"));
        let mut missing = good.clone();
        missing.orig_path = src.join("vanished.txt").to_string_lossy().into_owned();

        let store = DirStore::new(&dir.path().join("remote"), "u@e", 1);
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();

        let outcome = pack(&[missing, good], &store, 1 << 20, &temp).await;
        assert_eq!(outcome.entries.len(), 1);
        assert!(outcome.entries[0].orig_path.ends_with("a.txt"));
    }
}
