//! Directory-tree store backend.
//!
//! Layout, byte for byte the reference server's:
//! ```text
//! {root}/{sha256(user_email)}/{device_id}/{session_id}/{session_id}-{NNNNNN}.tar
//! {root}/{sha256(user_email)}/{device_id}/catalogs/{session_id}.katalog.enc
//! ```
//! Session directories are normally `YYYYMMDD-HHMMSS`; the legacy
//! `YYYY-MM-DD` form from early clients is tolerated on read and treated
//! as end-of-day.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use timevault_core::types::shard_name;
use timevault_core::{VaultError, VaultResult};

use crate::{RemoteStore, RestoreRequest};

/// A remote store rooted in a local directory tree.
pub struct DirStore {
    device_dir: PathBuf,
}

impl DirStore {
    pub fn new(root: &Path, user_email: &str, device_id: u64) -> Self {
        let user_hash = hex::encode(Sha256::digest(user_email.as_bytes()));
        DirStore {
            device_dir: root.join(user_hash).join(device_id.to_string()),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    fn catalogs_dir(&self) -> PathBuf {
        self.device_dir.join("catalogs")
    }

    /// All shard archives under the device directory, paired with the
    /// session instant parsed from their directory name, newest first.
    fn shard_archives(&self) -> VaultResult<Vec<(PathBuf, NaiveDateTime)>> {
        let mut shards = Vec::new();
        if !self.device_dir.exists() {
            return Ok(shards);
        }
        for session in std::fs::read_dir(&self.device_dir)? {
            let session = session?;
            if !session.file_type()?.is_dir() {
                continue;
            }
            let dir_name = session.file_name().to_string_lossy().into_owned();
            if dir_name == "catalogs" {
                continue;
            }
            for entry in std::fs::read_dir(session.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("tar") {
                    continue;
                }
                let stamp = parse_session_dir(&dir_name).unwrap_or_else(|| {
                    // Unparseable directory name: fall back to the shard's
                    // modification time, like the reference server.
                    entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(|t| DateTime::<Local>::from(t).naive_local())
                        .unwrap_or(NaiveDateTime::MIN)
                });
                shards.push((path, stamp));
            }
        }
        shards.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(shards)
    }
}

#[async_trait]
impl RemoteStore for DirStore {
    async fn upload_shard(
        &self,
        shard: &[u8],
        session_id: &str,
        shard_index: u32,
    ) -> VaultResult<()> {
        let session_dir = self.device_dir.join(session_id);
        std::fs::create_dir_all(&session_dir)?;
        let path = session_dir.join(shard_name(session_id, shard_index));
        std::fs::write(&path, shard)?;
        debug!(path = %path.display(), bytes = shard.len(), "shard stored");
        Ok(())
    }

    async fn upload_catalog_snapshot(&self, sealed: &[u8], session_id: &str) -> VaultResult<()> {
        let dir = self.catalogs_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{session_id}.katalog.enc"));
        std::fs::write(&path, sealed)?;
        debug!(path = %path.display(), bytes = sealed.len(), "catalog snapshot stored");
        Ok(())
    }

    async fn list_catalog_snapshots(&self) -> VaultResult<Vec<String>> {
        let dir = self.catalogs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn download_catalog_snapshot(&self, name: &str) -> VaultResult<Vec<u8>> {
        Ok(std::fs::read(self.catalogs_dir().join(name))?)
    }

    async fn fetch_files(&self, request: &RestoreRequest) -> VaultResult<Vec<u8>> {
        if request.files.is_empty() {
            return Err(VaultError::NotFoundAtTime("no files requested".into()));
        }
        let shards = self.shard_archives()?;
        if shards.is_empty() {
            return Err(VaultError::NotFoundAtTime(
                "no backup archives found for this device".into(),
            ));
        }

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut found = 0usize;

        for item in &request.files {
            let target = parse_target_date(&item.target_date).ok_or_else(|| {
                VaultError::NotFoundAtTime(format!("unparseable target date {:?}", item.target_date))
            })?;

            // Newest shard at-or-before the target that holds the member.
            let best = shards
                .iter()
                .filter(|(_, stamp)| *stamp <= target)
                .find(|(path, _)| {
                    shard_contains(path, &item.hashed_name).unwrap_or(false)
                });

            match best {
                Some((path, stamp)) => {
                    copy_member(path, &item.hashed_name, &mut builder)?;
                    found += 1;
                    debug!(
                        member = %item.hashed_name,
                        shard = %path.display(),
                        session = %stamp,
                        "restore member resolved"
                    );
                }
                None => {
                    warn!(member = %item.hashed_name, target = %target, "no shard holds the requested version");
                }
            }
        }

        if found == 0 {
            return Err(VaultError::NotFoundAtTime(
                "requested files not found in any backup".into(),
            ));
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| VaultError::Network(format!("assembling restore archive: {e}")))?;
        encoder
            .finish()
            .map_err(|e| VaultError::Network(format!("compressing restore archive: {e}")))
    }
}

/// Match a tar member against a requested hash: bare, with `.enc`, or the
/// member stripped of `.enc`.
fn member_matches(member_name: &str, hashed_name: &str) -> bool {
    let base = member_name.rsplit('/').next().unwrap_or(member_name);
    base == hashed_name
        || base == format!("{hashed_name}.enc")
        || base.strip_suffix(".enc") == Some(hashed_name)
}

fn shard_contains(shard: &Path, hashed_name: &str) -> VaultResult<bool> {
    let mut archive = tar::Archive::new(File::open(shard)?);
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if member_matches(&path.to_string_lossy(), hashed_name) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn copy_member<W: std::io::Write>(
    shard: &Path,
    hashed_name: &str,
    builder: &mut tar::Builder<W>,
) -> VaultResult<()> {
    let mut archive = tar::Archive::new(File::open(shard)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if !member_matches(&name, hashed_name) {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(entry.header().mode().unwrap_or(0o600));
        header.set_mtime(entry.header().mtime().unwrap_or(0));
        builder.append_data(&mut header, &name, data.as_slice())?;
        return Ok(());
    }
    Err(VaultError::NotFoundAtTime(format!(
        "{hashed_name} vanished from {}",
        shard.display()
    )))
}

/// Parse a session directory name. `YYYYMMDD-HHMMSS` is the current form;
/// legacy `YYYY-MM-DD` directories read as end-of-day.
fn parse_session_dir(name: &str) -> Option<NaiveDateTime> {
    if let Ok(t) = NaiveDateTime::parse_from_str(name, "%Y%m%d-%H%M%S") {
        return Some(t);
    }
    if let Ok(d) = NaiveDate::parse_from_str(name, "%Y-%m-%d") {
        return d.and_hms_opt(23, 59, 59);
    }
    None
}

/// Parse a restore request's target date, accepting every form clients
/// have historically produced.
fn parse_target_date(text: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y%m%d-%H%M%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
            return Some(t);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return d.and_hms_opt(23, 59, 59);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.naive_local());
    }
    None
}
