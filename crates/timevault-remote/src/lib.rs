//! timevault-remote: the seam between the backup engine and the remote
//! object store.
//!
//! The engine never speaks a wire protocol; it drives the `RemoteStore`
//! trait. `DirStore` is the shipped backend: a directory tree laid out
//! exactly like the reference server's storage
//! (`{sha256(email)}/{device}/{session}/{session}-{NNNNNN}.tar`), which
//! doubles as a local-disk/NAS backup target and keeps the whole engine
//! testable without a network.

mod dir;

pub use dir::DirStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use timevault_core::VaultResult;

/// One file requested from the store during a restore.
///
/// `target_date` is the timestamp of the catalog version being restored
/// (naive local time), not the instant the user asked for; the store uses
/// it to locate the session directory holding that exact version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreItem {
    pub hashed_name: String,
    pub target_date: String,
}

/// Wire body of a restore request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub files: Vec<RestoreItem>,
}

/// Operations the engine needs from the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Store one sealed shard for the session. `shard_index` is 1-based.
    async fn upload_shard(
        &self,
        shard: &[u8],
        session_id: &str,
        shard_index: u32,
    ) -> VaultResult<()>;

    /// Store the session's encrypted catalog snapshot.
    async fn upload_catalog_snapshot(&self, sealed: &[u8], session_id: &str) -> VaultResult<()>;

    /// Names of all catalog snapshots stored for this device.
    async fn list_catalog_snapshots(&self) -> VaultResult<Vec<String>>;

    /// Fetch one snapshot by the name `list_catalog_snapshots` returned.
    async fn download_catalog_snapshot(&self, name: &str) -> VaultResult<Vec<u8>>;

    /// Resolve the requested files against stored shards and return a
    /// gzipped tar whose members are the matching `{path_hash}.enc`
    /// payloads.
    async fn fetch_files(&self, request: &RestoreRequest) -> VaultResult<Vec<u8>>;
}
