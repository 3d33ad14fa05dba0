//! timevault-core: shared types, configuration and errors for TimeVault
//!
//! TimeVault is a zero-knowledge, Time-Machine-style versioned backup
//! client: changed files are encrypted locally, packed into bounded tar
//! shards, and uploaded together with an encrypted snapshot of the local
//! catalog. Any file or directory can later be materialized as it existed
//! at any earlier instant.

pub mod config;
pub mod error;
pub mod progress;
pub mod types;

pub use error::{VaultError, VaultResult};

/// Contractual default for the shard size bound (25 MiB).
pub const DEFAULT_MAX_SHARD_BYTES: u64 = 25 * 1024 * 1024;
