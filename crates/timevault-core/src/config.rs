//! Frozen client configuration, loaded from `timevault.toml`.
//!
//! The set of fields is closed: unknown keys are rejected at parse time
//! so a typo cannot silently disable a setting.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};
use crate::DEFAULT_MAX_SHARD_BYTES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub backup: BackupConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Base URL of the remote store, or a local directory path when the
    /// target is a disk/NAS tree.
    pub base_url: String,
    /// Bearer token presented on every request.
    pub bearer_token: String,
    /// Account e-mail; its SHA-256 names the per-user directory on the
    /// server.
    pub user_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Server-assigned device identifier. Zero means unregistered.
    pub device_id: u64,
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Root directories walked by the scanner, in order.
    pub roots: Vec<PathBuf>,
    /// File extensions excluded from backup, matched case-insensitively
    /// with or without a leading dot.
    pub extension_blacklist: Vec<String>,
    /// Shard size bound; a shard may overflow slightly to include the
    /// member that tipped it.
    pub max_shard_bytes: u64,
    /// Local state directory (catalog, session scratch space).
    pub data_dir: PathBuf,
}

/// Key-derivation configuration.
///
/// `argon2id` is the default for new configurations. `legacy` keeps the
/// plain SHA-256 derivation for data already sealed under it; switching
/// an existing device requires re-sealing, never a silent change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptoConfig {
    /// Encryption passphrase. All shards and catalog snapshots for this
    /// device are sealed under the key derived from it.
    pub passphrase: String,
    /// Derivation mode: "argon2id" or "legacy".
    pub kdf: KdfMode,
    /// Per-user salt, 16 bytes hex. Generated at init; required for
    /// argon2id.
    pub kdf_salt: String,
    /// Argon2id memory cost in KiB.
    pub argon2_mem_cost_kib: u32,
    /// Argon2id iterations.
    pub argon2_time_cost: u32,
    /// Argon2id lanes.
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfMode {
    Argon2id,
    Legacy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bearer_token: String::new(),
            user_email: String::new(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            device_name: String::new(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extension_blacklist: ["mp3", "mp4", "wav", "m4a", "iso", "vmdk", "vdi"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_shard_bytes: DEFAULT_MAX_SHARD_BYTES,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            kdf: KdfMode::Argon2id,
            kdf_salt: String::new(),
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".timevault")
}

impl VaultConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> VaultResult<Self> {
        toml::from_str(text).map_err(|e| VaultError::Config(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> VaultResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Write the configuration back out as TOML.
    pub fn save(&self, path: &Path) -> VaultResult<()> {
        let text = toml::to_string_pretty(self).map_err(|e| VaultError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// A fresh configuration with a newly generated KDF salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut config = Self::default();
        config.crypto.kdf_salt = hex::encode(salt);
        config
    }

    /// Preflight for a backup session: device registered, passphrase set,
    /// at least one root configured.
    pub fn check_ready_for_backup(&self) -> VaultResult<()> {
        if self.device.device_id == 0 {
            return Err(VaultError::Config("no device registered".into()));
        }
        if self.crypto.passphrase.is_empty() {
            return Err(VaultError::Config("encryption passphrase not set".into()));
        }
        if self.backup.roots.is_empty() {
            return Err(VaultError::Config("no backup roots configured".into()));
        }
        Ok(())
    }
}
