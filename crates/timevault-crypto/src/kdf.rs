//! Passphrase → master key derivation.

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use timevault_core::config::{CryptoConfig, KdfMode};
use timevault_core::{VaultError, VaultResult};

use crate::KEY_SIZE;

/// The 256-bit session key every shard member and catalog snapshot of a
/// device is sealed under.
///
/// The bytes live inside `Zeroizing`, so they are wiped as soon as the
/// key goes out of scope, and no `Debug`/`Display` path ever prints key
/// material.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_SIZE]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Accept key material from a digest or any other byte source,
    /// rejecting anything that is not exactly 256 bits.
    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let raw: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            VaultError::Crypto(format!(
                "key material must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(Zeroizing::new(raw)))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Derivation parameters, resolved from the crypto config section.
#[derive(Debug, Clone)]
pub enum KdfSettings {
    /// Argon2id with a per-user salt.
    Argon2id {
        salt: [u8; 16],
        mem_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    },
    /// Plain SHA-256 of the passphrase. Kept only for data already sealed
    /// under this rule; new configurations use Argon2id.
    Legacy,
}

impl KdfSettings {
    pub fn from_config(config: &CryptoConfig) -> VaultResult<Self> {
        match config.kdf {
            KdfMode::Legacy => Ok(KdfSettings::Legacy),
            KdfMode::Argon2id => {
                let raw = hex::decode(&config.kdf_salt)
                    .map_err(|e| VaultError::Config(format!("kdf_salt is not hex: {e}")))?;
                let salt: [u8; 16] = raw
                    .try_into()
                    .map_err(|_| VaultError::Config("kdf_salt must be 16 bytes".into()))?;
                Ok(KdfSettings::Argon2id {
                    salt,
                    mem_cost_kib: config.argon2_mem_cost_kib,
                    time_cost: config.argon2_time_cost,
                    parallelism: config.argon2_parallelism,
                })
            }
        }
    }
}

/// Derive the master key from a passphrase. Deterministic: the same
/// passphrase and settings always produce the same key.
pub fn derive_key(passphrase: &SecretString, settings: &KdfSettings) -> VaultResult<MasterKey> {
    match settings {
        KdfSettings::Legacy => {
            let digest = Sha256::digest(passphrase.expose_secret().as_bytes());
            MasterKey::from_slice(&digest)
        }
        KdfSettings::Argon2id {
            salt,
            mem_cost_kib,
            time_cost,
            parallelism,
        } => {
            let params = Params::new(*mem_cost_kib, *time_cost, *parallelism, Some(KEY_SIZE))
                .map_err(|e| VaultError::Crypto(format!("invalid Argon2id params: {e}")))?;
            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

            let mut key = [0u8; KEY_SIZE];
            argon2
                .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
                .map_err(|e| VaultError::Crypto(format!("Argon2id derivation failed: {e}")))?;
            Ok(MasterKey::from_bytes(key))
        }
    }
}

/// Resolve settings from the config section and derive the master key in
/// one step. Fails when no passphrase is configured.
pub fn key_from_config(config: &CryptoConfig) -> VaultResult<MasterKey> {
    if config.passphrase.is_empty() {
        return Err(VaultError::Config("encryption passphrase not set".into()));
    }
    let settings = KdfSettings::from_config(config)?;
    let passphrase = SecretString::from(config.passphrase.clone());
    derive_key(&passphrase, &settings)
}
