//! Compress-then-encrypt sealing of file contents and catalog snapshots.
//!
//! Sealed format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//! The plaintext is gzip-compressed before encryption; compressing after
//! would be pointless against uniformly random ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use std::io::{Read, Write};

use timevault_core::{VaultError, VaultResult};

use crate::kdf::MasterKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Gzip-compress then encrypt with a fresh random 96-bit nonce.
pub fn seal(plaintext: &[u8], key: &MasterKey) -> VaultResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    let compressed = encoder.finish()?;

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, compressed.as_ref())
        .map_err(|_| VaultError::Crypto("encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt then gunzip. Tag mismatch, wrong key and truncated input all
/// surface as `Integrity`.
pub fn open(sealed: &[u8], key: &MasterKey) -> VaultResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(VaultError::Integrity(format!(
            "sealed payload too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let compressed = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| VaultError::Integrity("authentication tag mismatch".into()))?;

    let mut plaintext = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut plaintext)
        .map_err(|e| VaultError::Integrity(format!("decompression failed: {e}")))?;
    Ok(plaintext)
}
