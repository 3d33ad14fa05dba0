//! timevault-crypto: client-side crypto primitives for TimeVault
//!
//! Pipeline per file: plaintext → gzip → ChaCha20-Poly1305 → shard member.
//!
//! Key handling:
//! ```text
//! Passphrase ── Argon2id(salt) ──► MasterKey (256-bit)   [default]
//!            └─ SHA-256 ─────────► MasterKey             [legacy data]
//! ```
//! The same master key seals file contents and catalog snapshots; file
//! names on the server are SHA-224 path hashes, so the server never sees
//! a name, a path or a plaintext byte.

pub mod hash;
pub mod kdf;
pub mod seal;

pub use hash::{hash_content, hash_content_file, hash_path};
pub use kdf::{derive_key, key_from_config, KdfSettings, MasterKey};
pub use seal::{open, seal};

/// Master key length in bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce length in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag length in bytes.
pub const TAG_SIZE: usize = 16;
