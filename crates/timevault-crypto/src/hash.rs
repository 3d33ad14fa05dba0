//! Path and content hashing.
//!
//! Paths are hashed with SHA-224 and used as opaque object names on the
//! server (filename obfuscation). Contents are hashed with SHA-256 and
//! drive change detection and version identity.

use sha2::{Digest, Sha224, Sha256};
use std::io::{self, Read};
use std::path::Path;

/// SHA-224 of a source path, 56 hex chars. Pure: the same path always
/// hashes to the same name.
pub fn hash_path(path: &str) -> String {
    hex::encode(Sha224::digest(path.as_bytes()))
}

/// Streaming SHA-256 over a reader, 64 hex chars.
pub fn hash_content(reader: &mut impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file's contents without loading it into memory.
pub fn hash_content_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    hash_content(&mut file)
}
