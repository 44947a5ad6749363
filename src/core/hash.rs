//! SHA-256 helpers shared by the audit chain and payload digests.

use sha2::{Digest, Sha256};

/// Predecessor hash of the first audit entry for any document.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of several fields, each length-prefixed so that field boundaries
/// cannot be shifted without changing the digest.
pub fn sha256_fields(fields: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    format!("{:x}", hasher.finalize())
}
