//! Canonical serialization and digests.
//!
//! Every hash in the vault is computed over RFC 8785 (JCS) JSON: object keys
//! sorted, no insignificant whitespace, fixed number formatting.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, VaultError};

/// Hash of the empty chain / absent predecessor (64 zeros)
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize a value to canonical JSON bytes
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json_canonicalizer::to_vec(value)
        .map_err(|e| VaultError::Validation(format!("canonical JSON encoding failed: {}", e)))
}

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical JSON form of a value
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_json(value)?))
}

/// Chain step: `sha256(prev_hash || payload)`
pub fn chain_hash(prev_hash: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Stream a file through SHA-256, returning `(hex digest, byte count)`
pub fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// True for a 64-character lowercase hex digest
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
