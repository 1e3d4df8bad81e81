//! Hashing and hex codec for cache identities
//!
//! Every identity in the cache (source, object) is the MD5 digest of its
//! identifying bytes, written as 32 lowercase hex characters. Keeping hashes
//! in the `[0-9a-f]` alphabet also guarantees they can never collide with the
//! hidden tree names (`.src`, `.obj`, `.tmp`, `.ref`) on disk.

use crate::{Error, Result};
use md5::{Digest, Md5};

/// Length of a full hash in hex characters
pub const HASH_HEX_LEN: usize = 32;

/// Length of a full hash in bytes
pub const HASH_BYTE_LEN: usize = 16;

/// Compute the cache hash of a byte slice as lowercase hex
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Compute the cache hash of a string's bytes as lowercase hex
#[must_use]
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hex-encode arbitrary bytes (lowercase)
#[must_use]
pub fn bin_to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode a lowercase hex string back to bytes
///
/// # Errors
///
/// Returns a configuration error for odd-length or non-hex input.
pub fn hex_to_bin(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::configuration(format!("invalid hex string {s:?}: {e}")))
}

/// True if every character of `s` is a lowercase hex digit
///
/// The empty string is vacuously valid; use [`is_full_hash`] when a complete
/// digest is required.
#[must_use]
pub fn is_valid_hash(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// True if `s` is exactly one full digest in hex form
#[must_use]
pub fn is_full_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && is_valid_hash(s)
}

/// True if `s` is a two-character shard directory name
#[must_use]
pub fn is_shard_name(s: &str) -> bool {
    s.len() == 2 && is_valid_hash(s)
}
