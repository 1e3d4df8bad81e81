//! Shared cache types and operation result taxonomies

use crate::hash;
use crate::{Error, Result};
use serde::Serialize;

/// A stream key / priority pair addressing one cache entry
///
/// Stream keys are opaque client-chosen identifiers carried as raw bytes on
/// the wire and represented as lowercase hex on disk. Priorities rank
/// competing entries for the same key; higher wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKeyRef {
    /// Hex representation of the stream key bytes
    pub stream_key: String,
    /// Client-assigned ranking in `[1, 255]`
    pub priority: u8,
}

impl StreamKeyRef {
    /// Create a key reference
    #[must_use]
    pub fn new(stream_key: impl Into<String>, priority: u8) -> Self {
        Self {
            stream_key: stream_key.into(),
            priority,
        }
    }

    /// The on-disk priority directory name, zero-padded to width 3
    #[must_use]
    pub fn priority_dir(&self) -> String {
        format!("{:03}", self.priority)
    }
}

impl std::fmt::Display for StreamKeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.stream_key, self.priority)
    }
}

/// A cached image returned by lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Priority of the stream key entry the object was resolved through
    pub priority: u8,
    /// Content hash of the object, as lowercase hex
    pub hash: String,
    /// Image bytes; empty when the client already holds this object
    pub data: Vec<u8>,
}

/// Result of adding a stream key for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddKeyResult {
    /// Key already pointed at this source
    NotChanged,
    /// Key was created and linked to a complete source
    Inserted,
    /// Key existed and now points at a different source
    Replaced,
    /// Key was attached to a conversion already in flight
    SourcePending,
    /// Source is not in the cache; the caller must queue a conversion
    SourceUnknown,
    /// Filesystem failure
    IoError,
    /// Out of disk space or quota
    DiskFull,
    /// Invariant violation
    InternalError,
}

/// Result of installing converted objects for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSourceResult {
    /// Everything was already in place
    NotChanged,
    /// Objects changed, no key links did
    UpdatedSourceOnly,
    /// Key links changed, objects were already present
    UpdatedKeysOnly,
    /// Both objects and key links changed
    UpdatedAll,
    /// Filesystem failure
    IoError,
    /// Out of disk space or quota
    DiskFull,
    /// Invariant violation
    InternalError,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Entry resolved; the object carries empty bytes when the client's
    /// known hash matched
    Found(Object),
    /// No entry for this stream key / priority
    KeyUnknown,
    /// The source is still being downloaded or converted
    Pending,
    /// The source is complete but has no object in the requested format
    FormatNotSupported,
    /// The key exists but its source is gone
    Orphaned,
    /// Filesystem failure
    IoError,
}

/// Outcome of a garbage collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcOutcome {
    /// Cache is below the upper watermark; nothing to do
    NotRequired,
    /// GC ran but could not remove anything
    NotPossible,
    /// GC removed entries
    Deflated,
    /// GC was enqueued to run in the background
    Scheduled,
    /// Unrecoverable filesystem failure
    IoError,
}

/// Validate a stream key in hex form: at least two bytes, whole bytes only
///
/// # Errors
///
/// Returns a configuration error describing the violated constraint.
pub fn validate_stream_key(key_hex: &str) -> Result<()> {
    if key_hex.len() < 4 {
        return Err(Error::configuration("stream key too short"));
    }
    if key_hex.len() % 2 != 0 || !hash::is_valid_hash(key_hex) {
        return Err(Error::configuration(format!(
            "stream key {key_hex:?} is not a hex byte string"
        )));
    }
    Ok(())
}

/// Validate a client-supplied object hash: empty, or exactly one digest
///
/// # Errors
///
/// Returns a configuration error describing the violated constraint.
pub fn validate_known_hash(hash_hex: &str) -> Result<()> {
    if hash_hex.is_empty() || hash::is_full_hash(hash_hex) {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "object hash {hash_hex:?} is not a full digest"
        )))
    }
}

/// Validate a priority: must be positive
///
/// # Errors
///
/// Returns a configuration error when the priority is zero.
pub fn validate_priority(priority: u8) -> Result<()> {
    if priority == 0 {
        return Err(Error::configuration("priority must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_dir_is_zero_padded() {
        assert_eq!(StreamKeyRef::new("aa11bb22", 10).priority_dir(), "010");
        assert_eq!(StreamKeyRef::new("aa11bb22", 1).priority_dir(), "001");
        assert_eq!(StreamKeyRef::new("aa11bb22", 255).priority_dir(), "255");
    }

    #[test]
    fn test_validate_stream_key() {
        assert!(validate_stream_key("aa11").is_ok());
        assert!(validate_stream_key("aa11bb22").is_ok());
        // one byte is too short
        assert!(validate_stream_key("aa").is_err());
        // half a byte
        assert!(validate_stream_key("aa11b").is_err());
        // not hex
        assert!(validate_stream_key("ZZ11").is_err());
    }

    #[test]
    fn test_validate_known_hash() {
        assert!(validate_known_hash("").is_ok());
        assert!(validate_known_hash("64ef367018099de4d4183ffa3bc0848a").is_ok());
        assert!(validate_known_hash("64ef").is_err());
    }

    #[test]
    fn test_validate_priority() {
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(1).is_ok());
        assert!(validate_priority(255).is_ok());
    }
}
