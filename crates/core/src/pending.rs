//! Pending-source registry boundary
//!
//! The cache manager must be able to ask "is a conversion for this source in
//! flight?" and to attach late-arriving keys to such a conversion without
//! depending on the conversion queue itself. This trait is that capability
//! set; the queue implements it.

use crate::manager::Manager;
use crate::types::{AddKeyResult, StreamKeyRef};

/// Capabilities the cache manager consumes from the conversion queue
pub trait PendingSources: Send + Sync {
    /// True if a conversion for `source_hash` is registered, queued, or
    /// running
    ///
    /// With `exclude_current` set, the caller's own in-flight registration
    /// (the add operation currently earmarking this source) is ignored;
    /// queued and running jobs still count.
    fn is_source_pending(&self, source_hash: &str, exclude_current: bool) -> bool;

    /// Attach a key to the in-flight job for `source_hash`, if there is one
    fn add_key_to_pending_source(&self, key: &StreamKeyRef, source_hash: &str) -> bool;

    /// Report the final result for a key that went through a conversion
    ///
    /// Implementations emit the corresponding client event and clean up the
    /// key on failure.
    fn notify_pending_key_processed(
        &self,
        manager: &Manager,
        key: &StreamKeyRef,
        source_hash: &str,
        result: AddKeyResult,
    );
}

/// A registry that never has anything in flight
///
/// Useful for read-only deployments and tests that drive the manager
/// directly.
#[derive(Debug, Default)]
pub struct NoPendingSources;

impl PendingSources for NoPendingSources {
    fn is_source_pending(&self, _source_hash: &str, _exclude_current: bool) -> bool {
        false
    }

    fn add_key_to_pending_source(&self, _key: &StreamKeyRef, _source_hash: &str) -> bool {
        false
    }

    fn notify_pending_key_processed(
        &self,
        _manager: &Manager,
        _key: &StreamKeyRef,
        _source_hash: &str,
        _result: AddKeyResult,
    ) {
    }
}
