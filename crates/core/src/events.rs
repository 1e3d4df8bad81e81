//! Outgoing event boundary
//!
//! The daemon emits three signals toward its clients: `added` when a key
//! resolves to a cached image, `associated` when a key is bound to a
//! conversion still in flight, and `failed` when a key cannot be served.
//! The transport delivering them is not the cache's concern.

use crate::types::StreamKeyRef;
use serde::Serialize;
use tracing::info;

/// Failure classes reported with the `failed` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Invariant violation inside the daemon
    Internal,
    /// Filesystem failure
    IoFailure,
    /// Out of disk space or quota
    NoSpaceOnDisk,
    /// The source could not be downloaded or converted
    DownloadError,
}

/// Sink for the daemon's outgoing events
pub trait EventSink: Send + Sync {
    /// A key now resolves to a cached image
    fn added(&self, key: &StreamKeyRef, is_new: bool);

    /// A key was bound to a conversion in flight
    fn associated(&self, key: &StreamKeyRef);

    /// A key cannot be served
    fn failed(&self, key: &StreamKeyRef, code: FailureCode);
}

/// Event sink that logs every signal
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn added(&self, key: &StreamKeyRef, is_new: bool) {
        info!("event: added {key} (new: {is_new})");
    }

    fn associated(&self, key: &StreamKeyRef) {
        info!("event: associated {key}");
    }

    fn failed(&self, key: &StreamKeyRef, code: FailureCode) {
        info!("event: failed {key} ({code:?})");
    }
}
