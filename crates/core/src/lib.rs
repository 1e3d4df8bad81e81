//! Content-addressed cover art cache
//!
//! This crate is the core of a cover-art cache daemon: it maps short opaque
//! stream keys (with a priority) to pre-scaled cover images and keeps the
//! whole state on the filesystem.
//!
//! # Architecture
//!
//! ## Content-addressed store
//!
//! Three trees live under one cache root. Stream-key directories point at
//! source directories, source directories point at object files, and both
//! indirections are hard links, so inode link counts double as reference
//! counts:
//!
//! ```text
//! <root>/
//!   <xy>/<hash-24>/<PPP>/src:<source_hash>      stream-key entry
//!   .src/<xy>/<hash-24>/.ref                    source reference file
//!   .src/<xy>/<hash-24>/<fmt>@<dims>:<obj>      format link into objects
//!   .obj/<xy>/<hash-24>                         object file
//!   .tmp/<source_hash>/                         per-job workdir
//! ```
//!
//! A source is the original artifact (a URI or a raw payload) identified by
//! the MD5 of its identifying bytes; objects are the rescaled outputs,
//! identified by the MD5 of their content. Identical outputs are stored
//! once, whatever source produced them.
//!
//! ## Conversion queue
//!
//! Unknown sources are handed to a single-worker job queue which downloads
//! the original, runs an external conversion recipe, and imports the
//! outputs. Keys submitted while a source is converting are attached to the
//! in-flight job instead of spawning a second one.
//!
//! ## Garbage collection
//!
//! A two-watermark collector trims the cache by access-time age when entry
//! counts exceed the configured limits. Successful lookups stamp the entries
//! they touch with a synthetic, strictly monotonic timestamp so the LRU
//! signal survives `noatime` mounts and clock noise. GC and timestamp
//! maintenance run on a dedicated background worker.
//!
//! # Boundaries
//!
//! The transport delivering client requests is not part of this crate; it
//! consumes [`Manager`] and [`Queue`] and receives signals through the
//! [`events::EventSink`] trait. The external downloader and image converter
//! are a policy embedded in the generated recipe scripts.

pub mod background;
pub mod config;
mod error;
pub mod events;
mod fs;
mod gc;
pub mod hash;
mod job;
pub mod manager;
pub mod path;
pub mod pending;
mod queue;
mod recipe;
pub mod stats;
mod timestamp;
pub mod types;

pub use error::{Error, Result};
pub use manager::Manager;
pub use queue::Queue;
pub use stats::Statistics;
pub use timestamp::Timestamp;
pub use types::{
    AddKeyResult, GcOutcome, LookupOutcome, Object, StreamKeyRef, UpdateSourceResult,
    validate_known_hash, validate_priority, validate_stream_key,
};
