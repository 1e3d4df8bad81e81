//! Command implementations
//!
//! Each command boots the cache core against the resolved root, performs its
//! operation through the same public API an RPC transport would use, and
//! shuts the workers down again.

use artcache_core::config::{CacheLimits, Config};
use artcache_core::events::{EventSink, FailureCode};
use artcache_core::{
    LookupOutcome, Manager, Queue, StreamKeyRef, validate_known_hash, validate_priority,
    validate_stream_key,
};
use miette::{IntoDiagnostic, WrapErr, miette};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Client-visible result codes for the read path
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ClientCode {
    /// Image found; payload attached
    Ok,
    /// The client's copy is current; no payload shipped
    Uncached,
    KeyUnknown,
    /// Source is still downloading or converting
    Busy,
    FormatNotSupported,
    IoFailure,
}

/// Event sink printing signals for the operator
struct StdoutEventSink;

impl EventSink for StdoutEventSink {
    fn added(&self, key: &StreamKeyRef, is_new: bool) {
        println!("added {key} (new: {is_new})");
    }

    fn associated(&self, key: &StreamKeyRef) {
        println!("associated {key}");
    }

    fn failed(&self, key: &StreamKeyRef, code: FailureCode) {
        println!("failed {key} ({code:?})");
    }
}

/// A booted cache core
pub struct App {
    manager: Arc<Manager>,
    queue: Arc<Queue>,
}

impl App {
    /// Initialize the cache at `root` and start both workers
    pub fn boot(root: PathBuf, limits: CacheLimits) -> miette::Result<Self> {
        let queue = Queue::new(&root, Config::default(), Arc::new(StdoutEventSink));
        let manager = Manager::new(&root, &limits, queue.clone());

        manager
            .init()
            .wrap_err_with(|| format!("cannot initialize cache at {}", root.display()))?;
        queue.init().into_diagnostic()?;

        Ok(Self { manager, queue })
    }

    /// Drain outstanding work and stop the workers
    pub fn shutdown(self) {
        self.queue.sync();
        self.queue.shutdown();
        self.manager.background().sync();
        self.manager.shutdown(false);
    }

    pub fn stats(&self, as_json: bool) -> i32 {
        let stats = self.manager.statistics();

        if as_json {
            println!(
                "{}",
                json!({
                    "keys": stats.keys(),
                    "sources": stats.sources(),
                    "objects": stats.objects(),
                })
            );
        } else {
            println!(
                "{} stream keys, {} sources, {} objects",
                stats.keys(),
                stats.sources(),
                stats.objects()
            );
        }

        EXIT_OK
    }

    pub fn gc(&self, as_json: bool) -> i32 {
        let outcome = self.manager.force_gc();
        let stats = self.manager.statistics();

        if as_json {
            println!(
                "{}",
                json!({
                    "outcome": outcome,
                    "keys": stats.keys(),
                    "sources": stats.sources(),
                    "objects": stats.objects(),
                })
            );
        } else {
            println!(
                "gc: {outcome:?}; {} stream keys, {} sources, {} objects remain",
                stats.keys(),
                stats.sources(),
                stats.objects()
            );
        }

        EXIT_OK
    }

    pub fn add_uri(&self, key: &str, priority: u8, uri: &str) -> miette::Result<i32> {
        validate_stream_key(key).into_diagnostic()?;
        validate_priority(priority).into_diagnostic()?;
        if uri.is_empty() {
            return Err(miette!("empty URI"));
        }

        self.queue
            .add_to_cache_by_uri(&self.manager, StreamKeyRef::new(key, priority), uri);
        self.queue.sync();

        Ok(EXIT_OK)
    }

    pub fn add_data(&self, key: &str, priority: u8, file: &PathBuf) -> miette::Result<i32> {
        validate_stream_key(key).into_diagnostic()?;
        validate_priority(priority).into_diagnostic()?;

        let data = std::fs::read(file)
            .into_diagnostic()
            .wrap_err_with(|| format!("cannot read {}", file.display()))?;
        if data.is_empty() {
            return Err(miette!("empty image data in {}", file.display()));
        }

        self.queue
            .add_to_cache_by_data(&self.manager, StreamKeyRef::new(key, priority), &data);
        self.queue.sync();

        Ok(EXIT_OK)
    }

    pub fn get(
        &self,
        key: &str,
        format: &str,
        priority: Option<u8>,
        known_hash: &str,
        output: Option<&PathBuf>,
        as_json: bool,
    ) -> miette::Result<i32> {
        validate_stream_key(key).into_diagnostic()?;
        validate_known_hash(known_hash).into_diagnostic()?;

        let outcome = match priority {
            Some(priority) => {
                validate_priority(priority).into_diagnostic()?;
                self.manager
                    .lookup(&StreamKeyRef::new(key, priority), known_hash, format)
            }
            None => self.manager.lookup_best(key, known_hash, format),
        };

        let (code, object) = match outcome {
            LookupOutcome::Found(object) if object.data.is_empty() => (ClientCode::Uncached, Some(object)),
            LookupOutcome::Found(object) => (ClientCode::Ok, Some(object)),
            LookupOutcome::KeyUnknown => (ClientCode::KeyUnknown, None),
            LookupOutcome::Pending => (ClientCode::Busy, None),
            LookupOutcome::FormatNotSupported => (ClientCode::FormatNotSupported, None),
            LookupOutcome::Orphaned => {
                tracing::info!("orphaned key {key}");
                (ClientCode::KeyUnknown, None)
            }
            LookupOutcome::IoError => (ClientCode::IoFailure, None),
        };

        if as_json {
            println!(
                "{}",
                json!({
                    "code": code,
                    "priority": object.as_ref().map(|o| o.priority),
                    "hash": object.as_ref().map(|o| o.hash.clone()),
                    "bytes": object.as_ref().map(|o| o.data.len()),
                })
            );
        } else {
            match &object {
                Some(object) => println!(
                    "{code:?}: priority {}, hash {}, {} bytes",
                    object.priority,
                    object.hash,
                    object.data.len()
                ),
                None => println!("{code:?}"),
            }
        }

        if let Some(path) = output
            && let Some(object) = &object
            && !object.data.is_empty()
        {
            std::fs::write(path, &object.data)
                .into_diagnostic()
                .wrap_err_with(|| format!("cannot write {}", path.display()))?;
        }

        Ok(match code {
            ClientCode::Ok | ClientCode::Uncached => EXIT_OK,
            _ => EXIT_FAILURE,
        })
    }

    pub fn delete(&self, key: &str, priority: u8) -> miette::Result<i32> {
        validate_stream_key(key).into_diagnostic()?;
        validate_priority(priority).into_diagnostic()?;

        self.manager.delete_key(&StreamKeyRef::new(key, priority));

        Ok(EXIT_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_boot_and_stats_on_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let app = App::boot(tmp.path().to_path_buf(), CacheLimits::default()).unwrap();

        assert_eq!(app.stats(false), EXIT_OK);
        assert_eq!(app.stats(true), EXIT_OK);
        assert_eq!(app.gc(false), EXIT_OK);

        app.shutdown();
    }

    #[test]
    fn test_get_unknown_key_fails() {
        let tmp = TempDir::new().unwrap();
        let app = App::boot(tmp.path().to_path_buf(), CacheLimits::default()).unwrap();

        let code = app
            .get("aa11bb22", "png", None, "", None, false)
            .unwrap();
        assert_eq!(code, EXIT_FAILURE);

        app.shutdown();
    }

    #[test]
    fn test_input_validation() {
        let tmp = TempDir::new().unwrap();
        let app = App::boot(tmp.path().to_path_buf(), CacheLimits::default()).unwrap();

        // one byte of stream key is too short
        assert!(app.get("aa", "png", None, "", None, false).is_err());
        // half a digest cannot be a known hash
        assert!(app.get("aa11bb22", "png", None, "64ef", None, false).is_err());
        // priority zero is reserved
        assert!(app.delete("aa11bb22", 0).is_err());
        assert!(app.add_uri("aa11bb22", 10, "").is_err());

        app.shutdown();
    }
}
