//! Integration tests for the conversion queue
//!
//! The failure paths run everywhere: a download job against an unreachable
//! URI exits the recipe with the download error code whether or not a
//! downloader is installed. The full convert pipeline needs ImageMagick and
//! is skipped where it is missing.

use artcache_core::config::{CacheLimits, Config};
use artcache_core::events::{EventSink, FailureCode};
use artcache_core::pending::PendingSources;
use artcache_core::{LookupOutcome, Manager, Queue, StreamKeyRef, hash};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A 1x1 red PNG, the smallest input ImageMagick is happy with
const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90,
    0x77, 0x53, 0xde, 0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0xf8,
    0xcf, 0xc0, 0x00, 0x00, 0x03, 0x01, 0x01, 0x00, 0xc9, 0xfe, 0x92, 0xef, 0x00, 0x00, 0x00,
    0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Added(String, u8, bool),
    Associated(String, u8),
    Failed(String, u8, FailureCode),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for RecordingSink {
    fn added(&self, key: &StreamKeyRef, is_new: bool) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Added(key.stream_key.clone(), key.priority, is_new));
    }

    fn associated(&self, key: &StreamKeyRef) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Associated(key.stream_key.clone(), key.priority));
    }

    fn failed(&self, key: &StreamKeyRef, code: FailureCode) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Failed(key.stream_key.clone(), key.priority, code));
    }
}

struct Harness {
    tmp: TempDir,
    manager: Arc<Manager>,
    queue: Arc<Queue>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let queue = Queue::new(tmp.path(), Config::default(), sink.clone());
        let manager = Manager::new(tmp.path(), &CacheLimits::default(), queue.clone());
        manager.init().expect("cache init");

        Self {
            tmp,
            manager,
            queue,
            sink,
        }
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.queue.shutdown();
        self.manager.shutdown(true);
    }
}

fn key_dir(root: &Path, k: &StreamKeyRef) -> std::path::PathBuf {
    root.join(&k.stream_key[..2])
        .join(&k.stream_key[2..])
        .join(k.priority_dir())
}

fn have_imagemagick() -> bool {
    std::process::Command::new("convert")
        .arg("-version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[test]
fn failed_download_cleans_up_and_reports() {
    let h = Harness::new();

    let k = StreamKeyRef::new("aa11bb22", 10);
    // nothing listens on this port; the recipe exits with the download code
    let uri = "http://127.0.0.1:1/nope.png";
    h.queue.add_to_cache_by_uri(&h.manager, k.clone(), uri);
    assert_eq!(h.sink.take(), [Event::Associated("aa11bb22".into(), 10)]);

    h.queue.init().unwrap();
    h.queue.sync();

    assert_eq!(
        h.sink.take(),
        [Event::Failed("aa11bb22".into(), 10, FailureCode::DownloadError)]
    );

    // the failed key was taken out together with its empty source
    assert!(!key_dir(h.root(), &k).exists());
    let stats = h.manager.statistics();
    assert_eq!(
        (stats.keys(), stats.sources(), stats.objects()),
        (0, 0, 0)
    );

    // and the workdir is gone
    let source = hash::hash_str(uri);
    assert!(!h.root().join(".tmp").join(source).exists());
}

#[test]
fn late_keys_attach_to_queued_job() {
    let h = Harness::new();
    // the worker is not started yet, so the job stays queued and the
    // attach window is fully deterministic

    let uri = "http://127.0.0.1:1/cover.png";
    let source = hash::hash_str(uri);
    let first = StreamKeyRef::new("aa11bb22", 10);
    let other = StreamKeyRef::new("ff00ee11", 20);

    h.queue.add_to_cache_by_uri(&h.manager, first.clone(), uri);
    assert!(h.queue.is_source_pending(&source, false));
    assert!(h.queue.is_source_pending(&source, true));

    // the same key again: attached to the queued job, not queued twice
    h.queue.add_to_cache_by_uri(&h.manager, first.clone(), uri);

    // a different key for the same pending source gets its own entry
    // linked to the (still empty) source right away
    h.queue.add_to_cache_by_uri(&h.manager, other.clone(), uri);

    assert_eq!(
        h.sink.take(),
        [
            Event::Associated("aa11bb22".into(), 10),
            Event::Associated("aa11bb22".into(), 10),
            Event::Added("ff00ee11".into(), 20, true),
        ]
    );

    // lookups against the pending source report busy
    assert_eq!(
        h.manager.lookup(&first, "", "png"),
        LookupOutcome::Pending
    );

    // now run the job; the download fails, and the attached key is
    // notified exactly once
    h.queue.init().unwrap();
    h.queue.sync();

    assert_eq!(
        h.sink.take(),
        [Event::Failed("aa11bb22".into(), 10, FailureCode::DownloadError)]
    );

    // the second key still holds its link to the shared (empty) source
    assert!(key_dir(h.root(), &other).exists());
    assert_eq!(h.manager.statistics().keys(), 1);
}

#[test]
fn raw_data_with_leftover_workdir_is_treated_as_pending() {
    let h = Harness::new();

    let source = hash::hash_bytes(TINY_PNG);
    std::fs::create_dir_all(h.root().join(".tmp").join(&source)).unwrap();

    let k = StreamKeyRef::new("aa11bb22", 10);
    h.queue.add_to_cache_by_data(&h.manager, k, TINY_PNG);

    assert_eq!(
        h.sink.take(),
        [Event::Associated("aa11bb22".into(), 10)]
    );
    // no job was registered for the source
    assert!(!h.queue.is_source_pending(&source, false));
}

#[test]
fn raw_data_pipeline_end_to_end() {
    if !have_imagemagick() {
        eprintln!("skipping: ImageMagick not installed");
        return;
    }

    let h = Harness::new();

    let k = StreamKeyRef::new("aa11bb22", 10);
    h.queue.add_to_cache_by_data(&h.manager, k.clone(), TINY_PNG);
    assert_eq!(h.sink.take(), [Event::Associated("aa11bb22".into(), 10)]);

    h.queue.init().unwrap();
    h.queue.sync();

    assert_eq!(
        h.sink.take(),
        [Event::Added("aa11bb22".into(), 10, true)]
    );

    let stats = h.manager.statistics();
    assert_eq!(stats.keys(), 1);
    assert_eq!(stats.sources(), 1);
    assert!(stats.objects() >= 1);

    // all three formats are served
    let png = match h.manager.lookup(&k, "", "png") {
        LookupOutcome::Found(object) => object,
        other => panic!("expected Found, got {other:?}"),
    };
    assert!(!png.data.is_empty());
    assert_eq!(png.hash, hash::hash_bytes(&png.data));

    match h.manager.lookup(&k, "", "jpg") {
        LookupOutcome::Found(object) => assert!(!object.data.is_empty()),
        other => panic!("expected Found, got {other:?}"),
    }

    // the client's copy is detected via its hash
    match h.manager.lookup(&k, &png.hash, "png") {
        LookupOutcome::Found(object) => assert!(object.data.is_empty()),
        other => panic!("expected Found, got {other:?}"),
    }

    assert_eq!(h.manager.lookup(&k, "", "gif"), LookupOutcome::FormatNotSupported);

    // re-adding the identical payload is a no-op
    h.queue
        .add_to_cache_by_data(&h.manager, k.clone(), TINY_PNG);
    h.queue.sync();
    assert_eq!(
        h.sink.take(),
        [Event::Added("aa11bb22".into(), 10, false)]
    );

    // the workdir was cleaned after the job
    let source = hash::hash_bytes(TINY_PNG);
    assert!(!h.root().join(".tmp").join(source).exists());
}
