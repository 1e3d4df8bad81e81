//! Conversion queue
//!
//! A single worker thread drains a FIFO of conversion jobs. Submissions for
//! a source that is already downloading or queued do not spawn a second
//! job; the new key is attached to the in-flight one instead. The queue is
//! the daemon's pending-source registry: the cache manager asks it whether a
//! source is in flight, and finished jobs report per-key results through it.
//!
//! Whole add operations are serialized; while one is in progress its source
//! hash is earmarked so concurrent pending-source queries see the
//! registration before the job object exists.

use crate::config::Config;
use crate::events::{EventSink, FailureCode};
use crate::fs;
use crate::hash;
use crate::job::{Job, JobState, RAW_FILE};
use crate::manager::{Manager, WORK_DIR};
use crate::pending::PendingSources;
use crate::types::{AddKeyResult, StreamKeyRef};
use crate::Result;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error};

#[derive(Default)]
struct JobTable {
    /// Source hash of the add operation currently in progress
    adding_source: Option<String>,
    queued: VecDeque<Arc<Job>>,
    running: Option<Arc<Job>>,
}

/// Single-consumer conversion job queue
pub struct Queue {
    temp_root: PathBuf,
    config: Config,
    events: Arc<dyn EventSink>,
    /// Serializes whole add operations (earmark, cache call, enqueue)
    add_lock: Mutex<()>,
    jobs: Mutex<JobTable>,
    job_available: Condvar,
    idle: Condvar,
    shutdown_requested: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    /// Create a queue working below `<cache_root>/.tmp`
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>, config: Config, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            temp_root: cache_root.into().join(WORK_DIR),
            config,
            events,
            add_lock: Mutex::new(()),
            jobs: Mutex::new(JobTable::default()),
            job_available: Condvar::new(),
            idle: Condvar::new(),
            shutdown_requested: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Create the workdir tree and start the worker thread
    ///
    /// # Errors
    ///
    /// Returns an error if the workdir tree cannot be created.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        fs::create_dir_all(&self.temp_root)?;

        let mut worker = self.worker.lock().expect("queue worker poisoned");
        if worker.is_some() {
            error!("BUG: queue worker started twice");
            return Ok(());
        }

        let queue = Arc::clone(self);
        *worker = Some(std::thread::spawn(move || worker_main(&queue)));

        Ok(())
    }

    /// Stop accepting jobs and join the worker
    ///
    /// The running job is drained; jobs still queued are dropped.
    pub fn shutdown(&self) {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return;
        }

        {
            let _table = self.lock_jobs();
            self.shutdown_requested.store(true, Ordering::SeqCst);
        }
        self.job_available.notify_all();

        if let Some(handle) = self.worker.lock().expect("queue worker poisoned").take()
            && handle.join().is_err()
        {
            error!("BUG: queue worker panicked");
        }
    }

    /// Block until no job is queued or running
    pub fn sync(&self) {
        let table = self.lock_jobs();
        drop(
            self.idle
                .wait_while(table, |t| {
                    !(t.queued.is_empty() && t.running.is_none())
                        && !self.shutdown_requested.load(Ordering::SeqCst)
                })
                .expect("queue state poisoned"),
        );
    }

    /// Associate a key with the image behind a URI, fetching and converting
    /// it if it is not cached yet
    pub fn add_to_cache_by_uri(&self, manager: &Arc<Manager>, key: StreamKeyRef, uri: &str) {
        if key.stream_key.is_empty() || key.priority == 0 || uri.is_empty() {
            error!("BUG: add_to_cache_by_uri({key}, {uri:?}): bad arguments");
            return;
        }

        let source_hash = hash::hash_str(uri);

        let _serial = self.add_lock.lock().expect("add lock poisoned");
        let guard = self.earmark(&source_hash);

        let result = manager.add_stream_key_for_source(&key, &source_hash);
        if result != AddKeyResult::SourceUnknown {
            drop(guard);
            self.notify_pending_key_processed(manager, &key, &source_hash, result);
            return;
        }

        debug!(
            "source \"{uri}\" ({source_hash}) for key {key} not in cache"
        );

        let job = Job::new_download(
            self.temp_root.join(&source_hash),
            uri,
            source_hash.clone(),
            key.clone(),
            Arc::clone(manager),
            self.config.clone(),
        );

        if self.enqueue(job) {
            drop(guard);
            self.events.associated(&key);
        } else {
            drop(guard);
            self.notify_pending_key_processed(manager, &key, &source_hash, result);
        }
    }

    /// Associate a key with a raw image payload, converting it if it is not
    /// cached yet
    pub fn add_to_cache_by_data(&self, manager: &Arc<Manager>, key: StreamKeyRef, data: &[u8]) {
        if key.stream_key.is_empty() || key.priority == 0 || data.is_empty() {
            error!("BUG: add_to_cache_by_data({key}, {} bytes): bad arguments", data.len());
            return;
        }

        let source_hash = hash::hash_bytes(data);

        let _serial = self.add_lock.lock().expect("add lock poisoned");
        let guard = self.earmark(&source_hash);

        debug!(
            "add key {key} for raw data of length {}",
            data.len()
        );

        let result = manager.add_stream_key_for_source(&key, &source_hash);
        if result != AddKeyResult::SourceUnknown {
            drop(guard);
            self.notify_pending_key_processed(manager, &key, &source_hash, result);
            return;
        }

        let workdir = self.temp_root.join(&source_hash);
        if workdir.exists() {
            // leftover workdir means another conversion of these bytes is
            // (or was) underway; don't fight over the files
            drop(guard);
            self.notify_pending_key_processed(
                manager,
                &key,
                &source_hash,
                AddKeyResult::SourcePending,
            );
            return;
        }

        if let Err(e) =
            fs::create_dir_all(&workdir).and_then(|()| fs::write(&workdir.join(RAW_FILE), data))
        {
            drop(guard);
            let result = if e.is_disk_full() {
                AddKeyResult::DiskFull
            } else {
                AddKeyResult::IoError
            };
            self.notify_pending_key_processed(manager, &key, &source_hash, result);
            return;
        }

        let job = Job::new_convert(
            workdir,
            source_hash.clone(),
            key.clone(),
            Arc::clone(manager),
            self.config.clone(),
        );

        if self.enqueue(job) {
            drop(guard);
            self.events.associated(&key);
        } else {
            drop(guard);
            self.notify_pending_key_processed(manager, &key, &source_hash, result);
        }
    }

    fn earmark(&self, source_hash: &str) -> EarmarkGuard<'_> {
        self.lock_jobs().adding_source = Some(source_hash.to_owned());
        EarmarkGuard { queue: self }
    }

    fn enqueue(&self, job: Arc<Job>) -> bool {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return false;
        }

        let mut table = self.lock_jobs();
        debug_assert!(matches!(
            job.state(),
            JobState::DownloadIdle | JobState::ConvertIdle
        ));
        debug_assert!(table.adding_source.is_some());

        table.queued.push_back(job);
        drop(table);
        self.job_available.notify_one();

        true
    }

    fn lock_jobs(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().expect("queue state poisoned")
    }
}

impl PendingSources for Queue {
    fn is_source_pending(&self, source_hash: &str, exclude_current: bool) -> bool {
        let table = self.lock_jobs();

        if !exclude_current && table.adding_source.as_deref() == Some(source_hash) {
            return true;
        }

        if let Some(running) = &table.running
            && running.source_hash == source_hash
        {
            return true;
        }

        table.queued.iter().any(|job| job.source_hash == source_hash)
    }

    fn add_key_to_pending_source(&self, key: &StreamKeyRef, source_hash: &str) -> bool {
        let table = self.lock_jobs();

        if let Some(running) = &table.running
            && running.source_hash == source_hash
        {
            return running.try_add_pending_key(key);
        }

        for job in &table.queued {
            if job.source_hash == source_hash {
                return job.try_add_pending_key(key);
            }
        }

        false
    }

    fn notify_pending_key_processed(
        &self,
        manager: &Manager,
        key: &StreamKeyRef,
        source_hash: &str,
        result: AddKeyResult,
    ) {
        let code = match result {
            AddKeyResult::NotChanged => {
                debug!("key {key} unchanged for {source_hash}");
                self.events.added(key, false);
                return;
            }
            AddKeyResult::Inserted => {
                debug!("added key {key} for {source_hash}");
                self.events.added(key, true);
                return;
            }
            AddKeyResult::Replaced => {
                debug!("replaced key {key}, now {source_hash}");
                self.events.added(key, true);
                return;
            }
            AddKeyResult::SourcePending => {
                debug!("added key {key} to pending source");
                self.events.associated(key);
                return;
            }
            AddKeyResult::SourceUnknown => FailureCode::DownloadError,
            AddKeyResult::IoError => FailureCode::IoFailure,
            AddKeyResult::DiskFull => FailureCode::NoSpaceOnDisk,
            AddKeyResult::InternalError => FailureCode::Internal,
        };

        // the key is useless without its image; take it back out
        manager.delete_key(key);
        self.events.failed(key, code);
    }
}

struct EarmarkGuard<'a> {
    queue: &'a Queue,
}

impl Drop for EarmarkGuard<'_> {
    fn drop(&mut self) {
        self.queue.lock_jobs().adding_source = None;
    }
}

fn worker_main(queue: &Arc<Queue>) {
    loop {
        let job = {
            let mut table = queue.lock_jobs();
            loop {
                if queue.shutdown_requested.load(Ordering::SeqCst) {
                    queue.idle.notify_all();
                    return;
                }

                if let Some(job) = table.queued.pop_front() {
                    table.running = Some(Arc::clone(&job));
                    break job;
                }

                table = queue
                    .job_available
                    .wait(table)
                    .expect("queue state poisoned");
            }
        };

        job.execute();
        job.finalize(queue.as_ref());

        let mut table = queue.lock_jobs();
        table.running = None;
        if table.queued.is_empty() {
            queue.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogEventSink;

    #[test]
    fn test_earmark_guard_clears_on_drop() {
        let queue = Queue::new("/cache", Config::default(), Arc::new(LogEventSink));

        {
            let _guard = queue.earmark("9ff807ff60ff8480d170b6d5e0977c69");
            assert!(queue.is_source_pending("9ff807ff60ff8480d170b6d5e0977c69", false));
            assert!(!queue.is_source_pending("9ff807ff60ff8480d170b6d5e0977c69", true));
        }

        assert!(!queue.is_source_pending("9ff807ff60ff8480d170b6d5e0977c69", false));
    }

    #[test]
    fn test_sync_on_empty_queue_returns() {
        let queue = Queue::new("/cache", Config::default(), Arc::new(LogEventSink));
        queue.sync();
    }
}
