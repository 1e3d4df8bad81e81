//! Conversion job state machine
//!
//! One job turns one source (a downloaded URI or a raw payload) into the
//! configured set of rescaled outputs and imports them into the cache. The
//! recipe runs with no cache lock held; only workdir preparation and the
//! final import touch shared state. A job collects the stream keys waiting
//! on its source and reports a per-key result when it is finalized.

use crate::config::Config;
use crate::fs;
use crate::manager::Manager;
use crate::pending::PendingSources;
use crate::recipe::{self, DownloadStep, SCRIPT_NAME};
use crate::types::{AddKeyResult, StreamKeyRef, UpdateSourceResult};
use crate::{Error, Result};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

/// Temp file name for inputs the recipe downloads itself
pub(crate) const DOWNLOADED_FILE: &str = "original_downloaded";

/// Temp file name for raw payloads written before the job runs
pub(crate) const RAW_FILE: &str = "original_raw";

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    DownloadIdle,
    DownloadingAndConverting,
    ConvertIdle,
    Converting,
    DoneOk,
    DoneError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Ok,
    IoError,
    DiskFull,
    DownloadError,
    InputError,
    ConversionError,
    InternalError,
}

struct JobInner {
    state: JobState,
    pending_keys: Vec<(StreamKeyRef, AddKeyResult)>,
}

/// One download-and-convert (or convert-only) unit of work
pub(crate) struct Job {
    /// Hash of the source this job produces outputs for
    pub(crate) source_hash: String,
    manager: Arc<Manager>,
    config: Config,
    workdir: PathBuf,
    script_path: PathBuf,
    temp_file: &'static str,
    download_uri: Option<String>,
    inner: Mutex<JobInner>,
}

impl Job {
    /// Job that downloads its input first, then converts
    pub(crate) fn new_download(
        workdir: PathBuf,
        uri: &str,
        source_hash: String,
        first_key: StreamKeyRef,
        manager: Arc<Manager>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            source_hash,
            manager,
            config,
            script_path: workdir.join(SCRIPT_NAME),
            workdir,
            temp_file: DOWNLOADED_FILE,
            download_uri: Some(uri.to_owned()),
            inner: Mutex::new(JobInner {
                state: JobState::DownloadIdle,
                pending_keys: vec![(first_key, AddKeyResult::SourceUnknown)],
            }),
        })
    }

    /// Job converting a raw payload already written to the workdir
    pub(crate) fn new_convert(
        workdir: PathBuf,
        source_hash: String,
        first_key: StreamKeyRef,
        manager: Arc<Manager>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            source_hash,
            manager,
            config,
            script_path: workdir.join(SCRIPT_NAME),
            workdir,
            temp_file: RAW_FILE,
            download_uri: None,
            inner: Mutex::new(JobInner {
                state: JobState::ConvertIdle,
                pending_keys: vec![(first_key, AddKeyResult::SourceUnknown)],
            }),
        })
    }

    pub(crate) fn state(&self) -> JobState {
        self.lock_inner().state
    }

    /// Attach another waiting key, deduplicating exact repeats
    ///
    /// Fails once the job has reached a terminal state; the caller must then
    /// treat the source as no longer pending.
    pub(crate) fn try_add_pending_key(&self, key: &StreamKeyRef) -> bool {
        let mut inner = self.lock_inner();

        match inner.state {
            JobState::DownloadIdle
            | JobState::DownloadingAndConverting
            | JobState::ConvertIdle
            | JobState::Converting => {}
            JobState::DoneOk | JobState::DoneError => {
                error!("BUG: cannot add pending key in state {:?}", inner.state);
                return false;
            }
        }

        if !inner.pending_keys.iter().any(|(k, _)| k == key) {
            inner
                .pending_keys
                .push((key.clone(), AddKeyResult::SourceUnknown));
        }

        true
    }

    /// Run the job to completion
    pub(crate) fn execute(&self) {
        let outcome = self.do_execute();

        if outcome != JobOutcome::Ok {
            debug!("job for source {} failed: {outcome:?}", self.source_hash);
        }

        let mut inner = self.lock_inner();
        if !matches!(inner.state, JobState::DoneOk | JobState::DoneError) {
            inner.state = match outcome {
                JobOutcome::Ok => JobState::DoneOk,
                _ => JobState::DoneError,
            };
        }
    }

    fn do_execute(&self) -> JobOutcome {
        {
            let mut inner = self.lock_inner();

            let download = match inner.state {
                JobState::DownloadIdle => true,
                JobState::ConvertIdle => false,
                state => {
                    error!("BUG: prepare job in state {state:?}");
                    return JobOutcome::InternalError;
                }
            };

            if let Err(e) = self.prepare_workdir(download) {
                return io_outcome(&e);
            }

            let download_step = self
                .download_uri
                .as_deref()
                .map(|uri| DownloadStep { uri });
            let script = recipe::generate(
                &self.workdir,
                self.temp_file,
                download_step.as_ref(),
                &self.config,
            );
            if let Err(e) = recipe::write_script(&self.script_path, &script) {
                return io_outcome(&e);
            }

            inner.state = if download {
                JobState::DownloadingAndConverting
            } else {
                JobState::Converting
            };
        }

        // this is where most of the time is spent; the job stays queryable
        let status = Command::new(&self.script_path).status();

        let outcome = match status {
            Ok(status) => classify_exit(status.code()),
            Err(e) => {
                error!("cannot run recipe {}: {e}", self.script_path.display());
                JobOutcome::IoError
            }
        };
        if outcome != JobOutcome::Ok {
            return outcome;
        }

        // take the waiting keys out and import with the job lock released:
        // the cache may concurrently attach more keys to this job, and it
        // does so while holding its own lock
        let mut keys = {
            let mut inner = self.lock_inner();
            match inner.state {
                JobState::DownloadingAndConverting | JobState::Converting => {}
                state => {
                    error!("BUG: state {state:?} after recipe execution");
                    return JobOutcome::InternalError;
                }
            }
            std::mem::take(&mut inner.pending_keys)
        };

        let output_files: Vec<PathBuf> = self
            .config
            .output_formats
            .iter()
            .map(|format| self.workdir.join(format.filename()))
            .collect();

        let outcome = match self
            .manager
            .update_source(&self.source_hash, &output_files, &mut keys)
        {
            UpdateSourceResult::NotChanged
            | UpdateSourceResult::UpdatedSourceOnly
            | UpdateSourceResult::UpdatedKeysOnly
            | UpdateSourceResult::UpdatedAll => JobOutcome::Ok,
            UpdateSourceResult::IoError => JobOutcome::IoError,
            UpdateSourceResult::DiskFull => JobOutcome::DiskFull,
            UpdateSourceResult::InternalError => JobOutcome::InternalError,
        };

        // keys that attached during the import still need their links; the
        // terminal state transition must happen in the same critical section
        // that sees the list empty, or a late key could slip in unserved
        loop {
            let mut late = {
                let mut inner = self.lock_inner();
                if inner.pending_keys.is_empty() {
                    inner.pending_keys = keys;
                    inner.state = match outcome {
                        JobOutcome::Ok => JobState::DoneOk,
                        _ => JobState::DoneError,
                    };
                    return outcome;
                }
                std::mem::take(&mut inner.pending_keys)
            };

            if outcome == JobOutcome::Ok {
                self.manager.update_source(&self.source_hash, &[], &mut late);
            }
            for entry in late {
                if !keys.iter().any(|(key, _)| *key == entry.0) {
                    keys.push(entry);
                }
            }
        }
    }

    /// Notify every attached key of its result and clean the workdir up
    pub(crate) fn finalize(&self, pending: &dyn PendingSources) {
        let keys = {
            let mut inner = self.lock_inner();
            if !matches!(inner.state, JobState::DoneOk | JobState::DoneError) {
                error!("BUG: finalizing job in state {:?}", inner.state);
            }
            std::mem::take(&mut inner.pending_keys)
        };

        for (key, result) in keys {
            pending.notify_pending_key_processed(&self.manager, &key, &self.source_hash, result);
        }

        // clean up the nice way, file by file
        fs::remove_file_quiet(&self.script_path);
        fs::remove_file_quiet(&self.workdir.join(self.temp_file));

        // and the safe way in case the nice way didn't serve us well
        if std::fs::remove_dir(&self.workdir).is_err() {
            let _ = clean_up(&self.workdir);
        }
    }

    fn prepare_workdir(&self, purge: bool) -> Result<()> {
        if fs::ensure_dir(&self.workdir)? {
            return Ok(());
        }

        if !purge {
            // the raw payload is already in place
            return Ok(());
        }

        clean_up(&self.workdir)?;
        fs::create_dir_all(&self.workdir)
    }

    fn lock_inner(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().expect("job state poisoned")
    }
}

/// Delete every file in a workdir, then the directory itself
fn clean_up(workdir: &std::path::Path) -> Result<()> {
    for name in fs::read_dir_names(workdir).unwrap_or_default() {
        let path = workdir.join(name);
        debug!("delete \"{}\"", path.display());
        fs::remove_file_quiet(&path);
    }

    match std::fs::remove_dir(workdir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, workdir, "remove_dir")),
    }
}

/// Map a recipe exit code to a job outcome per the exit-code contract
fn classify_exit(code: Option<i32>) -> JobOutcome {
    match code {
        Some(0) => JobOutcome::Ok,
        Some(1) => JobOutcome::IoError,
        Some(2) => JobOutcome::DownloadError,
        Some(3) => JobOutcome::InputError,
        Some(4) => JobOutcome::ConversionError,
        other => {
            error!("BUG: unhandled recipe exit code {other:?}");
            JobOutcome::InternalError
        }
    }
}

fn io_outcome(e: &Error) -> JobOutcome {
    if e.is_disk_full() {
        JobOutcome::DiskFull
    } else if e.is_internal() {
        JobOutcome::InternalError
    } else {
        JobOutcome::IoError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_exit_contract() {
        assert_eq!(classify_exit(Some(0)), JobOutcome::Ok);
        assert_eq!(classify_exit(Some(1)), JobOutcome::IoError);
        assert_eq!(classify_exit(Some(2)), JobOutcome::DownloadError);
        assert_eq!(classify_exit(Some(3)), JobOutcome::InputError);
        assert_eq!(classify_exit(Some(4)), JobOutcome::ConversionError);
        assert_eq!(classify_exit(Some(5)), JobOutcome::InternalError);
        assert_eq!(classify_exit(Some(127)), JobOutcome::InternalError);
        // killed by signal
        assert_eq!(classify_exit(None), JobOutcome::InternalError);
    }

    #[test]
    fn test_clean_up_removes_files_and_dir() {
        let tmp = TempDir::new().unwrap();
        let workdir = tmp.path().join("w");
        std::fs::create_dir(&workdir).unwrap();
        std::fs::write(workdir.join("a"), b"1").unwrap();
        std::fs::write(workdir.join("b"), b"2").unwrap();

        clean_up(&workdir).unwrap();
        assert!(!workdir.exists());
    }

    #[test]
    fn test_clean_up_tolerates_missing_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(clean_up(&tmp.path().join("missing")).is_ok());
    }
}
