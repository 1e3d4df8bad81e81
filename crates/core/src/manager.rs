//! Cache manager
//!
//! Owns the three on-disk trees and implements the serialized cache
//! operations: adding keys for sources, installing converted objects,
//! looking entries up, and deleting keys.
//!
//! ## On-disk layout
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
//! Reference counting rides on hard links: a source's `.ref` inode is linked
//! from every stream-key directory pointing at it, an object's inode from
//! every source directory carrying a format link to it. An inode whose link
//! count is back to 1 is referenced by nobody and may be deleted.

use crate::background::{Action, BackgroundTask};
use crate::config::{CacheLimits, LIMITS_LOW_HI_PERCENTAGE};
use crate::fs;
use crate::hash;
use crate::path::CachePath;
use crate::pending::PendingSources;
use crate::stats::Statistics;
use crate::timestamp::Timestamp;
use crate::types::{AddKeyResult, LookupOutcome, Object, StreamKeyRef, UpdateSourceResult};
use crate::{Error, GcOutcome, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Name of the reference file inside every source directory
pub const REF_FILE: &str = ".ref";

/// Subdirectory holding source directories
pub const SOURCES_DIR: &str = ".src";

/// Subdirectory holding object files
pub const OBJECTS_DIR: &str = ".obj";

/// Subdirectory holding per-job workdirs
pub const WORK_DIR: &str = ".tmp";

const SOURCE_LINK_PREFIX: &str = "src:";

pub(crate) struct CacheState {
    pub(crate) statistics: Statistics,
    pub(crate) timestamp: Timestamp,
}

/// The cover art cache
///
/// All public operations serialize on one internal lock; the garbage
/// collector acquires it in short sections so lookups interleave with GC
/// rounds.
pub struct Manager {
    root_str: String,
    cache_root: PathBuf,
    pub(crate) sources_root: PathBuf,
    pub(crate) objects_root: PathBuf,
    pub(crate) upper_limits: Statistics,
    pub(crate) lower_limits: Statistics,
    pending: Arc<dyn PendingSources>,
    pub(crate) background: BackgroundTask,
    pub(crate) state: Mutex<CacheState>,
}

enum SourceEntry {
    /// Directory was created (or repaired); conversion has to be queued
    New,
    /// `.ref` and at least one format link exist
    Complete,
    /// `.ref` exists but no outputs were installed yet
    Empty,
}

impl Manager {
    /// Create a manager for the cache at `cache_root`
    ///
    /// The lower GC watermark is derived from `limits` at
    /// [`LIMITS_LOW_HI_PERCENTAGE`] percent.
    #[must_use]
    pub fn new(
        cache_root: impl Into<PathBuf>,
        limits: &CacheLimits,
        pending: Arc<dyn PendingSources>,
    ) -> Arc<Self> {
        let cache_root = cache_root.into();
        let root_str = cache_root.to_string_lossy().into_owned();
        let upper_limits = limits.upper_watermark();
        let lower_limits = upper_limits.scaled(LIMITS_LOW_HI_PERCENTAGE);

        Arc::new(Self {
            sources_root: cache_root.join(SOURCES_DIR),
            objects_root: cache_root.join(OBJECTS_DIR),
            root_str,
            cache_root,
            upper_limits,
            lower_limits,
            pending,
            background: BackgroundTask::new(),
            state: Mutex::new(CacheState {
                statistics: Statistics::default(),
                timestamp: Timestamp::new(0, 0),
            }),
        })
    }

    /// Initialize the on-disk trees, count existing entries, and start the
    /// background worker
    ///
    /// A cache that cannot be created or counted is wiped and re-initialized
    /// empty; this is the only code path that deletes entries without
    /// consulting reference counts.
    ///
    /// # Errors
    ///
    /// Returns an error only if even a wiped cache cannot be set up.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.lock_state();

            let obj_existed = self.objects_root.is_dir();

            if fs::create_dir_all(&self.sources_root)
                .and_then(|()| fs::create_dir_all(&self.objects_root))
                .is_err()
            {
                warn!("cannot create cache trees, resetting cache");
                self.reset_locked(&mut state)?;
            }

            debug!("root \"{}\"", self.root_str);

            match fs::access_time(&self.objects_root) {
                Ok(atime) => state.timestamp = Timestamp::from_file_time(atime),
                Err(e) => warn!("cannot read object tree atime: {e}"),
            }

            match self.count_all() {
                Ok((keys, sources, objects)) => {
                    state.statistics.set_counts(keys, sources, objects);
                }
                Err(e) => {
                    warn!("failed counting cache entries ({e}), resetting cache");
                    self.reset_locked(&mut state)?;
                }
            }

            if !obj_existed {
                self.background.append_action(Action::ResetTimestamps);
            }
        }

        self.background.start(Arc::clone(self));

        if self.gc() == GcOutcome::NotRequired {
            self.lock_state().statistics.dump("Cache statistics");
        }

        Ok(())
    }

    /// Stop the background worker
    pub fn shutdown(&self, high_priority: bool) {
        self.background.shutdown(high_priority);
    }

    /// The background executor, for draining maintenance work
    pub fn background(&self) -> &BackgroundTask {
        &self.background
    }

    /// Snapshot of the entry counters
    pub fn statistics(&self) -> Statistics {
        self.lock_state().statistics.clone()
    }

    /// The cache root directory
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Add a key/priority pair and associate it with a source
    ///
    /// If the source is already cached completely, the key is inserted or
    /// re-pointed as needed. If the source is unknown, an empty source entry
    /// is created and `SourceUnknown` tells the caller to queue a
    /// conversion. A key whose source is still converting is attached to the
    /// in-flight job instead.
    pub fn add_stream_key_for_source(
        &self,
        key: &StreamKeyRef,
        source_hash: &str,
    ) -> AddKeyResult {
        if key.stream_key.is_empty() || key.priority == 0 || !hash::is_full_hash(source_hash) {
            error!("BUG: add_stream_key_for_source({key}, {source_hash:?}): bad arguments");
            return AddKeyResult::InternalError;
        }

        let mut state = self.lock_state();

        let source_entry = match self.mk_source_entry(&mut state, source_hash) {
            Ok(entry) => entry,
            Err(e) => return add_key_error(&e),
        };

        let mut have_new_source = false;
        match source_entry {
            SourceEntry::New => {
                state.statistics.add_source();
                state.statistics.mark_dirty();
                have_new_source = true;
            }
            SourceEntry::Complete => {}
            SourceEntry::Empty => {
                if !self.pending.is_source_pending(source_hash, true) {
                    info!("resuming pending source \"{source_hash}\"");
                    have_new_source = true;
                }
            }
        }

        let key_dir = self.stream_key_dir(key);
        let created = match fs::ensure_dir(key_dir.as_path()) {
            Ok(created) => created,
            Err(e) => return add_key_error(&e),
        };

        if created {
            // key didn't exist, link it to the source entry right away
            state.statistics.add_key();
            state.statistics.mark_dirty();

            let result_if_added = if have_new_source {
                AddKeyResult::SourceUnknown
            } else {
                AddKeyResult::Inserted
            };
            let result = self.link_key_to_source(&key_dir, source_hash, result_if_added);

            self.gc_locked(&mut state);
            return result;
        }

        if have_new_source {
            // the key must keep its current association until the new
            // source is filled in, so follow-up queries keep working
            return AddKeyResult::SourceUnknown;
        }

        // key exists and may refer to a queued source that is about to be
        // filled in; if so, associate the key with that job
        if let Ok(Some(current)) = self.stream_key_source_link(&key_dir)
            && self.pending.add_key_to_pending_source(key, &current)
        {
            return AddKeyResult::SourcePending;
        }

        // key exists and refers to some completely known source, replace
        self.link_key_to_source(&key_dir, source_hash, AddKeyResult::Inserted)
    }

    /// Install converted objects for a source and update waiting keys
    ///
    /// Every file in `import_files` is content-hashed, moved into the object
    /// tree with `rename(2)`, and linked into the source directory. Each
    /// entry of `pending_keys` is then linked to the source; its result slot
    /// is updated in place. Keys whose directory no longer exists are
    /// ignored.
    pub fn update_source(
        &self,
        source_hash: &str,
        import_files: &[PathBuf],
        pending_keys: &mut [(StreamKeyRef, AddKeyResult)],
    ) -> UpdateSourceResult {
        if !hash::is_full_hash(source_hash) {
            error!("BUG: update_source({source_hash:?}): bad source hash");
            return UpdateSourceResult::InternalError;
        }

        let mut state = self.lock_state();

        let objects_result = self.import_objects(&mut state, source_hash, import_files);
        if !matches!(
            objects_result,
            UpdateSourceResult::NotChanged | UpdateSourceResult::UpdatedSourceOnly
        ) {
            return objects_result;
        }

        let keys_result = self.link_pending_keys(
            source_hash,
            pending_keys,
            objects_result != UpdateSourceResult::NotChanged,
        );
        if !matches!(
            keys_result,
            UpdateSourceResult::NotChanged | UpdateSourceResult::UpdatedKeysOnly
        ) {
            return keys_result;
        }

        match (objects_result, keys_result) {
            (UpdateSourceResult::NotChanged, keys) => keys,
            (objects, UpdateSourceResult::NotChanged) => objects,
            _ => UpdateSourceResult::UpdatedAll,
        }
    }

    /// Remove a key/priority pair, dropping its source and objects if they
    /// become unreferenced
    ///
    /// This is the cleanup path for failed downloads and explicit removals,
    /// not a garbage collection primitive; its deletion policy is more
    /// aggressive than GC's.
    pub fn delete_key(&self, key: &StreamKeyRef) {
        let mut state = self.lock_state();

        let key_dir = self.stream_key_dir(key);
        let names = match fs::read_dir_names(key_dir.as_path()) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => {
                debug!("delete_key {key}: no such entry");
                return;
            }
            Err(e) => {
                warn!("delete_key {key}: {e}");
                return;
            }
        };

        for name in &names {
            if let Some(source_hash) = name.strip_prefix(SOURCE_LINK_PREFIX) {
                fs::remove_file_quiet(&key_dir.as_path().join(name));

                if hash::is_full_hash(source_hash) {
                    self.delete_source_locked(&mut state, source_hash);
                } else {
                    error!("BUG: malformed source link \"{name}\" under {key_dir}");
                }
            }
        }

        if fs::remove_dir(key_dir.as_path()).is_err() {
            error!("BUG: key directory {key_dir} not empty on delete");
            let _ = fs::remove_dir_all(key_dir.as_path());
        }

        // drop the key-hash level too once its last priority is gone
        fs::remove_dir_quiet(Path::new(key_dir.dir_str()).parent().unwrap_or(key_dir.as_path()));

        state.statistics.remove_key();
        state.statistics.mark_dirty();
    }

    /// Look up the object for an exact key/priority pair
    ///
    /// A non-empty `known_hash` is the client-side ETag: when the source
    /// still carries that exact object for the requested format, the lookup
    /// succeeds with empty payload bytes.
    pub fn lookup(&self, key: &StreamKeyRef, known_hash: &str, format: &str) -> LookupOutcome {
        if key.stream_key.is_empty() {
            error!("BUG: lookup with empty stream key");
            return LookupOutcome::KeyUnknown;
        }

        let mut state = self.lock_state();
        self.do_lookup(&mut state, key, known_hash, format)
    }

    /// Look up the best (highest-priority) object for a stream key
    pub fn lookup_best(&self, stream_key: &str, known_hash: &str, format: &str) -> LookupOutcome {
        if stream_key.is_empty() {
            error!("BUG: lookup with empty stream key");
            return LookupOutcome::KeyUnknown;
        }

        let mut state = self.lock_state();

        let key_root = self.stream_key_root(stream_key);
        let names = match fs::read_dir_names(key_root.as_path()) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return LookupOutcome::KeyUnknown,
            Err(e) => {
                warn!("lookup {stream_key}: {e}");
                return LookupOutcome::IoError;
            }
        };

        let Some(priority) = names.iter().filter_map(|n| parse_priority(n)).max() else {
            return LookupOutcome::KeyUnknown;
        };

        let key = StreamKeyRef::new(stream_key, priority);
        self.do_lookup(&mut state, &key, known_hash, format)
    }

    /// Request garbage collection
    ///
    /// Returns `NotRequired` below the upper watermark; otherwise the
    /// collection is scheduled on the background worker.
    pub fn gc(&self) -> GcOutcome {
        let mut state = self.lock_state();
        self.gc_locked(&mut state)
    }

    fn gc_locked(&self, state: &mut CacheState) -> GcOutcome {
        if !state.statistics.exceeds_limits(&self.upper_limits) {
            return GcOutcome::NotRequired;
        }

        self.background.append_action(Action::Gc);
        GcOutcome::Scheduled
    }

    fn do_lookup(
        &self,
        state: &mut CacheState,
        key: &StreamKeyRef,
        known_hash: &str,
        format: &str,
    ) -> LookupOutcome {
        if known_hash.is_empty() {
            debug!("lookup key {key} (unconditional)");
        } else {
            debug!("lookup key {key}, client version \"{known_hash}\"");
        }

        let key_dir = self.stream_key_dir(key);
        let source_hash = match self.stream_key_source_link(&key_dir) {
            Ok(Some(hash)) => hash,
            Ok(None) => return LookupOutcome::Orphaned,
            Err(e) if e.is_not_found() => return LookupOutcome::KeyUnknown,
            Err(e) => {
                warn!("lookup {key}: {e}");
                return LookupOutcome::IoError;
            }
        };

        let source_dir = self.source_dir(&source_hash);
        let source_names = match fs::read_dir_names(source_dir.as_path()) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => {
                return if self.pending.is_source_pending(&source_hash, false) {
                    LookupOutcome::Pending
                } else {
                    LookupOutcome::Orphaned
                };
            }
            Err(e) => {
                warn!("lookup {key}: {e}");
                return LookupOutcome::IoError;
            }
        };

        if !known_hash.is_empty() {
            let suffix = format!(":{known_hash}");
            if source_names
                .iter()
                .any(|name| matches_format(name, format) && name.ends_with(&suffix))
            {
                self.stamp_hot_path(state, &key_dir, &source_hash, known_hash);
                state.statistics.mark_dirty();
                return LookupOutcome::Found(Object {
                    priority: key.priority,
                    hash: known_hash.to_owned(),
                    data: Vec::new(),
                });
            }
        }

        let Some(entry) = source_names
            .iter()
            .find(|name| *name != REF_FILE && matches_format(name, format))
        else {
            return if self.pending.is_source_pending(&source_hash, false) {
                LookupOutcome::Pending
            } else {
                LookupOutcome::FormatNotSupported
            };
        };

        let Some((_, object_hash)) = entry.rsplit_once(':') else {
            error!("BUG: malformed format link \"{entry}\" under {source_dir}");
            return LookupOutcome::IoError;
        };

        let data = match map_file(&source_dir.as_path().join(entry)) {
            Ok(data) => data,
            Err(e) => {
                warn!("lookup {key}: {e}");
                return LookupOutcome::IoError;
            }
        };

        let object_hash = object_hash.to_owned();
        self.stamp_hot_path(state, &key_dir, &source_hash, &object_hash);
        state.statistics.mark_dirty();

        LookupOutcome::Found(Object {
            priority: key.priority,
            hash: object_hash,
            data,
        })
    }

    /// Stamp the entries a successful lookup visited with the next hot mark
    fn stamp_hot_path(
        &self,
        state: &mut CacheState,
        key_dir: &CachePath,
        source_hash: &str,
        object_hash: &str,
    ) {
        let stamp = state.timestamp.increment();
        if state.timestamp.overflown() {
            warn!("timestamp overflow, scheduling reset");
            self.background.append_action(Action::ResetTimestamps);
        }

        fs::set_access_time_quiet(&self.objects_root, stamp);
        fs::set_access_time_quiet(self.object_file(object_hash).as_path(), stamp);
        fs::set_access_time_quiet(key_dir.as_path(), stamp);
        fs::set_access_time_quiet(self.source_ref(source_hash).as_path(), stamp);
    }

    fn mk_source_entry(&self, state: &mut CacheState, source_hash: &str) -> Result<SourceEntry> {
        let dir = self.source_dir(source_hash);
        let ref_file = self.source_ref(source_hash);

        if fs::ensure_dir(dir.as_path())? {
            fs::touch(ref_file.as_path())?;
            let stamp = state.timestamp.increment();
            fs::set_access_time_quiet(ref_file.as_path(), stamp);
            return Ok(SourceEntry::New);
        }

        if ref_file.exists() {
            let has_outputs = fs::read_dir_names(dir.as_path())?
                .iter()
                .any(|name| name != REF_FILE);
            return Ok(if has_outputs {
                SourceEntry::Complete
            } else {
                SourceEntry::Empty
            });
        }

        // torn state from an aborted run: purge leftovers, recreate `.ref`
        warn!("repairing torn source entry {dir}");
        for name in fs::read_dir_names(dir.as_path())? {
            debug!("delete \"{}{name}\"", dir.as_str());
            fs::remove_file_quiet(&dir.as_path().join(&name));
        }

        fs::touch(ref_file.as_path())?;
        let stamp = state.timestamp.increment();
        fs::set_access_time_quiet(ref_file.as_path(), stamp);

        Ok(SourceEntry::New)
    }

    /// Point a stream-key directory at a source's reference file
    ///
    /// Replaces a differing `src:*` link, keeps a matching one. Returns
    /// `result_if_added` when no link existed before.
    fn link_key_to_source(
        &self,
        key_dir: &CachePath,
        source_hash: &str,
        result_if_added: AddKeyResult,
    ) -> AddKeyResult {
        debug!("link key {key_dir} to source {source_hash}");

        let old_link = match self.stream_key_source_link(key_dir) {
            Ok(old) => old,
            Err(e) if e.is_not_found() => return AddKeyResult::InternalError,
            Err(_) => return AddKeyResult::IoError,
        };

        let new_link = format!("{SOURCE_LINK_PREFIX}{source_hash}");

        let result_on_success = match old_link {
            None => result_if_added,
            Some(old) if old == new_link => return AddKeyResult::NotChanged,
            Some(old) => {
                fs::remove_file_quiet(&key_dir.as_path().join(old));
                AddKeyResult::Replaced
            }
        };

        match fs::hard_link(
            self.source_ref(source_hash).as_path(),
            &key_dir.as_path().join(new_link),
        ) {
            Ok(()) => result_on_success,
            Err(e) => add_key_error(&e),
        }
    }

    fn import_objects(
        &self,
        state: &mut CacheState,
        source_hash: &str,
        import_files: &[PathBuf],
    ) -> UpdateSourceResult {
        let source_dir = self.source_dir(source_hash);
        let mut added_objects = false;

        for file in import_files {
            let data = match std::fs::read(file) {
                Ok(data) => data,
                Err(e) => {
                    warn!("cannot import object {:?} (ignored): {e}", file.display());
                    continue;
                }
            };
            let object_hash = hash::hash_bytes(&data);
            drop(data);

            let object_path = self.object_file(&object_hash);
            match self.mk_object_entry(&object_path, file) {
                Ok(true) => {
                    debug!("new object {object_hash} ({})", file.display());
                    added_objects = true;
                    state.statistics.add_object();
                    state.statistics.mark_dirty();
                }
                Ok(false) => {
                    debug!("already have object {object_hash} ({})", file.display());
                }
                Err(e) => return update_error(&e),
            }

            let Some(basename) = file.file_name().and_then(|n| n.to_str()) else {
                error!("BUG: unusable import path {:?}", file.display());
                return UpdateSourceResult::InternalError;
            };
            let link_name = format!("{basename}:{object_hash}");

            let existing = match fs::read_dir_names(source_dir.as_path()) {
                Ok(names) => names.into_iter().find(|name| matches_format(name, basename)),
                Err(e) => return update_error(&e),
            };

            match existing {
                Some(found) if found == link_name => {
                    debug!("link \"{link_name}\" up-to-date");
                    continue;
                }
                Some(found) => {
                    debug!("replace link \"{found}\" by \"{link_name}\"");
                    fs::remove_file_quiet(&source_dir.as_path().join(found));
                }
                None => debug!("create new link \"{link_name}\""),
            }

            if let Err(e) = fs::hard_link(
                object_path.as_path(),
                &source_dir.as_path().join(link_name),
            ) {
                return update_error(&e);
            }
        }

        if added_objects {
            UpdateSourceResult::UpdatedSourceOnly
        } else {
            UpdateSourceResult::NotChanged
        }
    }

    /// Move an import file into the object tree; true if a new object landed
    fn mk_object_entry(&self, object_path: &CachePath, import_file: &Path) -> Result<bool> {
        if object_path.exists() {
            return Ok(false);
        }

        fs::create_dir_all(Path::new(object_path.dir_str()))?;
        fs::rename(import_file, object_path.as_path())?;

        Ok(true)
    }

    fn link_pending_keys(
        &self,
        source_hash: &str,
        pending_keys: &mut [(StreamKeyRef, AddKeyResult)],
        source_updated: bool,
    ) -> UpdateSourceResult {
        let mut updated_keys = false;

        for (key, slot) in pending_keys.iter_mut() {
            if *slot != AddKeyResult::SourceUnknown {
                error!("BUG: pending key {key} carries early result {slot:?}");
            }

            let key_dir = self.stream_key_dir(key);
            if !key_dir.exists() {
                warn!("failed updating \"{key_dir}\", does not exist (ignored)");
                continue;
            }

            *slot = self.link_key_to_source(&key_dir, source_hash, AddKeyResult::Inserted);

            match *slot {
                AddKeyResult::NotChanged => {
                    if source_updated {
                        *slot = AddKeyResult::Inserted;
                    }
                    debug!("key {key} still points to {source_hash}");
                }
                AddKeyResult::Replaced => {
                    debug!("updated key {key} -> {source_hash}");
                    updated_keys = true;
                }
                AddKeyResult::Inserted => {
                    // key directory had lost its src:* link; repaired now
                    debug!("repaired key {key} -> {source_hash}");
                    updated_keys = true;
                }
                AddKeyResult::IoError => return UpdateSourceResult::IoError,
                AddKeyResult::DiskFull => return UpdateSourceResult::DiskFull,
                AddKeyResult::InternalError => return UpdateSourceResult::InternalError,
                AddKeyResult::SourcePending | AddKeyResult::SourceUnknown => {
                    error!("BUG: unreachable link result {slot:?}");
                    return UpdateSourceResult::InternalError;
                }
            }
        }

        if updated_keys {
            UpdateSourceResult::UpdatedKeysOnly
        } else {
            UpdateSourceResult::NotChanged
        }
    }

    /// Remove an unreferenced source and any objects it alone was holding
    ///
    /// Sources whose `.ref` is still linked from a stream-key directory are
    /// left alone, so no key ever dangles on a shared source.
    pub(crate) fn delete_source_locked(&self, state: &mut CacheState, source_hash: &str) -> bool {
        let ref_file = self.source_ref(source_hash);

        match fs::link_count(ref_file.as_path()) {
            Ok(1) => {}
            Ok(_) => {
                debug!("source {source_hash} still referenced");
                return false;
            }
            Err(_) => return false,
        }

        let dir = self.source_dir(source_hash);
        for name in fs::read_dir_names(dir.as_path()).unwrap_or_default() {
            if name == REF_FILE {
                continue;
            }

            fs::remove_file_quiet(&dir.as_path().join(&name));

            if let Some((_, object_hash)) = name.rsplit_once(':')
                && hash::is_full_hash(object_hash)
            {
                self.delete_object_locked(state, object_hash);
            }
        }

        fs::remove_file_quiet(ref_file.as_path());
        fs::remove_dir_quiet(dir.as_path());

        state.statistics.remove_source();
        state.statistics.mark_dirty();

        true
    }

    /// Remove an unreferenced object
    pub(crate) fn delete_object_locked(&self, state: &mut CacheState, object_hash: &str) -> bool {
        let file = self.object_file(object_hash);

        match fs::link_count(file.as_path()) {
            Ok(1) => {}
            Ok(_) => {
                debug!("object {object_hash} still referenced");
                return false;
            }
            Err(_) => return false,
        }

        fs::remove_file_quiet(file.as_path());
        state.statistics.remove_object();
        state.statistics.mark_dirty();

        true
    }

    /// Wipe the whole cache and recreate empty trees
    fn reset_locked(&self, state: &mut CacheState) -> Result<()> {
        fs::remove_dir_all(&self.cache_root)?;
        fs::create_dir_all(&self.sources_root)?;
        fs::create_dir_all(&self.objects_root)?;
        state.statistics.reset();
        Ok(())
    }

    pub(crate) fn count_all(&self) -> Result<(usize, usize, usize)> {
        Ok((
            self.count_key_entries()?,
            self.count_hashed_entries(&self.sources_root)?,
            self.count_hashed_entries(&self.objects_root)?,
        ))
    }

    /// Count `(stream key, priority)` leaf directories
    fn count_key_entries(&self) -> Result<usize> {
        let mut count = 0;

        for shard in fs::read_dir_names(&self.cache_root)? {
            if !hash::is_shard_name(&shard) {
                continue;
            }

            let shard_dir = self.cache_root.join(&shard);
            for entry in fs::read_dir_names(&shard_dir)? {
                if !hash::is_valid_hash(&entry) {
                    continue;
                }

                let key_dir = shard_dir.join(&entry);
                count += fs::read_dir_names(&key_dir)?
                    .iter()
                    .filter(|name| parse_priority(name).is_some())
                    .count();
            }
        }

        Ok(count)
    }

    /// Count hashed entries one level below the shard directories
    fn count_hashed_entries(&self, root: &Path) -> Result<usize> {
        let mut count = 0;

        for shard in fs::read_dir_names(root)? {
            if !hash::is_shard_name(&shard) {
                continue;
            }

            count += fs::read_dir_names(&root.join(&shard))?
                .iter()
                .filter(|name| hash::is_valid_hash(name))
                .count();
        }

        Ok(count)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache state poisoned")
    }

    pub(crate) fn stream_key_root(&self, stream_key: &str) -> CachePath {
        let mut path = CachePath::new(&self.root_str);
        path.append_hash(stream_key, false);
        path
    }

    pub(crate) fn stream_key_dir(&self, key: &StreamKeyRef) -> CachePath {
        let mut path = self.stream_key_root(&key.stream_key);
        path.append_part(&key.priority_dir(), false);
        path
    }

    pub(crate) fn source_dir(&self, source_hash: &str) -> CachePath {
        let mut path = CachePath::new(format!("{}/{SOURCES_DIR}", self.root_str));
        path.append_hash(source_hash, false);
        path
    }

    pub(crate) fn source_ref(&self, source_hash: &str) -> CachePath {
        let mut path = self.source_dir(source_hash);
        path.append_part(REF_FILE, true);
        path
    }

    pub(crate) fn object_file(&self, object_hash: &str) -> CachePath {
        let mut path = CachePath::new(format!("{}/{OBJECTS_DIR}", self.root_str));
        path.append_hash(object_hash, true);
        path
    }

    fn stream_key_source_link(&self, key_dir: &CachePath) -> Result<Option<String>> {
        let names = fs::read_dir_names(key_dir.as_path())?;
        Ok(names
            .into_iter()
            .find(|name| name.starts_with(SOURCE_LINK_PREFIX))
            .map(|name| name[SOURCE_LINK_PREFIX.len()..].to_owned()))
    }
}

/// True if a directory entry carries the requested format
///
/// Format links are named `<format_spec>@<dimensions>:<object_hash>`; a
/// request matches on any prefix that ends at an `@` or `:` boundary, so
/// `png` selects `png@120x120:<hash>` while `gif` selects nothing.
pub(crate) fn matches_format(entry: &str, format: &str) -> bool {
    entry.len() > format.len()
        && entry.starts_with(format)
        && matches!(entry.as_bytes()[format.len()], b'@' | b':')
}

/// Parse a `PPP` priority directory name
fn parse_priority(name: &str) -> Option<u8> {
    if name.len() != 3 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match name.parse::<u16>() {
        Ok(p @ 1..=255) => Some(p as u8),
        _ => None,
    }
}

fn add_key_error(e: &Error) -> AddKeyResult {
    if e.is_disk_full() {
        AddKeyResult::DiskFull
    } else if e.is_internal() {
        AddKeyResult::InternalError
    } else {
        AddKeyResult::IoError
    }
}

fn update_error(e: &Error) -> UpdateSourceResult {
    if e.is_disk_full() {
        UpdateSourceResult::DiskFull
    } else if e.is_internal() {
        UpdateSourceResult::InternalError
    } else {
        UpdateSourceResult::IoError
    }
}

/// Read a file through a memory mapping
fn map_file(path: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let len = file
        .metadata()
        .map_err(|e| Error::io(e, path, "stat"))?
        .len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // SAFETY: the mapping is copied into an owned buffer and unmapped right
    // away; objects are write-once files that are replaced by rename.
    let mapping =
        unsafe { memmap2::Mmap::map(&file) }.map_err(|e| Error::io(e, path, "mmap"))?;
    Ok(mapping.to_vec())
}
