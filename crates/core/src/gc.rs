//! Garbage collection
//!
//! Two-watermark, access-time-driven LRU decimation. A collection is
//! triggered when any counter exceeds the configured upper limit and trims
//! until every counter is at or below the lower watermark (or nothing more
//! can be removed). Each round computes a per-tier age threshold between the
//! oldest and newest observed access time and deletes what falls below it,
//! in the order stream keys, then sources, then objects, so entries orphaned
//! by an earlier tier become collectable in the next one.
//!
//! The first round assumes a roughly uniform age distribution and cuts
//! aggressively; follow-up rounds trim conservatively. The manager lock is
//! yielded between walks and tiers so lookups interleave with a running
//! collection.

use crate::config::{GC_APPROACHING_PERCENTAGE, GC_FIRST_ROUND_BIAS, GC_MAX_FAIL_ROUNDS, LIMITS_LOW_HI_PERCENTAGE};
use crate::fs;
use crate::hash;
use crate::manager::{CacheState, Manager, REF_FILE};
use crate::types::GcOutcome;
use crate::Result;
use filetime::FileTime;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// One scanned tier: entry paths with their access times
struct TierScan {
    entries: Vec<(PathBuf, FileTime)>,
    min: FileTime,
    max: FileTime,
}

impl TierScan {
    fn from_entries(entries: Vec<(PathBuf, FileTime)>) -> Option<Self> {
        let min = entries.iter().map(|(_, t)| *t).min()?;
        let max = entries.iter().map(|(_, t)| *t).max()?;
        Some(Self { entries, min, max })
    }

    /// Age threshold at `percentage` between the oldest and newest entry
    fn threshold(&self, percentage: u8) -> FileTime {
        let min = micros_of(self.min);
        let max = micros_of(self.max);
        let cut = min + ((max - min) * i128::from(percentage)) / 100;
        from_micros(cut)
    }
}

fn micros_of(ft: FileTime) -> i128 {
    i128::from(ft.unix_seconds()) * 1_000_000 + i128::from(ft.nanoseconds() / 1_000)
}

fn from_micros(micros: i128) -> FileTime {
    let seconds = micros.div_euclid(1_000_000);
    let rest = micros.rem_euclid(1_000_000);
    FileTime::from_unix_time(seconds as i64, (rest as u32) * 1_000)
}

impl Manager {
    /// Execute garbage collection rounds until the cache is at the lower
    /// watermark or nothing more can be removed
    pub(crate) fn do_gc(&self) -> GcOutcome {
        let mut removed_anything = false;
        let mut previous_round_removed = false;
        let mut fruitless_rounds = 0u32;

        loop {
            {
                let mut state = self.lock_state();

                if state.statistics.mark_unchanged() {
                    // the trees changed under us since the last round
                    match self.count_all() {
                        Ok((keys, sources, objects)) => {
                            state.statistics.set_counts(keys, sources, objects);
                        }
                        Err(e) => {
                            warn!("gc: failed recounting cache ({e})");
                            return GcOutcome::IoError;
                        }
                    }
                }

                if !state.statistics.exceeds_limits(&self.lower_limits) {
                    break;
                }
            }

            let percentage = if previous_round_removed {
                GC_APPROACHING_PERCENTAGE
            } else {
                LIMITS_LOW_HI_PERCENTAGE + GC_FIRST_ROUND_BIAS
            };

            let round_removed = match self.gc_round(percentage) {
                Ok(removed) => removed,
                Err(e) => {
                    warn!("gc: round failed ({e})");
                    return GcOutcome::IoError;
                }
            };

            removed_anything |= round_removed;
            previous_round_removed = round_removed;

            if round_removed {
                fruitless_rounds = 0;
            } else {
                fruitless_rounds += 1;
                if fruitless_rounds >= GC_MAX_FAIL_ROUNDS {
                    debug!("gc: giving up after {fruitless_rounds} fruitless rounds");
                    break;
                }
            }
        }

        if removed_anything {
            self.lock_state().statistics.dump("Cache statistics after GC");
            GcOutcome::Deflated
        } else {
            GcOutcome::NotPossible
        }
    }

    /// Run garbage collection synchronously and report the outcome
    ///
    /// The regular [`Manager::gc`] entry point only schedules background
    /// work; this variant is for operator tooling that wants the result.
    pub fn force_gc(&self) -> GcOutcome {
        if !self
            .lock_state()
            .statistics
            .exceeds_limits(&self.upper_limits)
        {
            return GcOutcome::NotRequired;
        }

        self.do_gc()
    }

    /// One decimation round; true if any tier removed something
    fn gc_round(&self, percentage: u8) -> Result<bool> {
        let keys_scan = {
            let state = self.lock_state();
            let scan = self.scan_key_tier()?;
            verify_count(scan.len(), state.statistics.keys(), "stream keys");
            TierScan::from_entries(scan)
        };
        std::thread::yield_now();

        let sources_scan = {
            let state = self.lock_state();
            let scan = self.scan_source_tier()?;
            verify_count(scan.len(), state.statistics.sources(), "sources");
            TierScan::from_entries(scan)
        };
        std::thread::yield_now();

        let objects_scan = {
            let state = self.lock_state();
            let scan = self.scan_object_tier()?;
            verify_count(scan.len(), state.statistics.objects(), "objects");
            TierScan::from_entries(scan)
        };
        std::thread::yield_now();

        let mut removed = false;

        if let Some(scan) = keys_scan {
            let threshold = scan.threshold(percentage);
            let mut state = self.lock_state();
            removed |= self.decimate_keys(&mut state, &scan, threshold) > 0;
        }
        std::thread::yield_now();

        if let Some(scan) = sources_scan {
            let threshold = scan.threshold(percentage);
            let mut state = self.lock_state();
            removed |= self.decimate_sources(&mut state, &scan, threshold) > 0;
        }
        std::thread::yield_now();

        if let Some(scan) = objects_scan {
            let threshold = scan.threshold(percentage);
            let mut state = self.lock_state();
            removed |= self.decimate_objects(&mut state, &scan, threshold) > 0;
        }
        std::thread::yield_now();

        {
            let _state = self.lock_state();
            self.prune_empty_shards();
        }

        Ok(removed)
    }

    /// Collect every `(stream key, priority)` leaf directory with its atime
    fn scan_key_tier(&self) -> Result<Vec<(PathBuf, FileTime)>> {
        let mut entries = Vec::new();

        for key_dir in self.key_hash_dirs()? {
            for name in fs::read_dir_names(&key_dir)? {
                let leaf = key_dir.join(&name);
                if !leaf.is_dir() {
                    continue;
                }
                match fs::access_time(&leaf) {
                    Ok(atime) => entries.push((leaf, atime)),
                    Err(e) => warn!("gc: skipping {}: {e}", leaf.display()),
                }
            }
        }

        Ok(entries)
    }

    /// Collect every source directory, keyed by its `.ref` file's atime
    fn scan_source_tier(&self) -> Result<Vec<(PathBuf, FileTime)>> {
        let mut entries = Vec::new();

        for dir in hashed_subdirs(&self.sources_root)? {
            let ref_file = dir.join(REF_FILE);
            match fs::access_time(&ref_file) {
                Ok(atime) => entries.push((dir, atime)),
                Err(e) => warn!("gc: skipping {}: {e}", dir.display()),
            }
        }

        Ok(entries)
    }

    /// Collect every object file with its atime
    fn scan_object_tier(&self) -> Result<Vec<(PathBuf, FileTime)>> {
        let mut entries = Vec::new();

        for file in hashed_subdirs(&self.objects_root)? {
            match fs::access_time(&file) {
                Ok(atime) => entries.push((file, atime)),
                Err(e) => warn!("gc: skipping {}: {e}", file.display()),
            }
        }

        Ok(entries)
    }

    fn decimate_keys(&self, state: &mut CacheState, scan: &TierScan, threshold: FileTime) -> usize {
        let mut removed = 0;

        for (leaf, atime) in &scan.entries {
            if *atime >= threshold {
                continue;
            }

            debug!("gc: removing stream key entry {}", leaf.display());
            if fs::remove_dir_all(leaf).is_ok() {
                state.statistics.remove_key();
                removed += 1;

                // drop the key-hash level once its last priority is gone
                if let Some(parent) = leaf.parent() {
                    fs::remove_dir_quiet(parent);
                }
            }
        }

        removed
    }

    fn decimate_sources(
        &self,
        state: &mut CacheState,
        scan: &TierScan,
        threshold: FileTime,
    ) -> usize {
        let mut removed = 0;

        for (dir, atime) in &scan.entries {
            if *atime >= threshold {
                continue;
            }

            // still referenced by a stream key?
            match fs::link_count(&dir.join(REF_FILE)) {
                Ok(1) => {}
                Ok(_) => continue,
                Err(_) => continue,
            }

            debug!("gc: removing source {}", dir.display());
            if fs::remove_dir_all(dir).is_ok() {
                state.statistics.remove_source();
                removed += 1;
            }
        }

        removed
    }

    fn decimate_objects(
        &self,
        state: &mut CacheState,
        scan: &TierScan,
        threshold: FileTime,
    ) -> usize {
        let mut removed = 0;

        for (file, atime) in &scan.entries {
            if *atime >= threshold {
                continue;
            }

            match fs::link_count(file) {
                Ok(1) => {}
                Ok(_) => continue,
                Err(_) => continue,
            }

            debug!("gc: removing object {}", file.display());
            if std::fs::remove_file(file).is_ok() {
                state.statistics.remove_object();
                removed += 1;
            }
        }

        removed
    }

    /// Remove empty shard directories in all three trees
    fn prune_empty_shards(&self) {
        for root in [self.cache_root(), &self.sources_root, &self.objects_root] {
            let Ok(names) = fs::read_dir_names(root) else {
                continue;
            };
            for name in names {
                if hash::is_shard_name(&name) {
                    fs::remove_dir_quiet(&root.join(name));
                }
            }
        }
    }

    /// Rewrite every access time in the cache to one common base
    ///
    /// Runs on the background worker after a timestamp overflow, and once on
    /// a freshly created cache to homogenize atimes.
    pub(crate) fn do_reset_all_timestamps(&self) {
        let base = {
            let mut state = self.lock_state();
            if state.timestamp.overflown() {
                state.timestamp.rebase(FileTime::now());
                info!("timestamps rebased after overflow");
            }
            state.timestamp.file_time()
        };

        {
            let _state = self.lock_state();
            if let Ok(dirs) = self.key_hash_dirs() {
                for key_dir in dirs {
                    for name in fs::read_dir_names(&key_dir).unwrap_or_default() {
                        fs::set_access_time_quiet(&key_dir.join(name), base);
                    }
                }
            }
        }
        std::thread::yield_now();

        {
            let _state = self.lock_state();
            if let Ok(dirs) = hashed_subdirs(&self.sources_root) {
                for dir in dirs {
                    fs::set_access_time_quiet(&dir.join(REF_FILE), base);
                }
            }
        }
        std::thread::yield_now();

        {
            let _state = self.lock_state();
            if let Ok(files) = hashed_subdirs(&self.objects_root) {
                for file in files {
                    fs::set_access_time_quiet(&file, base);
                }
            }
            fs::set_access_time_quiet(&self.objects_root, base);
        }
    }

    /// All key-hash directories (`<root>/<xy>/<hash-24>`)
    fn key_hash_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();

        for shard in fs::read_dir_names(self.cache_root())? {
            if !hash::is_shard_name(&shard) {
                continue;
            }

            let shard_dir = self.cache_root().join(&shard);
            for name in fs::read_dir_names(&shard_dir)? {
                if hash::is_valid_hash(&name) {
                    dirs.push(shard_dir.join(name));
                }
            }
        }

        Ok(dirs)
    }
}

/// Hashed entries one level below the shard directories of `root`
fn hashed_subdirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();

    for shard in fs::read_dir_names(root)? {
        if !hash::is_shard_name(&shard) {
            continue;
        }

        let shard_dir = root.join(&shard);
        for name in fs::read_dir_names(&shard_dir)? {
            if hash::is_valid_hash(&name) {
                entries.push(shard_dir.join(name));
            }
        }
    }

    Ok(entries)
}

fn verify_count(scanned: usize, counted: usize, what: &str) {
    if scanned != counted {
        error!("BUG: gc scanned {scanned} {what}, statistics say {counted}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_interpolates_between_min_and_max() {
        let scan = TierScan {
            entries: Vec::new(),
            min: FileTime::from_unix_time(100, 0),
            max: FileTime::from_unix_time(200, 0),
        };

        assert_eq!(scan.threshold(0), FileTime::from_unix_time(100, 0));
        assert_eq!(scan.threshold(100), FileTime::from_unix_time(200, 0));
        assert_eq!(scan.threshold(70), FileTime::from_unix_time(170, 0));
        assert_eq!(scan.threshold(20), FileTime::from_unix_time(120, 0));
    }

    #[test]
    fn test_threshold_equal_min_max_removes_nothing() {
        let t = FileTime::from_unix_time(1000, 500_000);
        let scan = TierScan {
            entries: Vec::new(),
            min: t,
            max: t,
        };

        // entries are removed only when strictly older than the threshold
        assert_eq!(scan.threshold(70), t);
    }

    #[test]
    fn test_micros_round_trip() {
        let ft = FileTime::from_unix_time(123_456, 789_000);
        assert_eq!(from_micros(micros_of(ft)), ft);
    }
}
