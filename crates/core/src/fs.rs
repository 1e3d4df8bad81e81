//! Error-classifying filesystem wrappers
//!
//! Every syscall the cache performs goes through this layer so that failures
//! carry their path and operation, and so that out-of-space conditions are
//! classified once instead of at every call site. Hard-link counts and
//! access times are first-class here: link counts are the cache's reference
//! counts, access times its LRU signal.

use crate::{Error, Result};
use filetime::FileTime;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Create a directory hierarchy
pub(crate) fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(e, path, "create_dir_all"))
}

/// Ensure a directory exists, reporting whether this call created it
pub(crate) fn ensure_dir(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    create_dir_all(path)?;
    Ok(true)
}

/// Create an empty regular file
pub(crate) fn touch(path: &Path) -> Result<()> {
    fs::File::create(path)
        .map(drop)
        .map_err(|e| Error::io(e, path, "create"))
}

/// Create a hard link `dst` pointing at `src`'s inode
pub(crate) fn hard_link(src: &Path, dst: &Path) -> Result<()> {
    fs::hard_link(src, dst).map_err(|e| Error::io(e, dst, "link"))
}

/// Rename a file, atomic within one filesystem
pub(crate) fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| Error::io(e, to, "rename"))
}

/// Remove a regular file, treating "already gone" as success
pub(crate) fn remove_file_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!("failed to delete {}: {e}", path.display());
    }
}

/// Remove an empty directory
pub(crate) fn remove_dir(path: &Path) -> Result<()> {
    fs::remove_dir(path).map_err(|e| Error::io(e, path, "remove_dir"))
}

/// Remove an empty directory, ignoring failure
pub(crate) fn remove_dir_quiet(path: &Path) {
    let _ = fs::remove_dir(path);
}

/// Remove a directory tree
pub(crate) fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "remove_dir_all")),
    }
}

/// The names of all entries in a directory, skipping non-UTF-8 names
pub(crate) fn read_dir_names(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| Error::io(e, path, "read_dir"))? {
        let entry = entry.map_err(|e| Error::io(e, path, "read_dir_entry"))?;
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => {
                tracing::error!("BUG: non-UTF-8 name {name:?} in {}", path.display());
            }
        }
    }
    Ok(names)
}

/// Hard-link count of a file
pub(crate) fn link_count(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.nlink())
        .map_err(|e| Error::io(e, path, "stat"))
}

/// Access time of a file or directory
pub(crate) fn access_time(path: &Path) -> Result<FileTime> {
    fs::metadata(path)
        .map(|m| FileTime::from_last_access_time(&m))
        .map_err(|e| Error::io(e, path, "stat"))
}

/// Set the access time, logging instead of failing
///
/// Hot-path stamping must never turn a successful lookup into an error.
pub(crate) fn set_access_time_quiet(path: &Path, atime: FileTime) {
    if let Err(e) = filetime::set_file_atime(path, atime) {
        tracing::debug!("failed to stamp {}: {e}", path.display());
    }
}

/// Write bytes to a file
pub(crate) fn write(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::io(e, path, "write"))
}
