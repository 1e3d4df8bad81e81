//! Hashed on-disk path construction
//!
//! Cache paths interleave two kinds of components: hashes, which are split
//! into a two-character shard directory plus the remainder (`ab/cdef…`), and
//! verbatim parts such as priority directories or file names. A path can be
//! terminated by a file component; appending anything past a file terminal is
//! a contract violation and leaves the path unchanged.

use std::path::Path;
use tracing::error;

/// Builder for hashed cache paths
///
/// Directory paths keep a trailing `/` so intermediate paths can be cloned
/// and extended without re-checking separators.
#[derive(Debug, Clone)]
pub struct CachePath {
    path: String,
    is_file: bool,
    dir_len: usize,
}

impl CachePath {
    /// Start a path at the given root directory
    #[must_use]
    pub fn new(root: impl AsRef<str>) -> Self {
        let mut path = root.as_ref().to_owned();
        path.push('/');
        let dir_len = path.len();
        Self {
            path,
            is_file: false,
            dir_len,
        }
    }

    /// Append a hash component, sharded as `<h[0:2]>/<h[2:]>`
    ///
    /// Hashes shorter than three characters cannot be sharded and are
    /// rejected with a BUG log, leaving the path unchanged.
    pub fn append_hash(&mut self, hash: &str, as_file: bool) -> &mut Self {
        if self.is_file {
            error!("BUG: cannot append hash to file name");
            return self;
        }

        if hash.is_empty() {
            error!("BUG: cannot append empty hash to path");
            return self;
        }

        if hash.len() < 3 {
            error!("BUG: hash \"{hash}\" too short");
            return self;
        }

        self.path.push_str(&hash[..2]);
        self.path.push('/');
        self.path.push_str(&hash[2..]);

        if as_file {
            self.is_file = true;
            // the directory part gained the shard level only
            self.dir_len += 3;
        } else {
            self.path.push('/');
            self.dir_len = self.path.len();
        }

        self
    }

    /// Append a verbatim component
    pub fn append_part(&mut self, part: &str, as_file: bool) -> &mut Self {
        if self.is_file {
            error!("BUG: cannot append part to file name");
            return self;
        }

        if part.is_empty() {
            error!("BUG: cannot append empty part to path");
            return self;
        }

        self.path.push_str(part);

        if as_file {
            self.is_file = true;
        } else {
            self.path.push('/');
            self.dir_len = self.path.len();
        }

        self
    }

    /// The full path, including a trailing `/` for directories
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The directory prefix of the path, trimming any file terminal
    #[must_use]
    pub fn dir_str(&self) -> &str {
        if self.is_file {
            &self.path[..self.dir_len]
        } else {
            &self.path
        }
    }

    /// The full path as a borrowed [`Path`]
    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.path)
    }

    /// True if the path is terminated by a file component
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.is_file
    }

    /// True if the path exists on disk with the expected type
    ///
    /// A directory path existing as a file (or the other way round) does not
    /// count as existing.
    #[must_use]
    pub fn exists(&self) -> bool {
        match std::fs::metadata(self.as_path()) {
            Ok(meta) => {
                if meta.is_dir() {
                    !self.is_file
                } else if meta.is_file() {
                    self.is_file
                } else {
                    error!("BUG: unexpected type of path {}", self.path);
                    false
                }
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for CachePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_keeps_trailing_slash() {
        let p = CachePath::new("/cache/root");
        assert_eq!(p.as_str(), "/cache/root/");
        assert_eq!(p.dir_str(), "/cache/root/");
    }

    #[test]
    fn test_empty_root_refers_to_filesystem_root() {
        let p = CachePath::new("");
        assert_eq!(p.as_str(), "/");
        assert_eq!(p.dir_str(), "/");
    }

    #[test]
    fn test_append_hash_as_directory() {
        let mut p = CachePath::new("/cache");
        p.append_hash("64ef367018099de4d4183ffa3bc0848a", false);
        assert_eq!(p.as_str(), "/cache/64/ef367018099de4d4183ffa3bc0848a/");
    }

    #[test]
    fn test_append_hash_as_file() {
        let mut p = CachePath::new("/cache");
        p.append_hash("64ef367018099de4d4183ffa3bc0848a", true);
        assert_eq!(p.as_str(), "/cache/64/ef367018099de4d4183ffa3bc0848a");
        assert_eq!(p.dir_str(), "/cache/64/");
    }

    #[test]
    fn test_append_empty_hash_is_rejected() {
        let mut p = CachePath::new("/cache");
        p.append_hash("", false);
        assert_eq!(p.as_str(), "/cache/");
        p.append_hash("", true);
        assert_eq!(p.as_str(), "/cache/");
    }

    #[test]
    fn test_append_short_hash_is_rejected() {
        let mut p = CachePath::new("/cache");
        p.append_hash("a", false);
        assert_eq!(p.as_str(), "/cache/");
        p.append_hash("ab", false);
        assert_eq!(p.as_str(), "/cache/");

        // three characters is the shortest shardable hash
        p.append_hash("abc", false);
        assert_eq!(p.as_str(), "/cache/ab/c/");
    }

    #[test]
    fn test_append_empty_part_is_rejected() {
        let mut p = CachePath::new("/cache");
        p.append_part("", false);
        assert_eq!(p.as_str(), "/cache/");
        p.append_part("", true);
        assert_eq!(p.as_str(), "/cache/");
    }

    #[test]
    fn test_append_multiple_components() {
        let mut p = CachePath::new("/cache");
        p.append_hash("64ef367018099de4d4183ffa3bc0848a", false)
            .append_part("050", false)
            .append_part("some_file", true);
        assert_eq!(
            p.as_str(),
            "/cache/64/ef367018099de4d4183ffa3bc0848a/050/some_file"
        );
        assert_eq!(p.dir_str(), "/cache/64/ef367018099de4d4183ffa3bc0848a/050/");
    }

    #[test]
    fn test_append_past_file_terminal_is_rejected() {
        let mut p = CachePath::new("/cache");
        p.append_hash("64ef367018099de4d4183ffa3bc0848a", true)
            .append_part("050", false)
            .append_part("some_file", true);
        assert_eq!(p.as_str(), "/cache/64/ef367018099de4d4183ffa3bc0848a");
        assert_eq!(p.dir_str(), "/cache/64/");
    }

    #[test]
    fn test_intermediate_paths_can_fork() {
        let mut root = CachePath::new("/root");
        root.append_part("sub", false).append_hash("123456", false);

        let mut a = root.clone();
        a.append_hash("abcdef", false).append_part("file", true);

        let mut b = root.clone();
        b.append_part("hello", true);

        let mut c = root.clone();
        c.append_part("another_sub", false);

        assert_eq!(root.as_str(), "/root/sub/12/3456/");
        assert_eq!(a.as_str(), "/root/sub/12/3456/ab/cdef/file");
        assert_eq!(a.dir_str(), "/root/sub/12/3456/ab/cdef/");
        assert_eq!(b.as_str(), "/root/sub/12/3456/hello");
        assert_eq!(b.dir_str(), "/root/sub/12/3456/");
        assert_eq!(c.as_str(), "/root/sub/12/3456/another_sub/");
    }

    #[test]
    fn test_exists_checks_path_type() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();

        let mut dir = CachePath::new(root);
        dir.append_part("d", false);
        let mut file = CachePath::new(root);
        file.append_part("f", true);

        assert!(!dir.exists());
        assert!(!file.exists());

        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("f"), b"x").unwrap();

        assert!(dir.exists());
        assert!(file.exists());

        // type mismatch does not count as existing
        let mut dir_as_file = CachePath::new(root);
        dir_as_file.append_part("d", true);
        assert!(!dir_as_file.exists());

        let mut file_as_dir = CachePath::new(root);
        file_as_dir.append_part("f", false);
        assert!(!file_as_dir.exists());
    }
}
