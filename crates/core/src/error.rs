//! Error types for the cache core

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(artcache::io),
        help("Check file permissions and ensure the cache root exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "link", "rename")
        operation: String,
    },

    /// The filesystem holding the cache is out of space or quota
    #[error("no space left on device during {operation}{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(artcache::disk_full),
        help("Free up disk space or lower the cache limits so GC can reclaim entries")
    )]
    DiskFull {
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },

    /// Configuration or validation error
    #[error("cache configuration error: {message}")]
    #[diagnostic(code(artcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Invariant violation or unreachable state
    #[error("internal error: {message}")]
    #[diagnostic(code(artcache::internal))]
    Internal {
        /// Description of the violated invariant
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context, classifying out-of-space
    /// conditions into [`Error::DiskFull`].
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        if is_disk_full_io(&source) {
            return Self::DiskFull {
                path: Some(path.as_ref().into()),
                operation: operation.into(),
            };
        }

        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        if is_disk_full_io(&source) {
            return Self::DiskFull {
                path: None,
                operation: operation.into(),
            };
        }

        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// True if this error means the disk is full rather than broken
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull { .. })
    }

    /// True if this error is an invariant violation
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// The underlying I/O error kind, if any
    #[must_use]
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    /// True if this error is a missing file or directory
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.io_kind() == Some(std::io::ErrorKind::NotFound)
    }
}

fn is_disk_full_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
    )
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_full_classification() {
        let err = Error::io(
            std::io::Error::from(std::io::ErrorKind::StorageFull),
            "/cache/.obj",
            "link",
        );
        assert!(err.is_disk_full());

        let err = Error::io(
            std::io::Error::from(std::io::ErrorKind::NotFound),
            "/cache/.obj",
            "link",
        );
        assert!(!err.is_disk_full());
    }

    #[test]
    fn test_io_error_message_carries_path_and_operation() {
        let err = Error::io(
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            "/cache/aa/bb",
            "rename",
        );
        let msg = err.to_string();
        assert!(msg.contains("rename"));
        assert!(msg.contains("/cache/aa/bb"));
    }

    #[test]
    fn test_internal_error() {
        let err = Error::internal("unreachable state");
        assert!(err.is_internal());
        assert!(!err.is_disk_full());
    }
}
