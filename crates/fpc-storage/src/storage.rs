//! Storage trait and error types.
//!
//! Provides the [`Storage`] trait that page cache entries, the backlog and the
//! purge orchestrator use for every file and directory operation, along with
//! [`StorageError`] for unified error handling across backends.
//!
//! # Path Convention
//!
//! All paths are relative to the backend root:
//! - `"pagecache/desktop"` - device directory
//! - `"pagecache/desktop/<hash>_i"` - invalidated family of one URL
//! - `"backlog.queue"` - backlog file
//!
//! Backends map these to their own layout (directories on disk, hash keys in a
//! key-value store).

use std::path::{Component, Path, PathBuf};

use crate::handle::{FileHandle, OpenMode};

/// Semantic error categories.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageErrorKind {
    /// Resource does not exist.
    NotFound,
    /// Permission denied.
    PermissionDenied,
    /// Resource already exists (for create operations).
    AlreadyExists,
    /// Invalid path or identifier.
    InvalidPath,
    /// Lock could not be acquired in time.
    LockTimeout,
    /// Backend is temporarily unavailable.
    Unavailable,
    /// Operation timed out.
    Timeout,
    /// Other/unknown error category.
    Other,
}

/// Storage error with semantic kind and backend-specific source.
#[derive(Debug)]
pub struct StorageError {
    /// Semantic error category.
    pub kind: StorageErrorKind,
    /// Path context (if applicable).
    pub path: Option<PathBuf>,
    /// Backend identifier (e.g., "Fs", "Kv").
    pub backend: Option<&'static str>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    /// Create a new storage error.
    #[must_use]
    pub fn new(kind: StorageErrorKind) -> Self {
        Self {
            kind,
            path: None,
            backend: None,
            source: None,
        }
    }

    /// Attach path context.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach backend identifier.
    #[must_use]
    pub fn with_backend(mut self, backend: &'static str) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Attach the underlying error source.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Create a not found error with path.
    #[must_use]
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::new(StorageErrorKind::NotFound).with_path(path)
    }

    /// Whether this error means the resource is missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Create a storage error from an I/O error.
    #[must_use]
    pub fn io(err: std::io::Error, path: Option<PathBuf>) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            std::io::ErrorKind::TimedOut => StorageErrorKind::Timeout,
            _ => StorageErrorKind::Other,
        };
        let mut error = Self::new(kind).with_source(err);
        if let Some(p) = path {
            error = error.with_path(p);
        }
        error
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Format: "[Backend] Kind: message (path: /foo/bar)"
        if let Some(backend) = self.backend {
            write!(f, "[{backend}] ")?;
        }

        let kind_str = match self.kind {
            StorageErrorKind::NotFound => "Not found",
            StorageErrorKind::PermissionDenied => "Permission denied",
            StorageErrorKind::AlreadyExists => "Already exists",
            StorageErrorKind::InvalidPath => "Invalid path",
            StorageErrorKind::LockTimeout => "Lock timeout",
            StorageErrorKind::Unavailable => "Unavailable",
            StorageErrorKind::Timeout => "Timeout",
            StorageErrorKind::Other => "Error",
        };

        write!(f, "{kind_str}")?;

        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }

        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Reject absolute paths and parent-directory traversal.
///
/// Backends call this before touching anything so that a crafted URL hash or
/// config value can never escape the cache root.
pub fn validate_path(path: &Path, backend: &'static str) -> Result<(), StorageError> {
    let valid = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(())
    } else {
        Err(StorageError::new(StorageErrorKind::InvalidPath)
            .with_path(path)
            .with_backend(backend))
    }
}

/// File and directory operations shared by all cache backends.
///
/// Implementations must be thread-safe (`Send + Sync`). Several request
/// handlers, possibly in different processes, use the same root at once, so
/// anything that needs mutual exclusion goes through [`FileHandle::lock`].
pub trait Storage: Send + Sync {
    /// Check if a file or directory exists.
    fn exists(&self, path: &Path) -> bool;

    /// Check if a path is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Read the whole file.
    ///
    /// Returns `StorageErrorKind::NotFound` if the file doesn't exist.
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError>;

    /// Replace the whole file, creating parent directories as needed.
    fn write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError>;

    /// Move a file or directory, replacing an existing destination file.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError>;

    /// Delete a file. Deleting a missing file succeeds.
    fn delete(&self, path: &Path) -> Result<(), StorageError>;

    /// Create a directory and its parents.
    fn create_dir(&self, path: &Path) -> Result<(), StorageError>;

    /// Delete a directory and everything under it. A missing directory is
    /// not an error.
    fn delete_dir(&self, path: &Path) -> Result<(), StorageError>;

    /// Whether a directory has no entries.
    fn is_empty_dir(&self, path: &Path) -> Result<bool, StorageError>;

    /// Call `f` with the path (relative to the root) of every direct child of
    /// `dir`, files and directories alike.
    ///
    /// The listing is taken before the first callback, so `f` may rename or
    /// delete the entries it receives.
    fn for_each_entry(
        &self,
        dir: &Path,
        f: &mut dyn FnMut(&Path) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;

    /// Modification time as unix seconds.
    fn mtime(&self, path: &Path) -> Result<u64, StorageError>;

    /// Set the modification time of an existing file or directory, creating
    /// an empty file if nothing exists at `path`. `None` means now.
    fn touch(&self, path: &Path, time: Option<u64>) -> Result<(), StorageError>;

    /// Open a sequential handle.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::new(StorageErrorKind::NotFound)
            .with_path("pagecache/desktop/a.html")
            .with_backend("Fs");

        assert_eq!(
            err.to_string(),
            "[Fs] Not found (path: pagecache/desktop/a.html)"
        );
    }

    #[test]
    fn test_storage_error_display_with_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::io(io_err, Some(PathBuf::from("pagecache"))).with_backend("Fs");

        assert_eq!(
            err.to_string(),
            "[Fs] Permission denied: access denied (path: pagecache)"
        );
        assert_eq!(err.kind, StorageErrorKind::PermissionDenied);
    }

    #[test]
    fn test_io_error_kinds() {
        let err = StorageError::io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"), None);
        assert_eq!(err.kind, StorageErrorKind::Timeout);

        let err = StorageError::io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"), None);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path(Path::new("pagecache/desktop/abc_i"), "Fs").is_ok());
        assert!(validate_path(Path::new("./backlog.queue"), "Fs").is_ok());
        assert!(validate_path(Path::new("../etc/passwd"), "Fs").is_err());
        assert!(validate_path(Path::new("pagecache/../../x"), "Fs").is_err());
        assert!(validate_path(Path::new("/etc/passwd"), "Fs").is_err());
    }
}
