//! Counted lock that keeps remote lookups from writing pages while a purge
//! moves the cache around.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fpc_storage::{Clock, Storage, StorageError};

const LOCK_FILE: &str = "get_cache.lock";

/// Seconds after which a lock is considered abandoned.
pub const LOCK_EXPIRATION: u64 = 300;

/// File lock holding the number of purges in progress.
///
/// Every [`lock`](Self::lock) increments the counter and every
/// [`unlock`](Self::unlock) decrements it; the file is removed when the
/// counter reaches zero. The file time is refreshed on each change so a lock
/// left behind by a crashed process expires.
pub struct PageCacheLock {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl PageCacheLock {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            path: PathBuf::from(LOCK_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current counter. A missing or unreadable file counts as zero.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.storage
            .read(&self.path)
            .ok()
            .and_then(|raw| String::from_utf8_lossy(&raw).trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn lock(&self) -> Result<(), StorageError> {
        let count = if self.storage.exists(&self.path) {
            self.count() + 1
        } else {
            1
        };
        self.store(count)
    }

    /// Returns `false` when there was no lock to release.
    pub fn unlock(&self) -> Result<bool, StorageError> {
        if !self.storage.exists(&self.path) {
            return Ok(false);
        }
        let count = self.count() - 1;
        if count <= 0 {
            self.storage.delete(&self.path)?;
        } else {
            self.store(count)?;
        }
        Ok(true)
    }

    /// Take the lock until the returned guard is dropped.
    pub fn acquire(&self) -> Result<PageCacheLockGuard<'_>, StorageError> {
        self.lock()?;
        Ok(PageCacheLockGuard { lock: self })
    }

    /// Whether a purge holds the lock. An expired lock is removed.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        if !self.storage.exists(&self.path) {
            return false;
        }
        let mtime = self.storage.mtime(&self.path).unwrap_or(0);
        if self.clock.now().saturating_sub(mtime) <= LOCK_EXPIRATION {
            return true;
        }
        tracing::info!(path = %self.path.display(), "Removing abandoned page cache lock");
        if let Err(e) = self.storage.delete(&self.path) {
            tracing::warn!(error = %e, "Failed to remove abandoned page cache lock");
        }
        false
    }

    fn store(&self, count: i64) -> Result<(), StorageError> {
        self.storage.write(&self.path, count.to_string().as_bytes())?;
        self.storage.touch(&self.path, Some(self.clock.now()))
    }
}

/// Releases a [`PageCacheLock`] when dropped, also on early return.
pub struct PageCacheLockGuard<'a> {
    lock: &'a PageCacheLock,
}

impl Drop for PageCacheLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!(error = %e, "Failed to release page cache lock");
        }
    }
}
