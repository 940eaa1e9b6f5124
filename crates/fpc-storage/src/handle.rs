//! Sequential file handles with advisory locking.

use std::io::SeekFrom;
use std::ops::{Deref, DerefMut};

use crate::storage::StorageError;

/// How a handle is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only. The file must exist.
    Read,
    /// Read and write, creating the file if missing, keeping its contents.
    ReadWrite,
    /// Read and write, creating the file if missing, discarding its contents.
    Truncate,
}

/// Advisory lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    /// Many readers.
    Shared,
    /// Single writer.
    Exclusive,
    /// Release a held lock.
    Unlock,
}

/// Byte-stream handle over one file.
///
/// Locks are advisory and cross-process: every participant must lock through
/// the same backend for them to mean anything. Writes go to the current
/// position; [`flush`](Self::flush) makes them visible to other handles.
pub trait FileHandle: Send {
    /// Move the position. Returns the new absolute position.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError>;

    /// Current absolute position.
    fn tell(&mut self) -> Result<u64, StorageError>;

    /// Read up to `len` bytes from the current position.
    fn read(&mut self, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Read up to and including the next `\n`, returning the line without its
    /// terminator. Returns `None` at end of file.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write at the current position.
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Push buffered writes to the backend.
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Cut the file to `len` bytes.
    fn truncate(&mut self, len: u64) -> Result<(), StorageError>;

    /// Acquire or release an advisory lock, blocking until acquired.
    fn lock(&mut self, kind: LockKind) -> Result<(), StorageError>;

    /// Whether the position is at or past the end of the file.
    fn eof(&mut self) -> Result<bool, StorageError>;

    /// Flush, release any lock and close.
    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// A locked handle that unlocks when dropped.
///
/// Use this for every read-modify-write section so the lock is released on
/// every exit path, including `?` returns.
pub struct HandleLock<'a> {
    handle: &'a mut dyn FileHandle,
}

impl<'a> HandleLock<'a> {
    /// Lock `handle` with `kind` (shared or exclusive).
    pub fn acquire(handle: &'a mut dyn FileHandle, kind: LockKind) -> Result<Self, StorageError> {
        handle.lock(kind)?;
        Ok(Self { handle })
    }
}

impl<'a> Deref for HandleLock<'a> {
    type Target = dyn FileHandle + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.handle
    }
}

impl DerefMut for HandleLock<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.handle
    }
}

impl Drop for HandleLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.flush() {
            tracing::warn!(error = %e, "Failed to flush before unlocking");
        }
        if let Err(e) = self.handle.lock(LockKind::Unlock) {
            tracing::warn!(error = %e, "Failed to release lock");
        }
    }
}
