use std::io::SeekFrom;
use std::path::PathBuf;

use fpc_storage::{FileHandle, LockKind, StorageError, StorageErrorKind};

use crate::storage::KvStorage;
use crate::store::KvStore;

/// Buffered handle over one emulated file.
///
/// The whole value is held in memory. Acquiring a lock reloads it so appends
/// made by other handles are visible; `flush` writes the buffer back as one
/// value.
pub(crate) struct KvHandle<S> {
    storage: KvStorage<S>,
    path: PathBuf,
    content: Vec<u8>,
    pos: u64,
    writable: bool,
    dirty: bool,
    locked: bool,
}

impl<S: KvStore + 'static> KvHandle<S> {
    pub(crate) fn new(storage: KvStorage<S>, path: PathBuf, content: Vec<u8>, writable: bool) -> Self {
        Self {
            storage,
            path,
            content,
            pos: 0,
            writable,
            dirty: false,
            locked: false,
        }
    }

    fn reload(&mut self) -> Result<(), StorageError> {
        if self.dirty {
            return Ok(());
        }
        match fpc_storage::Storage::read(&self.storage, &self.path) {
            Ok(content) => self.content = content,
            Err(e) if e.is_not_found() => self.content.clear(),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn position(&self) -> usize {
        usize::try_from(self.pos).unwrap_or(usize::MAX)
    }
}

impl<S: KvStore + 'static> FileHandle for KvHandle<S> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let len = i64::try_from(self.content.len()).unwrap_or(i64::MAX);
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).unwrap_or(i64::MAX),
            SeekFrom::End(delta) => len + delta,
            SeekFrom::Current(delta) => self.pos.cast_signed() + delta,
        };
        if target < 0 {
            return Err(StorageError::new(StorageErrorKind::InvalidPath)
                .with_path(&self.path)
                .with_backend(crate::storage::BACKEND));
        }
        self.pos = target.cast_unsigned();
        Ok(self.pos)
    }

    fn tell(&mut self) -> Result<u64, StorageError> {
        Ok(self.pos)
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, StorageError> {
        let start = self.position().min(self.content.len());
        let end = start.saturating_add(len).min(self.content.len());
        self.pos = end as u64;
        Ok(self.content[start..end].to_vec())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let start = self.position();
        if start >= self.content.len() {
            return Ok(None);
        }
        let rest = &self.content[start..];
        let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
            Some(i) => (rest[..i].to_vec(), i + 1),
            None => (rest.to_vec(), rest.len()),
        };
        self.pos = (start + consumed) as u64;
        Ok(Some(line))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if !self.writable {
            return Err(StorageError::new(StorageErrorKind::PermissionDenied)
                .with_path(&self.path)
                .with_backend(crate::storage::BACKEND));
        }
        let start = self.position();
        if start > self.content.len() {
            self.content.resize(start, 0);
        }
        let end = start + data.len();
        if end > self.content.len() {
            self.content.resize(end, 0);
        }
        self.content[start..end].copy_from_slice(data);
        self.pos = end as u64;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        fpc_storage::Storage::write(&self.storage, &self.path, &self.content)?;
        self.dirty = false;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        self.content
            .truncate(usize::try_from(len).unwrap_or(usize::MAX));
        self.dirty = true;
        Ok(())
    }

    fn lock(&mut self, kind: LockKind) -> Result<(), StorageError> {
        match kind {
            LockKind::Exclusive => {
                self.storage.acquire_lock(&self.path)?;
                self.locked = true;
                self.reload()
            }
            // Waits for a writer to finish, then lets go right away.
            LockKind::Shared => {
                self.storage.acquire_lock(&self.path)?;
                let reloaded = self.reload();
                self.storage.release_lock(&self.path)?;
                reloaded
            }
            LockKind::Unlock => {
                self.flush()?;
                if self.locked {
                    self.locked = false;
                    self.storage.release_lock(&self.path)?;
                }
                Ok(())
            }
        }
    }

    fn eof(&mut self) -> Result<bool, StorageError> {
        Ok(self.position() >= self.content.len())
    }

    fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        self.lock(LockKind::Unlock)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use fpc_storage::{OpenMode, Storage};

    use crate::{KvStorage, MemoryKv};

    use super::*;

    #[test]
    fn test_overwrite_in_place() {
        let storage = KvStorage::new(Arc::new(MemoryKv::new()), "fpc");
        storage.write(Path::new("q"), b"0123456789").unwrap();

        let mut handle = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();
        handle.seek(SeekFrom::Start(2)).unwrap();
        handle.write(b"ab").unwrap();
        handle.close().unwrap();

        assert_eq!(storage.read(Path::new("q")).unwrap(), b"01ab456789");
    }

    #[test]
    fn test_read_only_handle_rejects_write() {
        let storage = KvStorage::new(Arc::new(MemoryKv::new()), "fpc");
        storage.write(Path::new("q"), b"x").unwrap();

        let mut handle = storage.open(Path::new("q"), OpenMode::Read).unwrap();

        assert!(handle.write(b"y").is_err());
    }

    #[test]
    fn test_truncate_then_flush() {
        let storage = KvStorage::new(Arc::new(MemoryKv::new()), "fpc");
        storage.write(Path::new("q"), b"counter:12").unwrap();

        let mut handle = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();
        handle.truncate(0).unwrap();
        handle.seek(SeekFrom::Start(0)).unwrap();
        handle.write(b"3").unwrap();
        handle.flush().unwrap();

        assert_eq!(storage.read(Path::new("q")).unwrap(), b"3");
    }

    #[test]
    fn test_seek_before_start_fails() {
        let storage = KvStorage::new(Arc::new(MemoryKv::new()), "fpc");
        let mut handle = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();

        assert!(handle.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(handle.seek(SeekFrom::End(0)).unwrap(), 0);
    }
}
