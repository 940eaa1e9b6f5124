//! Local filesystem backend.

use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use crate::handle::{FileHandle, LockKind, OpenMode};
use crate::storage::{Storage, StorageError, validate_path};

const BACKEND: &str = "Fs";
const LINE_CHUNK: usize = 4096;

/// Filesystem storage rooted at one directory.
///
/// Whole-file writes go through a temporary file in the target directory and
/// are renamed into place, so concurrent readers see either the old or the new
/// content.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create a storage rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, StorageError> {
        validate_path(path, BACKEND)?;
        Ok(self.root.join(path))
    }

    fn io_err(err: std::io::Error, path: &Path) -> StorageError {
        StorageError::io(err, Some(path.to_path_buf())).with_backend(BACKEND)
    }

    fn relative(&self, full: &Path) -> PathBuf {
        full.strip_prefix(&self.root)
            .map_or_else(|_| full.to_path_buf(), Path::to_path_buf)
    }
}

impl Storage for FsStorage {
    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_ok_and(|p| p.exists())
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.resolve(path).is_ok_and(|p| p.is_dir())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| Self::io_err(e, path))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let parent = full.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| Self::io_err(e, path))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Self::io_err(e, path))?;
        temp.write_all(data).map_err(|e| Self::io_err(e, path))?;
        temp.persist(&full).map_err(|e| Self::io_err(e.error, path))?;

        tracing::trace!(path = %path.display(), bytes = data.len(), "Wrote file");
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(e, to))?;
        }
        fs::rename(&src, &dst).map_err(|e| Self::io_err(e, from))
    }

    fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(e, path)),
        }
    }

    fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full).map_err(|e| Self::io_err(e, path))
    }

    fn delete_dir(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_dir_all(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(e, path)),
        }
    }

    fn is_empty_dir(&self, path: &Path) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        let mut entries = fs::read_dir(&full).map_err(|e| Self::io_err(e, path))?;
        Ok(entries.next().is_none())
    }

    fn for_each_entry(
        &self,
        dir: &Path,
        f: &mut dyn FnMut(&Path) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let full = self.resolve(dir)?;
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Self::io_err(e, dir)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(e, dir))?;
            paths.push(self.relative(&entry.path()));
        }
        paths.sort();

        for path in &paths {
            f(path)?;
        }
        Ok(())
    }

    fn mtime(&self, path: &Path) -> Result<u64, StorageError> {
        let full = self.resolve(path)?;
        let modified = fs::metadata(&full)
            .and_then(|m| m.modified())
            .map_err(|e| Self::io_err(e, path))?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()))
    }

    fn touch(&self, path: &Path, time: Option<u64>) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let when = time.map_or_else(SystemTime::now, |secs| {
            UNIX_EPOCH + Duration::from_secs(secs)
        });

        if !full.exists() {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(|e| Self::io_err(e, path))?;
            }
            File::create(&full).map_err(|e| Self::io_err(e, path))?;
        }

        // Opening read-only works for directories too.
        let file = File::open(&full).map_err(|e| Self::io_err(e, path))?;
        file.set_times(FileTimes::new().set_modified(when).set_accessed(when))
            .map_err(|e| Self::io_err(e, path))
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>, StorageError> {
        let full = self.resolve(path)?;
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true).create(true).truncate(false);
            }
            OpenMode::Truncate => {
                options.read(true).write(true).create(true).truncate(true);
            }
        }
        if mode != OpenMode::Read
            && let Some(parent) = full.parent()
        {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(e, path))?;
        }

        let file = options.open(&full).map_err(|e| Self::io_err(e, path))?;
        Ok(Box::new(FsHandle {
            file,
            path: path.to_path_buf(),
        }))
    }
}

/// Handle over an open file. Locks are `flock`-style via `fs2`.
struct FsHandle {
    file: File,
    path: PathBuf,
}

impl FileHandle for FsHandle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        self.file.seek(pos).map_err(|e| FsStorage::io_err(e, &self.path))
    }

    fn tell(&mut self) -> Result<u64, StorageError> {
        self.file.stream_position().map_err(|e| FsStorage::io_err(e, &self.path))
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::with_capacity(len);
        (&mut self.file)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| FsStorage::io_err(e, &self.path))?;
        Ok(buf)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let start = self.tell()?;
        let mut line = Vec::new();
        let mut chunk = [0_u8; LINE_CHUNK];

        loop {
            let n = self.file.read(&mut chunk).map_err(|e| FsStorage::io_err(e, &self.path))?;
            if n == 0 {
                return Ok((!line.is_empty()).then_some(line));
            }
            if let Some(i) = chunk[..n].iter().position(|b| *b == b'\n') {
                line.extend_from_slice(&chunk[..i]);
                let consumed = line.len() as u64 + 1;
                self.seek(SeekFrom::Start(start + consumed))?;
                return Ok(Some(line));
            }
            line.extend_from_slice(&chunk[..n]);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(data).map_err(|e| FsStorage::io_err(e, &self.path))
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush().map_err(|e| FsStorage::io_err(e, &self.path))
    }

    fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        self.file.set_len(len).map_err(|e| FsStorage::io_err(e, &self.path))
    }

    fn lock(&mut self, kind: LockKind) -> Result<(), StorageError> {
        let result = match kind {
            LockKind::Shared => FileExt::lock_shared(&self.file),
            LockKind::Exclusive => FileExt::lock_exclusive(&self.file),
            LockKind::Unlock => FileExt::unlock(&self.file),
        };
        result.map_err(|e| FsStorage::io_err(e, &self.path))
    }

    fn eof(&mut self) -> Result<bool, StorageError> {
        let pos = self.tell()?;
        let len = self.file.metadata().map_err(|e| FsStorage::io_err(e, &self.path))?.len();
        Ok(pos >= len)
    }

    fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        self.flush()?;
        FileExt::unlock(&self.file).map_err(|e| FsStorage::io_err(e, &self.path))
    }
}
