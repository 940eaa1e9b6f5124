use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fpc_storage::{FileHandle, OpenMode, Storage, StorageError, StorageErrorKind, validate_path};

use crate::handle::KvHandle;
use crate::store::KvStore;

pub(crate) const BACKEND: &str = "Kv";

const SELF_CTIME: &str = "::self::ctime::";
const CONTENT: &str = "::content::";
const MTIME: &str = "::mtime::";

/// Lock key time-to-live.
const LOCK_TTL: Duration = Duration::from_secs(30);
/// How long to wait for a lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(50);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Directory tree emulated over a [`KvStore`].
///
/// All keys live under `namespace`, so one store can hold several caches.
pub struct KvStorage<S> {
    store: Arc<S>,
    namespace: String,
    lock_timeout: Duration,
}

impl<S: KvStore + 'static> KvStorage<S> {
    /// Create a storage whose root directory is the key `namespace`.
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override how long `lock` waits before failing.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn key(&self, path: &Path) -> Result<String, StorageError> {
        validate_path(path, BACKEND)?;
        let parts: Vec<_> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            Ok(self.namespace.clone())
        } else {
            Ok(format!("{}/{}", self.namespace, parts.join("/")))
        }
    }

    /// Split into (parent directory key, entry name).
    fn entry(&self, path: &Path) -> Result<(String, String), StorageError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StorageError::new(StorageErrorKind::InvalidPath)
                    .with_path(path)
                    .with_backend(BACKEND)
            })?;
        let parent = path.parent().unwrap_or(Path::new(""));
        Ok((self.key(parent)?, name))
    }

    fn relative(&self, key: &str) -> PathBuf {
        key.strip_prefix(&self.namespace)
            .map(|rest| rest.trim_start_matches('/'))
            .map_or_else(|| PathBuf::from(key), PathBuf::from)
    }

    fn is_dir_key(&self, key: &str, path: &Path) -> Result<bool, StorageError> {
        Ok(self
            .store
            .hlen(key)
            .map_err(|e| e.into_storage(path))?
            > 0)
    }

    fn register_child(&self, parent_key: &str, name: &str, mtime: u64, path: &Path) -> Result<(), StorageError> {
        self.store
            .hset(parent_key, &format!("{MTIME}{name}"), mtime.to_string().as_bytes())
            .and_then(|()| self.store.hset_nx(parent_key, &format!("{CONTENT}{name}"), b"").map(|_| ()))
            .map_err(|e| e.into_storage(path))
    }

    fn unregister_child(&self, parent_key: &str, name: &str, path: &Path) -> Result<usize, StorageError> {
        self.store
            .hdel(parent_key, &[&format!("{CONTENT}{name}"), &format!("{MTIME}{name}")])
            .map_err(|e| e.into_storage(path))
    }

    /// Set content and mtime of a file in one directory hash.
    pub(crate) fn put(&self, path: &Path, data: &[u8], mtime: u64) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            self.create_dir(parent)?;
        }
        let (dir, name) = self.entry(path)?;
        if self.is_dir_key(&self.key(path)?, path)? {
            return Err(StorageError::new(StorageErrorKind::AlreadyExists)
                .with_path(path)
                .with_backend(BACKEND));
        }
        self.store
            .hset(&dir, &format!("{CONTENT}{name}"), data)
            .and_then(|()| self.store.hset(&dir, &format!("{MTIME}{name}"), mtime.to_string().as_bytes()))
            .map_err(|e| e.into_storage(path))
    }

    pub(crate) fn acquire_lock(&self, path: &Path) -> Result<(), StorageError> {
        let key = format!("lock:{}", self.key(path)?);
        let start = Instant::now();
        loop {
            let acquired = self
                .store
                .set_nx_px(&key, unix_now().to_string().as_bytes(), LOCK_TTL)
                .map_err(|e| e.into_storage(path))?;
            if acquired {
                return Ok(());
            }
            if start.elapsed() >= self.lock_timeout {
                return Err(StorageError::new(StorageErrorKind::LockTimeout)
                    .with_path(path)
                    .with_backend(BACKEND));
            }
            std::thread::sleep(LOCK_POLL);
        }
    }

    pub(crate) fn release_lock(&self, path: &Path) -> Result<(), StorageError> {
        let key = format!("lock:{}", self.key(path)?);
        self.store
            .del(&key)
            .map(|_| ())
            .map_err(|e| e.into_storage(path))
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from_key = self.key(from)?;
        let to_key = self.key(to)?;
        if self.is_dir_key(&to_key, to)? {
            return Err(StorageError::new(StorageErrorKind::AlreadyExists)
                .with_path(to)
                .with_backend(BACKEND));
        }

        let (from_parent, from_name) = self.entry(from)?;
        let mtime = self.mtime(from).unwrap_or_else(|_| unix_now());
        self.unregister_child(&from_parent, &from_name, from)?;

        let descendants = self
            .store
            .keys_with_prefix(&format!("{from_key}/"))
            .map_err(|e| e.into_storage(from))?;
        self.store
            .rename(&from_key, &to_key)
            .map_err(|e| e.into_storage(from))?;
        for key in descendants {
            let moved = format!("{to_key}{}", &key[from_key.len()..]);
            self.store
                .rename(&key, &moved)
                .map_err(|e| e.into_storage(from))?;
        }

        if let Some(parent) = to.parent() {
            self.create_dir(parent)?;
        }
        let (to_parent, to_name) = self.entry(to)?;
        self.register_child(&to_parent, &to_name, mtime, to)
    }
}

impl<S: KvStore + 'static> Storage for KvStorage<S> {
    fn exists(&self, path: &Path) -> bool {
        let result = (|| {
            let key = self.key(path)?;
            if self.is_dir_key(&key, path)? {
                return Ok(true);
            }
            let (dir, name) = self.entry(path)?;
            self.store
                .hexists(&dir, &format!("{MTIME}{name}"))
                .map_err(|e| e.into_storage(path))
        })();
        result.unwrap_or_else(|e: StorageError| {
            tracing::debug!(error = %e, "exists check failed");
            false
        })
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.key(path)
            .and_then(|key| self.is_dir_key(&key, path))
            .unwrap_or(false)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        if self.is_dir(path) {
            return Err(StorageError::new(StorageErrorKind::InvalidPath)
                .with_path(path)
                .with_backend(BACKEND));
        }
        let (dir, name) = self.entry(path)?;
        self.store
            .hget(&dir, &format!("{CONTENT}{name}"))
            .map_err(|e| e.into_storage(path))?
            .ok_or_else(|| StorageError::not_found(path).with_backend(BACKEND))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        self.put(path, data, unix_now())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        if self.is_dir(from) {
            return self.rename_dir(from, to);
        }
        let content = self.read(from)?;
        let mtime = self.mtime(from)?;
        self.put(to, &content, mtime)?;
        self.delete(from)
    }

    fn delete(&self, path: &Path) -> Result<(), StorageError> {
        if self.is_dir(path) {
            return Err(StorageError::new(StorageErrorKind::InvalidPath)
                .with_path(path)
                .with_backend(BACKEND));
        }
        let (dir, name) = self.entry(path)?;
        self.unregister_child(&dir, &name, path)?;
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        let now = unix_now();
        let mut current = path.to_path_buf();
        loop {
            let key = self.key(&current)?;
            if self.is_dir_key(&key, &current)? {
                return Ok(());
            }
            self.store
                .hset(&key, SELF_CTIME, now.to_string().as_bytes())
                .map_err(|e| e.into_storage(&current))?;

            let Some(parent) = current.parent() else {
                return Ok(());
            };
            if current.file_name().is_none() {
                return Ok(());
            }
            let (parent_key, name) = self.entry(&current)?;
            self.register_child(&parent_key, &name, now, &current)?;
            current = parent.to_path_buf();
        }
    }

    fn delete_dir(&self, path: &Path) -> Result<(), StorageError> {
        let key = self.key(path)?;
        if !self.is_dir_key(&key, path)? {
            return Ok(());
        }
        let descendants = self
            .store
            .keys_with_prefix(&format!("{key}/"))
            .map_err(|e| e.into_storage(path))?;
        for descendant in descendants {
            self.store
                .del(&descendant)
                .map_err(|e| e.into_storage(path))?;
        }
        self.store.del(&key).map_err(|e| e.into_storage(path))?;
        if path.file_name().is_some() {
            let (parent, name) = self.entry(path)?;
            self.unregister_child(&parent, &name, path)?;
        }
        Ok(())
    }

    fn is_empty_dir(&self, path: &Path) -> Result<bool, StorageError> {
        let key = self.key(path)?;
        match self.store.hlen(&key).map_err(|e| e.into_storage(path))? {
            0 => Err(StorageError::not_found(path).with_backend(BACKEND)),
            len => Ok(len <= 1),
        }
    }

    fn for_each_entry(
        &self,
        dir: &Path,
        f: &mut dyn FnMut(&Path) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let key = self.key(dir)?;
        let mut paths: Vec<PathBuf> = self
            .store
            .hkeys(&key)
            .map_err(|e| e.into_storage(dir))?
            .into_iter()
            .filter_map(|field| {
                field
                    .strip_prefix(MTIME)
                    .map(|name| self.relative(&format!("{key}/{name}")))
            })
            .collect();
        paths.sort();

        for path in &paths {
            f(path)?;
        }
        Ok(())
    }

    fn mtime(&self, path: &Path) -> Result<u64, StorageError> {
        let (dir, name) = self.entry(path)?;
        let raw = self
            .store
            .hget(&dir, &format!("{MTIME}{name}"))
            .map_err(|e| e.into_storage(path))?
            .ok_or_else(|| StorageError::not_found(path).with_backend(BACKEND))?;
        String::from_utf8_lossy(&raw).trim().parse().map_err(|e| {
            StorageError::new(StorageErrorKind::Other)
                .with_path(path)
                .with_backend(BACKEND)
                .with_source(e)
        })
    }

    fn touch(&self, path: &Path, time: Option<u64>) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            self.create_dir(parent)?;
        }
        let (dir, name) = self.entry(path)?;
        self.register_child(&dir, &name, time.unwrap_or_else(unix_now), path)
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>, StorageError> {
        let content = match mode {
            OpenMode::Read => self.read(path)?,
            OpenMode::ReadWrite => match self.read(path) {
                Ok(content) => content,
                Err(e) if e.is_not_found() => {
                    self.put(path, b"", unix_now())?;
                    Vec::new()
                }
                Err(e) => return Err(e),
            },
            OpenMode::Truncate => {
                self.put(path, b"", unix_now())?;
                Vec::new()
            }
        };
        Ok(Box::new(KvHandle::new(
            self.clone_shared(),
            path.to_path_buf(),
            content,
            mode != OpenMode::Read,
        )))
    }
}

impl<S> KvStorage<S> {
    fn clone_shared(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;
    use fpc_storage::{HandleLock, LockKind, StorageExt};
    use pretty_assertions::assert_eq;
    use std::io::SeekFrom;

    fn create_storage() -> KvStorage<MemoryKv> {
        KvStorage::new(Arc::new(MemoryKv::new()), "fpc")
    }

    #[test]
    fn test_write_registers_directories() {
        let storage = create_storage();

        storage
            .write(Path::new("pagecache/desktop/abc/ssl-.html"), b"x")
            .unwrap();

        assert!(storage.is_dir(Path::new("pagecache")));
        assert!(storage.is_dir(Path::new("pagecache/desktop/abc")));
        assert!(storage.exists(Path::new("pagecache/desktop/abc")));
        assert!(storage.exists(Path::new("pagecache/desktop/abc/ssl-.html")));
        assert_eq!(
            storage
                .read(Path::new("pagecache/desktop/abc/ssl-.html"))
                .unwrap(),
            b"x"
        );
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let storage = create_storage();

        let err = storage.read(Path::new("nope.html")).unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.backend, Some("Kv"));
    }

    #[test]
    fn test_for_each_entry_lists_files_and_dirs() {
        let storage = create_storage();
        storage.write(Path::new("dir/b.html"), b"").unwrap();
        storage.write(Path::new("dir/a.html"), b"").unwrap();
        storage.create_dir(Path::new("dir/sub_i")).unwrap();

        let mut seen = Vec::new();
        storage
            .for_each_entry(Path::new("dir"), &mut |p| {
                seen.push(p.to_path_buf());
                Ok(())
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                PathBuf::from("dir/a.html"),
                PathBuf::from("dir/b.html"),
                PathBuf::from("dir/sub_i"),
            ]
        );
    }

    #[test]
    fn test_delete_and_empty_dir() {
        let storage = create_storage();
        storage.write(Path::new("dir/a.html"), b"x").unwrap();

        assert!(!storage.is_empty_dir(Path::new("dir")).unwrap());
        storage.delete(Path::new("dir/a.html")).unwrap();
        storage.delete(Path::new("dir/a.html")).unwrap();

        assert!(storage.is_empty_dir(Path::new("dir")).unwrap());
        assert!(!storage.exists(Path::new("dir/a.html")));
    }

    #[test]
    fn test_rename_file_keeps_mtime() {
        let storage = create_storage();
        storage.write(Path::new("d/a.html"), b"fresh").unwrap();
        storage.touch(Path::new("d/a.html"), Some(1000)).unwrap();

        storage
            .rename(Path::new("d/a.html"), Path::new("d_i/a.html.stale"))
            .unwrap();

        assert!(!storage.exists(Path::new("d/a.html")));
        assert_eq!(storage.read(Path::new("d_i/a.html.stale")).unwrap(), b"fresh");
        assert_eq!(storage.mtime(Path::new("d_i/a.html.stale")).unwrap(), 1000);
    }

    #[test]
    fn test_rename_dir_moves_descendants() {
        let storage = create_storage();
        storage
            .write(Path::new("pagecache/desktop/abc/x.html"), b"1")
            .unwrap();

        storage
            .rename(Path::new("pagecache"), Path::new("pagecache.stale.1"))
            .unwrap();

        assert!(!storage.exists(Path::new("pagecache")));
        assert_eq!(
            storage
                .read(Path::new("pagecache.stale.1/desktop/abc/x.html"))
                .unwrap(),
            b"1"
        );
        let mut root = Vec::new();
        storage
            .for_each_entry(Path::new(""), &mut |p| {
                root.push(p.to_path_buf());
                Ok(())
            })
            .unwrap();
        assert_eq!(root, vec![PathBuf::from("pagecache.stale.1")]);
    }

    #[test]
    fn test_rename_dir_onto_existing_fails() {
        let storage = create_storage();
        storage.create_dir(Path::new("a")).unwrap();
        storage.create_dir(Path::new("b")).unwrap();

        let err = storage.rename(Path::new("a"), Path::new("b")).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::AlreadyExists);
    }

    #[test]
    fn test_delete_dir_removes_tree() {
        let storage = create_storage();
        storage.write(Path::new("p/a/b/c.html"), b"1").unwrap();
        storage.write(Path::new("q.html"), b"1").unwrap();

        storage.delete_dir(Path::new("p")).unwrap();

        assert!(!storage.exists(Path::new("p")));
        assert!(!storage.exists(Path::new("p/a/b/c.html")));
        assert!(storage.exists(Path::new("q.html")));
    }

    #[test]
    fn test_touch_dir_sets_mtime() {
        let storage = create_storage();
        storage.create_dir(Path::new("d/abc_i")).unwrap();

        storage.touch(Path::new("d/abc_i"), Some(4242)).unwrap();

        assert!(storage.is_dir(Path::new("d/abc_i")));
        assert_eq!(storage.mtime(Path::new("d/abc_i")).unwrap(), 4242);
    }

    #[test]
    fn test_document_round_trip_through_ext() {
        let storage = create_storage();
        let doc = fpc_storage::CacheDocument::new(
            fpc_storage::HeaderBlock::new().with("x-cache-ctime", "1000"),
            "<html>OK</html>",
        );

        storage.write_document(Path::new("d/a.html"), &doc).unwrap();

        assert_eq!(
            storage
                .read_document(Path::new("d/a.html"))
                .unwrap()
                .headers
                .get_u64("x-cache-ctime"),
            Some(1000)
        );
    }

    #[test]
    fn test_handle_append_visible_after_flush() {
        let storage = create_storage();

        let mut handle = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();
        {
            let mut locked = HandleLock::acquire(handle.as_mut(), LockKind::Exclusive).unwrap();
            locked.seek(SeekFrom::End(0)).unwrap();
            locked.write(b"line one\n").unwrap();
        }

        let mut other = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();
        {
            let mut locked = HandleLock::acquire(other.as_mut(), LockKind::Exclusive).unwrap();
            locked.seek(SeekFrom::End(0)).unwrap();
            locked.write(b"line two\n").unwrap();
        }

        // The first handle reloads under lock and sees the second append.
        let mut locked = HandleLock::acquire(handle.as_mut(), LockKind::Exclusive).unwrap();
        locked.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(locked.read_line().unwrap(), Some(b"line one".to_vec()));
        assert_eq!(locked.read_line().unwrap(), Some(b"line two".to_vec()));
        assert!(locked.eof().unwrap());
    }

    #[test]
    fn test_lock_times_out_when_held() {
        let storage = create_storage().with_lock_timeout(Duration::from_millis(120));
        let mut first = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();
        let mut second = storage.open(Path::new("q"), OpenMode::ReadWrite).unwrap();

        first.lock(LockKind::Exclusive).unwrap();
        let err = second.lock(LockKind::Exclusive).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::LockTimeout);
        first.lock(LockKind::Unlock).unwrap();
        assert!(second.lock(LockKind::Exclusive).is_ok());
    }
}
