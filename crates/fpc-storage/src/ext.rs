//! Extension trait for [`Storage`] with typed convenience methods.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::document::CacheDocument;
use crate::storage::{Storage, StorageError, StorageErrorKind};

/// Typed convenience methods for [`Storage`].
///
/// Provides `read_document`/`write_document` for header-block cache files and
/// `read_json`/`write_json` for the small state files (health status, time
/// marks, site config). These are default methods on an extension trait so
/// that:
///
/// - [`Storage`] stays object-safe with no serde dependency in its signature
/// - Backends only need to handle raw bytes
/// - Callers get typed access on `&dyn Storage` via the blanket impl
pub trait StorageExt: Storage {
    /// Read and split a cache file.
    fn read_document(&self, path: &Path) -> Result<CacheDocument, StorageError> {
        let raw = self.read(path)?;
        Ok(CacheDocument::from_bytes(&raw))
    }

    /// Write a cache file.
    fn write_document(&self, path: &Path, document: &CacheDocument) -> Result<(), StorageError> {
        self.write(path, &document.to_bytes())
    }

    /// Read a JSON file.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let raw = match self.read(path) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            StorageError::new(StorageErrorKind::Other)
                .with_path(path)
                .with_source(e)
        })
    }

    /// Write a value as JSON.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(value).map_err(|e| {
            StorageError::new(StorageErrorKind::Other)
                .with_path(path)
                .with_source(e)
        })?;
        self.write(path, &raw)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{FsStorage, HeaderBlock};

    #[test]
    fn test_document_through_dyn_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage: Box<dyn Storage> = Box::new(FsStorage::new(temp_dir.path().to_path_buf()));
        let doc = CacheDocument::new(HeaderBlock::new().with("x-nitro-rev", "r1"), "<p>hi</p>");

        storage
            .write_document(Path::new("a/b.html"), &doc)
            .unwrap();
        let read = storage.read_document(Path::new("a/b.html")).unwrap();

        assert_eq!(read.headers.get("x-nitro-rev"), Some("r1"));
        assert_eq!(read.body, b"<p>hi</p>");
    }

    #[test]
    fn test_json_missing_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path().to_path_buf());

        let value: Option<BTreeMap<String, u64>> =
            storage.read_json(Path::new("time.mark")).unwrap();

        assert!(value.is_none());
    }

    #[test]
    fn test_json_write_then_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path().to_path_buf());
        let marks = BTreeMap::from([("service-status".to_owned(), 1000_u64)]);

        storage.write_json(Path::new("time.mark"), &marks).unwrap();
        let read: Option<BTreeMap<String, u64>> = storage.read_json(Path::new("time.mark")).unwrap();

        assert_eq!(read, Some(marks));
    }

    #[test]
    fn test_json_invalid_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path().to_path_buf());
        storage.write(Path::new("time.mark"), b"{not json").unwrap();

        let result: Result<Option<BTreeMap<String, u64>>, _> =
            storage.read_json(Path::new("time.mark"));

        assert!(result.is_err());
    }
}
