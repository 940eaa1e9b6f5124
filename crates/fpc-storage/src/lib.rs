//! Storage abstraction for the full-page cache client.
//!
//! Every component above this crate talks to the cache directory through the
//! [`Storage`] trait. Two capabilities are exposed:
//!
//! - whole-file operations (`read`, `write`, `rename`, `delete`, directory
//!   enumeration, `mtime`/`touch`) used by page cache entries and purges
//! - sequential [`FileHandle`]s with advisory locking, used by the backlog
//!   queue and the page-cache write lock
//!
//! Paths are always relative to the backend root and may not contain `..`.
//!
//! # Example
//!
//! ```ignore
//! use std::path::{Path, PathBuf};
//! use fpc_storage::{FsStorage, Storage, StorageExt};
//!
//! let storage = FsStorage::new(PathBuf::from("/var/cache/fpc"));
//! let document = storage.read_document(Path::new("pagecache/desktop/abc/ssl-.html"))?;
//! println!("{:?}", document.headers.get("x-cache-ctime"));
//! ```

mod clock;
mod document;
mod ext;
mod fs;
mod handle;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{CacheDocument, HeaderBlock};
pub use ext::StorageExt;
pub use fs::FsStorage;
pub use handle::{FileHandle, HandleLock, LockKind, OpenMode};
pub use storage::{Storage, StorageError, StorageErrorKind, validate_path};
