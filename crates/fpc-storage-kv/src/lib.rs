//! Key-value backend for [`fpc_storage::Storage`].
//!
//! Emulates a directory tree on top of a hash-capable key-value store so that
//! several web servers can share one page cache:
//!
//! - every directory is a hash key named by its path
//! - a directory hash holds `::self::ctime::` plus, per child,
//!   `::content::<name>` and `::mtime::<name>` fields
//! - subdirectories are registered in their parent like files, so listing
//!   a directory only reads one hash
//! - advisory locks are `lock:<path>` keys set with NX and a TTL
//!
//! [`MemoryKv`] is an in-process store for tests and single-node setups.
//! Anything speaking the same primitives (a Redis client, for instance) can
//! implement [`KvStore`].

mod handle;
mod memory;
mod storage;
mod store;

pub use memory::MemoryKv;
pub use storage::KvStorage;
pub use store::{KvError, KvStore};
