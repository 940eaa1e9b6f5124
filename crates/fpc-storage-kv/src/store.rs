use std::time::Duration;

use fpc_storage::{StorageError, StorageErrorKind};

/// Key-value store errors.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A hash command hit a plain key or the other way round.
    #[error("wrong value type for key {0}")]
    WrongType(String),
}

impl KvError {
    pub(crate) fn into_storage(self, path: impl Into<std::path::PathBuf>) -> StorageError {
        let kind = match self {
            Self::Unavailable(_) => StorageErrorKind::Unavailable,
            Self::WrongType(_) => StorageErrorKind::Other,
        };
        StorageError::new(kind)
            .with_path(path)
            .with_backend(crate::storage::BACKEND)
            .with_source(self)
    }
}

/// The hash and string primitives the directory emulation needs.
///
/// Semantics follow Redis: hash commands on a missing key behave as on an
/// empty hash, and a hash key disappears when its last field is deleted.
pub trait KvStore: Send + Sync {
    /// `HGET key field`.
    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// `HSET key field value`.
    fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), KvError>;

    /// `HSETNX key field value`. Returns whether the field was set.
    fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, KvError>;

    /// `HDEL key field...`. Returns the number of fields removed.
    fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize, KvError>;

    /// `HEXISTS key field`.
    fn hexists(&self, key: &str, field: &str) -> Result<bool, KvError>;

    /// `HLEN key`.
    fn hlen(&self, key: &str) -> Result<usize, KvError>;

    /// `HKEYS key`.
    fn hkeys(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// `DEL key`. Returns whether something was removed.
    fn del(&self, key: &str) -> Result<bool, KvError>;

    /// `RENAME from to`, replacing `to`.
    fn rename(&self, from: &str, to: &str) -> Result<(), KvError>;

    /// All keys starting with `prefix` (`SCAN MATCH prefix*`).
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// `SET key value NX PX ttl`. Returns whether the key was set.
    fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, KvError>;
}
