use fpc_api::ApiError;
use fpc_backlog::BacklogError;
use fpc_config::ConfigError;
use fpc_pagecache::PageCacheError;
use fpc_storage::StorageError;

/// Errors from sessions and purges.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A cache directory could not be renamed, created or removed. The purge
    /// stops rather than leave the cache half moved.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    PageCache(#[from] PageCacheError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Backlog(#[from] BacklogError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
