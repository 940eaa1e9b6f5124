use fpc_storage::StorageError;

/// Errors from page cache operations.
#[derive(Debug, thiserror::Error)]
pub enum PageCacheError {
    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The referrer normalizes to the entry's own URL.
    #[error("Page {0} cannot be its own referrer")]
    SelfReferral(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Compression failed: {0}")]
    Compress(#[from] std::io::Error),
}
