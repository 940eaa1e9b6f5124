use fpc_storage::StorageError;

/// Errors from health and backlog files.
#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid backlog entry: {0}")]
    Entry(String),

    #[error("Failed to encode backlog entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Backlog file was removed during each of {attempts} append attempts")]
    Contended { attempts: u32 },

    /// Replay kept failing for longer than the backlog may live. Needs an
    /// operator to purge the cache and delete the backlog.
    #[error("Backlog replay did not complete within {ttl} seconds")]
    ReplayTimeout { ttl: u64 },
}
