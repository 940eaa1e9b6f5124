//! CLI error types.

use fpc_backlog::BacklogError;
use fpc_config::ConfigError;
use fpc_core::CoreError;

/// CLI error type.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("{0}")]
    Backlog(#[from] BacklogError),

    #[error("{0}")]
    Validation(String),
}
