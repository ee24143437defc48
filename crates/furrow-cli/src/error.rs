use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] furrow_core::Error),
    #[error(transparent)]
    Config(#[from] furrow_core::ConfigError),
    #[error(transparent)]
    Remote(#[from] furrow_core::sync::RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{flag} must be {expected}")]
    InvalidJson {
        flag: &'static str,
        expected: &'static str,
    },
    #[error("Conflict not found or already resolved: {0}")]
    ConflictNotResolvable(String),
    #[error("Remote store is not configured. Set FURROW_REMOTE_URL (and FURROW_REMOTE_TOKEN) to sync.")]
    RemoteNotConfigured,
}
