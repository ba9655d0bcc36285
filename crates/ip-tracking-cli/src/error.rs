//! CLI error types.

use ip_tracking::TrackingError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// A tracking operation failed.
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
