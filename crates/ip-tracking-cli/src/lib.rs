//! # ip-tracking-cli
//!
//! Command-line administration for `ip-tracking`.
//!
//! Provides commands for:
//! - Deny-list administration (`block`, `unblock`, `blocked`)
//! - One-shot and periodic anomaly scans (`scan`, `watch`)
//! - Inspecting flags and the request log (`flags`, `requests`)
//!
//! All commands operate on a [`FileStore`] directory, so they see the same
//! data as a service that records into it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

use std::path::Path;

use ip_tracking::{FileStore, TrackingConfig};

pub use cli::{Cli, Commands, Format, RequestsArgs};
pub use error::CliError;
pub use output::OutputFormat;

/// Load configuration from `path`, or defaults when no path is given.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(path: Option<&Path>) -> Result<TrackingConfig, CliError> {
    match path {
        Some(path) => TrackingConfig::from_json_file(path).map_err(|e| {
            CliError::Config(format!("failed to load {}: {e}", path.display()))
        }),
        None => Ok(TrackingConfig::default()),
    }
}

/// Open the store in `data_dir`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn open_store(data_dir: &Path) -> Result<FileStore, CliError> {
    Ok(FileStore::open(data_dir)?)
}
