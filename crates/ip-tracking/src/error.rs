//! Error types for request tracking.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in tracking, storage and lookup operations.
///
/// None of these reach the caller of the request pipeline: the pipeline
/// recovers them locally and only surfaces policy rejections.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// The backing store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The geolocation provider failed.
    #[error("geolocation lookup failed for {ip}: {reason}")]
    Geo {
        /// The address being resolved.
        ip: IpAddr,
        /// Provider failure description.
        reason: String,
    },

    /// The geolocation provider did not answer in time.
    #[error("geolocation lookup for {ip} timed out after {timeout:?}")]
    GeoTimeout {
        /// The address being resolved.
        ip: IpAddr,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A request record failed validation.
    #[error("invalid request record: {0}")]
    InvalidRecord(String),

    /// An address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for tracking operations.
pub type TrackingResult<T> = Result<T, TrackingError>;
