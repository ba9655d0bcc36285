//! Durable records and the repository traits over them.
//!
//! The tracking components depend only on the three traits here:
//!
//! - [`RequestLog`]: append-only request history
//! - [`DenyList`]: addresses rejected before application logic
//! - [`FlagStore`]: addresses flagged by the anomaly scanner
//!
//! Two backends are provided: [`MemoryStore`] and the JSON-lines
//! [`FileStore`].

pub mod file;
pub mod memory;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TrackingError, TrackingResult};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = TrackingResult<T>> + Send + 'a>>;

/// One inbound request, as seen by the tracking layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Origin address.
    pub address: IpAddr,
    /// Request path.
    pub path: String,
    /// When the request arrived.
    pub timestamp: DateTime<Utc>,
    /// Resolved country name, if known.
    pub country: Option<String>,
    /// Resolved city, if known.
    pub city: Option<String>,
}

impl RequestRecord {
    /// Create a record without location data.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::InvalidRecord` if `path` is empty.
    pub fn new(
        address: IpAddr,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> TrackingResult<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(TrackingError::InvalidRecord("path must not be empty".into()));
        }
        Ok(Self {
            address,
            path,
            timestamp,
            country: None,
            city: None,
        })
    }

    /// Attach location data.
    #[must_use]
    pub fn with_location(mut self, country: Option<String>, city: Option<String>) -> Self {
        self.country = country;
        self.city = city;
        self
    }
}

/// An address on the deny-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeniedAddress {
    /// The denied address.
    pub address: IpAddr,
    /// When it was added.
    pub created_at: DateTime<Utc>,
}

/// An address flagged by the anomaly scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedAddress {
    /// The flagged address.
    pub address: IpAddr,
    /// Why it was flagged.
    pub reason: String,
    /// When the flag was created.
    pub timestamp: DateTime<Utc>,
}

impl FlaggedAddress {
    /// Create a flag.
    #[must_use]
    pub fn new(address: IpAddr, reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            address,
            reason: reason.into(),
            timestamp,
        }
    }

    /// Identity of the flag for create-if-absent purposes.
    #[must_use]
    pub fn key(&self) -> (IpAddr, &str) {
        (self.address, self.reason.as_str())
    }
}

/// Query over request records. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only records at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only records from this address.
    pub address: Option<IpAddr>,
    /// Only records whose path is one of these.
    pub paths: Option<Vec<String>>,
}

impl RecordFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to records at or after `since`.
    #[must_use]
    pub const fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Restrict to one address.
    #[must_use]
    pub const fn address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Restrict to a set of paths.
    #[must_use]
    pub fn paths(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Check if a record matches the filter.
    #[must_use]
    pub fn matches(&self, record: &RequestRecord) -> bool {
        if self.since.is_some_and(|since| record.timestamp < since) {
            return false;
        }
        if self.address.is_some_and(|addr| record.address != addr) {
            return false;
        }
        if let Some(paths) = &self.paths {
            if !paths.iter().any(|p| *p == record.path) {
                return false;
            }
        }
        true
    }
}

/// Append-only request history.
pub trait RequestLog: Send + Sync {
    /// Persist a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot accept the record.
    fn create_record(&self, record: RequestRecord) -> StoreFuture<'_, ()>;

    /// Query records matching the filter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find_records<'a>(&'a self, filter: &'a RecordFilter) -> StoreFuture<'a, Vec<RequestRecord>>;
}

/// Persistent deny-list.
pub trait DenyList: Send + Sync {
    /// Check whether an address is listed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn contains(&self, ip: IpAddr) -> StoreFuture<'_, bool>;

    /// Add an address unless already listed. Returns whether it was added.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn create_if_absent(&self, ip: IpAddr) -> StoreFuture<'_, bool>;

    /// Remove an address. Returns whether it was listed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn remove(&self, ip: IpAddr) -> StoreFuture<'_, bool>;

    /// All listed addresses, ordered by address.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn list(&self) -> StoreFuture<'_, Vec<DeniedAddress>>;
}

/// Scanner output.
pub trait FlagStore: Send + Sync {
    /// Store a flag unless one with the same `(address, reason)` exists.
    /// Returns whether it was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn create_flag_if_absent(&self, flag: FlaggedAddress) -> StoreFuture<'_, bool>;

    /// Flags for one address, or all flags, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find_flags(&self, address: Option<IpAddr>) -> StoreFuture<'_, Vec<FlaggedAddress>>;
}
