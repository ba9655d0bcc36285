//! Request recording with best-effort geolocation.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::geo::GeoLocator;
use crate::store::{RequestLog, RequestRecord};

/// Persists one [`RequestRecord`] per admitted request.
///
/// Recording never fails from the caller's point of view: an unresolved
/// location leaves the location fields empty and a store error is logged.
pub struct RequestRecorder {
    log: Arc<dyn RequestLog>,
    locator: Arc<GeoLocator>,
}

impl RequestRecorder {
    /// Create a recorder.
    #[must_use]
    pub fn new(log: Arc<dyn RequestLog>, locator: Arc<GeoLocator>) -> Self {
        Self { log, locator }
    }

    /// Create a recorder that never resolves locations.
    #[must_use]
    pub fn without_geo(log: Arc<dyn RequestLog>) -> Self {
        Self::new(log, Arc::new(GeoLocator::disabled()))
    }

    /// The locator in use.
    #[must_use]
    pub fn locator(&self) -> &GeoLocator {
        &self.locator
    }

    /// Record a request.
    pub async fn record(&self, ip: IpAddr, path: &str, timestamp: DateTime<Utc>) {
        let path = if path.is_empty() { "/" } else { path };
        let location = self.locator.locate(ip).await;

        let record = match RequestRecord::new(ip, path, timestamp) {
            Ok(record) => record.with_location(location.country, location.city),
            Err(e) => {
                error!(ip = %ip, path = %path, error = %e, "Invalid request record");
                return;
            }
        };

        match self.log.create_record(record).await {
            Ok(()) => info!(ip = %ip, path = %path, "Request recorded"),
            Err(e) => error!(ip = %ip, path = %path, error = %e, "Failed to persist request record"),
        }
    }
}

impl std::fmt::Debug for RequestRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecorder")
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}
