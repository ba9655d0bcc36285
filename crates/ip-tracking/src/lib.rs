//! # ip-tracking
//!
//! Request tracking and abuse mitigation for HTTP services.
//!
//! Every inbound request passes through a short admission chain before it
//! reaches application logic:
//!
//! ## Admission
//!
//! - [`DenyListGuard`] - Rejects deny-listed addresses with `403`
//! - [`RequestRecorder`] - Records address, path and time, with geolocation
//! - [`EndpointRateLimit`] - Fixed-window budgets per address and identity
//! - [`Pipeline`] - Runs the stages in order and stops at the first rejection
//!
//! ## Background
//!
//! - [`AnomalyScanner`] - Flags high-volume and sensitive-path addresses
//! - [`spawn_scanner`] - Runs the scanner on a fixed period
//!
//! ## Storage
//!
//! - [`RequestLog`], [`DenyList`], [`FlagStore`] - Repository traits
//! - [`MemoryStore`] - In-process backend
//! - [`FileStore`] - JSON-lines backend shared between processes
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ip_tracking::{InboundRequest, MemoryStore, Outcome, Pipeline, RequestMeta, TrackingConfig};
//!
//! # tokio_test_block(async {
//! let store = Arc::new(MemoryStore::new());
//! let pipeline = Pipeline::from_config(&TrackingConfig::default(), store.clone(), store.clone())?;
//!
//! ip_tracking::admin::block(store.as_ref(), "203.0.113.9".parse()?).await?;
//!
//! let meta = RequestMeta::from_peer("203.0.113.9".parse()?);
//! let outcome = pipeline
//!     .handle(InboundRequest::new(meta, "GET", "/"), |_req| async { "hello" })
//!     .await;
//!
//! assert!(matches!(outcome, Outcome::Rejected(r) if r.status_code() == 403));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod admin;
pub mod config;
pub mod error;
pub mod geo;
pub mod guard;
pub mod pipeline;
pub mod rate_limit;
pub mod recorder;
pub mod scanner;
pub mod store;

// Re-export main types
pub use address::{RequestMeta, client_address};
pub use admin::BlockOutcome;
pub use config::{
    EndpointRateLimitConfig, FailurePolicy, GeoConfig, GuardConfig, RateLimitRule,
    ScannerConfig, TrackingConfig,
};
pub use error::{TrackingError, TrackingResult};
pub use geo::{GeoCache, GeoLocation, GeoLocator, GeoResolver, HttpGeoResolver, StaticGeoResolver};
pub use guard::{DenyListGuard, GuardDecision};
pub use pipeline::{
    GuardStage, InboundRequest, Outcome, Pipeline, RateLimitStage, RecordStage, Rejection,
    RequestStage, StageVerdict,
};
pub use rate_limit::{EndpointRateLimit, RateDecision, RateLimiter};
pub use recorder::RequestRecorder;
pub use scanner::{AnomalyScanner, ScanReport, ScannerHandle, spawn_scanner};
pub use store::{
    DeniedAddress, DenyList, FileStore, FlagStore, FlaggedAddress, MemoryStore, RecordFilter,
    RequestLog, RequestRecord,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::address::{RequestMeta, client_address};
    pub use crate::config::TrackingConfig;
    pub use crate::error::{TrackingError, TrackingResult};
    pub use crate::pipeline::{InboundRequest, Outcome, Pipeline, Rejection};
    pub use crate::scanner::{AnomalyScanner, spawn_scanner};
    pub use crate::store::{DenyList, FileStore, FlagStore, MemoryStore, RequestLog};
}
