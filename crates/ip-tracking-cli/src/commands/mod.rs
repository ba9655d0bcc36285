//! CLI command implementations.
//!
//! Each submodule implements a group of CLI commands:
//! - [`deny`] - Deny-list administration (`block`, `unblock`, `blocked`)
//! - [`scan`] - Anomaly scanning (`scan`, `watch`)
//! - [`inspect`] - Tracking data inspection (`flags`, `requests`)

pub mod deny;
pub mod inspect;
pub mod scan;

pub use deny::DenyCommand;
pub use inspect::InspectCommand;
pub use scan::ScanCommand;
