//! Anomaly scan commands.
//!
//! `scan` runs a single pass, suitable for an external scheduler such as
//! cron. `watch` keeps a scanner running on its own period until Ctrl-C.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ip_tracking::{AnomalyScanner, FlagStore, RequestLog, ScannerConfig, spawn_scanner};
use tracing::info;

use crate::error::CliError;
use crate::output::{OutputFormat, WatchSummary};

/// Scan command executor.
pub struct ScanCommand {
    scanner: Arc<AnomalyScanner>,
}

impl ScanCommand {
    /// Create a new scan command.
    #[must_use]
    pub fn new(log: Arc<dyn RequestLog>, flags: Arc<dyn FlagStore>, config: ScannerConfig) -> Self {
        Self {
            scanner: Arc::new(AnomalyScanner::new(log, flags, config)),
        }
    }

    /// Run one scan and print its report.
    ///
    /// # Errors
    ///
    /// Returns an error if output fails.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let report = self.scanner.scan(Utc::now()).await;
        format.write(writer, &report)
    }

    /// Scan periodically until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the period is zero, the signal handler cannot be
    /// installed, or output fails.
    pub async fn watch<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        period: Option<Duration>,
    ) -> Result<(), CliError> {
        let period = period.unwrap_or(self.scanner.config().period);
        if period.is_zero() {
            return Err(CliError::InvalidArgument("scan period must be non-zero".into()));
        }

        let handle = spawn_scanner(Arc::clone(&self.scanner), period);
        info!(period = ?period, "Watching; press Ctrl-C to stop");

        let signal = tokio::signal::ctrl_c().await;
        let completed = handle.completed_scans();
        handle.shutdown().await;
        signal?;

        format.write(
            writer,
            &WatchSummary {
                completed_scans: completed,
            },
        )
    }
}
