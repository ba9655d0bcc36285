//! Periodic anomaly scanning over the request log.
//!
//! A scan looks at the trailing window of request records and flags:
//!
//! - addresses with more than `volume_threshold` requests in the window
//! - addresses that requested any configured sensitive path
//!
//! Flags are create-if-absent on `(address, reason)`, so rescanning the same
//! data never duplicates them. Scans never overlap.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ScannerConfig;
use crate::store::{FlagStore, FlaggedAddress, RecordFilter, RequestLog, RequestRecord};

/// Reason recorded for the volume rule.
pub const VOLUME_REASON: &str = "exceeded rate threshold";

/// Reason recorded for a sensitive path access.
#[must_use]
pub fn sensitive_path_reason(path: &str) -> String {
    format!("accessed sensitive path: {path}")
}

/// Summary of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Records inside the window.
    pub examined: usize,
    /// Flags newly created.
    pub created: usize,
    /// Candidates that were already flagged.
    pub existing: usize,
    /// Flag writes that failed.
    pub failed: usize,
}

/// Flags abusive addresses from recent request history.
pub struct AnomalyScanner {
    log: Arc<dyn RequestLog>,
    flags: Arc<dyn FlagStore>,
    config: ScannerConfig,
    running: Mutex<()>,
}

impl AnomalyScanner {
    /// Create a scanner.
    #[must_use]
    pub fn new(log: Arc<dyn RequestLog>, flags: Arc<dyn FlagStore>, config: ScannerConfig) -> Self {
        Self {
            log,
            flags,
            config,
            running: Mutex::new(()),
        }
    }

    /// Scanner configuration.
    #[must_use]
    pub const fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Run a scan over `[now - window, now]`, waiting for any running scan.
    pub async fn scan(&self, now: DateTime<Utc>) -> ScanReport {
        let _running = self.running.lock().await;
        self.run(now).await
    }

    /// Run a scan unless one is already in progress.
    pub async fn try_scan(&self, now: DateTime<Utc>) -> Option<ScanReport> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("Scan already in progress, skipping");
            return None;
        };
        Some(self.run(now).await)
    }

    async fn run(&self, now: DateTime<Utc>) -> ScanReport {
        let window_start = chrono::Duration::from_std(self.config.window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let filter = RecordFilter::new().since(window_start);
        let records = match self.log.find_records(&filter).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to read request log, skipping scan");
                return ScanReport::default();
            }
        };
        let records: Vec<RequestRecord> =
            records.into_iter().filter(|r| r.timestamp <= now).collect();

        let candidates = self.candidates(&records);
        debug!(
            examined = records.len(),
            candidates = candidates.len(),
            since = %window_start,
            "Scanning request window"
        );

        let mut report = ScanReport {
            examined: records.len(),
            ..ScanReport::default()
        };

        for (ip, reason) in candidates {
            let flag = FlaggedAddress::new(ip, reason, now);
            match self.flags.create_flag_if_absent(flag.clone()).await {
                Ok(true) => {
                    info!(ip = %ip, reason = %flag.reason, "Flagged address");
                    report.created += 1;
                }
                Ok(false) => report.existing += 1,
                Err(e) => {
                    error!(ip = %ip, reason = %flag.reason, error = %e, "Failed to store flag");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            created = report.created,
            existing = report.existing,
            failed = report.failed,
            "Scan complete"
        );
        report
    }

    fn candidates(&self, records: &[RequestRecord]) -> BTreeSet<(IpAddr, String)> {
        let mut counts: HashMap<IpAddr, usize> = HashMap::new();
        let mut candidates = BTreeSet::new();

        for record in records {
            *counts.entry(record.address).or_default() += 1;
            if self.config.sensitive_paths.iter().any(|p| *p == record.path) {
                candidates.insert((record.address, sensitive_path_reason(&record.path)));
            }
        }

        for (ip, count) in counts {
            if count > self.config.volume_threshold {
                candidates.insert((ip, VOLUME_REASON.to_string()));
            }
        }

        candidates
    }
}

impl std::fmt::Debug for AnomalyScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyScanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle for controlling a background scanner task.
#[derive(Debug)]
pub struct ScannerHandle {
    running: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Check if the scanner task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of scans completed so far.
    #[must_use]
    pub fn completed_scans(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Ask the task to stop after the current scan.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Scanner task failed");
        }
    }
}

/// Start scanning every `period`, beginning immediately.
///
/// Ticks missed while a scan runs long are skipped rather than queued.
///
/// # Panics
///
/// Panics if `period` is zero.
pub fn spawn_scanner(scanner: Arc<AnomalyScanner>, period: Duration) -> ScannerHandle {
    let running = Arc::new(AtomicBool::new(true));
    let completed = Arc::new(AtomicU64::new(0));
    let shutdown = Arc::new(Notify::new());

    let task = {
        let running = Arc::clone(&running);
        let completed = Arc::clone(&completed);
        let shutdown = Arc::clone(&shutdown);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period = ?period, "Anomaly scanner started");

            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.notified() => break,
                }

                if scanner.try_scan(Utc::now()).await.is_some() {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }

            running.store(false, Ordering::SeqCst);
            info!("Anomaly scanner stopped");
        })
    };

    ScannerHandle {
        running,
        completed,
        shutdown,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn scanner(store: &Arc<MemoryStore>) -> AnomalyScanner {
        AnomalyScanner::new(store.clone(), store.clone(), ScannerConfig::default())
    }

    async fn seed(store: &MemoryStore, addr: IpAddr, path: &str, at: DateTime<Utc>, n: usize) {
        for _ in 0..n {
            let record = RequestRecord::new(addr, path, at).unwrap();
            store.create_record(record).await.unwrap();
        }
    }

    // ==================== Volume Rule Tests ====================

    #[tokio::test]
    async fn test_volume_over_threshold_flagged_once() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let addr = ip("10.0.0.5");
        seed(&store, addr, "/", now - ChronoDuration::minutes(10), 101).await;

        let scanner = scanner(&store);
        let first = scanner.scan(now).await;
        let second = scanner.scan(now).await;

        assert_eq!(first.examined, 101);
        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.existing, 1);

        let flags = store.flags();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].address, addr);
        assert_eq!(flags[0].reason, VOLUME_REASON);
    }

    #[tokio::test]
    async fn test_volume_at_threshold_not_flagged() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed(&store, ip("203.0.113.50"), "/", now, 100).await;

        let report = scanner(&store).scan(now).await;

        assert_eq!(report.created, 0);
        assert!(store.flags().is_empty());
    }

    #[tokio::test]
    async fn test_volume_counts_only_window() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let addr = ip("203.0.113.50");
        seed(&store, addr, "/", now - ChronoDuration::minutes(90), 60).await;
        seed(&store, addr, "/", now - ChronoDuration::minutes(30), 60).await;

        let report = scanner(&store).scan(now).await;

        assert_eq!(report.examined, 60);
        assert!(store.flags().is_empty());
    }

    // ==================== Sensitive Path Tests ====================

    #[tokio::test]
    async fn test_sensitive_path_flagged() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let addr = ip("10.0.0.9");
        seed(&store, addr, "/admin", now - ChronoDuration::minutes(5), 1).await;

        let report = scanner(&store).scan(now).await;

        assert_eq!(report.created, 1);
        let flags = store.flags();
        assert_eq!(flags[0].address, addr);
        assert_eq!(flags[0].reason, "accessed sensitive path: /admin");
    }

    #[tokio::test]
    async fn test_sensitive_path_outside_window_ignored() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed(&store, ip("198.51.100.7"), "/admin", now - ChronoDuration::hours(2), 1).await;

        let report = scanner(&store).scan(now).await;

        assert_eq!(report.examined, 0);
        assert!(store.flags().is_empty());
    }

    #[tokio::test]
    async fn test_sensitive_path_exact_match() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed(&store, ip("198.51.100.7"), "/admin/users", now, 1).await;
        seed(&store, ip("198.51.100.8"), "/loginx", now, 1).await;

        scanner(&store).scan(now).await;

        assert!(store.flags().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_sensitive_paths_flag_separately() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let addr = ip("198.51.100.7");
        seed(&store, addr, "/admin", now, 1).await;
        seed(&store, addr, "/login", now, 1).await;

        let report = scanner(&store).scan(now).await;

        assert_eq!(report.created, 2);
        assert_eq!(store.find_flags(Some(addr)).await.unwrap().len(), 2);
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn test_failed_flag_write_does_not_abort_scan() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let bad = ip("198.51.100.1");
        let good = ip("198.51.100.2");
        seed(&store, bad, "/admin", now, 1).await;
        seed(&store, good, "/admin", now, 1).await;
        store.fail_flag_writes_for(bad);

        let report = scanner(&store).scan(now).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(store.flags()[0].address, good);
    }

    #[tokio::test]
    async fn test_unreadable_log_yields_empty_report() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, ip("198.51.100.1"), "/admin", Utc::now(), 1).await;
        store.fail_reads(true);

        let report = scanner(&store).scan(Utc::now()).await;

        assert_eq!(report, ScanReport::default());
    }

    // ==================== Scheduling Tests ====================

    #[tokio::test]
    async fn test_try_scan_skips_when_running() {
        let store = Arc::new(MemoryStore::new());
        let scanner = scanner(&store);

        let held = scanner.running.lock().await;
        assert!(scanner.try_scan(Utc::now()).await.is_none());
        drop(held);
        assert!(scanner.try_scan(Utc::now()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_scanner_runs_periodically() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, ip("198.51.100.7"), "/admin", Utc::now(), 1).await;
        let scanner = Arc::new(scanner(&store));

        let handle = spawn_scanner(scanner, Duration::from_secs(3600));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.completed_scans(), 1);
        assert_eq!(store.flags().len(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(handle.completed_scans(), 2);
        assert_eq!(store.flags().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_handle_stop() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_scanner(Arc::new(scanner(&store)), Duration::from_secs(60));

        handle.stop();
        assert!(!handle.is_running());
        handle.shutdown().await;
    }
}
