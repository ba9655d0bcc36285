//! In-memory store.
//!
//! Suitable for tests and single-process deployments. Fault injection hooks
//! let tests exercise the outage paths of the components built on top.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use super::{
    DeniedAddress, DenyList, FlagStore, FlaggedAddress, RecordFilter, RequestLog, RequestRecord,
    StoreFuture,
};
use crate::error::{TrackingError, TrackingResult};

/// Thread-safe in-memory implementation of all three repositories.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<RequestRecord>>,
    denied: RwLock<BTreeMap<IpAddr, DeniedAddress>>,
    flags: RwLock<Vec<FlaggedAddress>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_flags: RwLock<HashSet<IpAddr>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make flag writes for one address fail.
    pub fn fail_flag_writes_for(&self, ip: IpAddr) {
        self.failing_flags.write().insert(ip);
    }

    /// Snapshot of all request records.
    #[must_use]
    pub fn records(&self) -> Vec<RequestRecord> {
        self.records.read().clone()
    }

    /// Number of stored request records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Snapshot of all flags.
    #[must_use]
    pub fn flags(&self) -> Vec<FlaggedAddress> {
        self.flags.read().clone()
    }

    fn check_read(&self) -> TrackingResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TrackingError::Store("injected read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> TrackingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TrackingError::Store("injected write failure".into()));
        }
        Ok(())
    }

    fn insert_record(&self, record: RequestRecord) -> TrackingResult<()> {
        self.check_write()?;
        self.records.write().push(record);
        Ok(())
    }

    fn query_records(&self, filter: &RecordFilter) -> TrackingResult<Vec<RequestRecord>> {
        self.check_read()?;
        let mut found: Vec<RequestRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }

    fn deny(&self, ip: IpAddr) -> TrackingResult<bool> {
        self.check_write()?;
        let mut denied = self.denied.write();
        if denied.contains_key(&ip) {
            return Ok(false);
        }
        denied.insert(
            ip,
            DeniedAddress {
                address: ip,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    fn insert_flag(&self, flag: FlaggedAddress) -> TrackingResult<bool> {
        self.check_write()?;
        if self.failing_flags.read().contains(&flag.address) {
            return Err(TrackingError::Store(format!(
                "injected flag write failure for {}",
                flag.address
            )));
        }
        let mut flags = self.flags.write();
        if flags.iter().any(|f| f.key() == flag.key()) {
            return Ok(false);
        }
        flags.push(flag);
        Ok(true)
    }
}

impl RequestLog for MemoryStore {
    fn create_record(&self, record: RequestRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.insert_record(record) })
    }

    fn find_records<'a>(&'a self, filter: &'a RecordFilter) -> StoreFuture<'a, Vec<RequestRecord>> {
        Box::pin(async move { self.query_records(filter) })
    }
}

impl DenyList for MemoryStore {
    fn contains(&self, ip: IpAddr) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self.denied.read().contains_key(&ip))
        })
    }

    fn create_if_absent(&self, ip: IpAddr) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.deny(ip) })
    }

    fn remove(&self, ip: IpAddr) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_write()?;
            Ok(self.denied.write().remove(&ip).is_some())
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<DeniedAddress>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self.denied.read().values().cloned().collect())
        })
    }
}

impl FlagStore for MemoryStore {
    fn create_flag_if_absent(&self, flag: FlaggedAddress) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.insert_flag(flag) })
    }

    fn find_flags(&self, address: Option<IpAddr>) -> StoreFuture<'_, Vec<FlaggedAddress>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self
                .flags
                .read()
                .iter()
                .filter(|f| address.is_none_or(|a| f.address == a))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_records_roundtrip_sorted() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let later = RequestRecord::new(ip("10.0.0.1"), "/b", now).unwrap();
        let earlier = RequestRecord::new(ip("10.0.0.1"), "/a", now - Duration::minutes(5)).unwrap();
        store.create_record(later).await.unwrap();
        store.create_record(earlier).await.unwrap();

        let found = store.find_records(&RecordFilter::new()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].path, "/a");
        assert_eq!(found[1].path, "/b");
    }

    #[tokio::test]
    async fn test_deny_create_if_absent_is_idempotent() {
        let store = MemoryStore::new();
        let addr = ip("10.0.0.5");

        assert!(store.create_if_absent(addr).await.unwrap());
        assert!(!store.create_if_absent(addr).await.unwrap());
        assert!(store.contains(addr).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deny_remove() {
        let store = MemoryStore::new();
        let addr = ip("10.0.0.5");

        store.create_if_absent(addr).await.unwrap();
        assert!(store.remove(addr).await.unwrap());
        assert!(!store.remove(addr).await.unwrap());
        assert!(!store.contains(addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_flags_dedup_on_address_and_reason() {
        let store = MemoryStore::new();
        let addr = ip("10.0.0.9");
        let now = Utc::now();

        assert!(store.create_flag_if_absent(FlaggedAddress::new(addr, "a", now)).await.unwrap());
        assert!(!store.create_flag_if_absent(FlaggedAddress::new(addr, "a", now)).await.unwrap());
        assert!(store.create_flag_if_absent(FlaggedAddress::new(addr, "b", now)).await.unwrap());

        assert_eq!(store.find_flags(Some(addr)).await.unwrap().len(), 2);
        assert!(store.find_flags(Some(ip("10.0.0.1"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        let addr = ip("10.0.0.5");

        store.fail_reads(true);
        assert!(store.contains(addr).await.is_err());
        store.fail_reads(false);

        store.fail_writes(true);
        let record = RequestRecord::new(addr, "/", Utc::now()).unwrap();
        assert!(store.create_record(record).await.is_err());
        store.fail_writes(false);

        store.fail_flag_writes_for(addr);
        let flag = FlaggedAddress::new(addr, "x", Utc::now());
        assert!(store.create_flag_if_absent(flag).await.is_err());
        let other = FlaggedAddress::new(ip("10.0.0.6"), "x", Utc::now());
        assert!(store.create_flag_if_absent(other).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_if_absent_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let addr = ip("10.0.0.7");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.create_if_absent(addr).await.unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
