//! Geolocation lookup and caching.
//!
//! [`GeoLocator`] is what the recorder talks to. It answers from a
//! [`GeoCache`] when it can, otherwise asks a [`GeoResolver`] under a timeout.
//! Only successful answers are cached; a failed or timed-out lookup yields an
//! empty location and the next request for the address tries again.
//!
//! Concurrent misses for one address wait on a single in-flight lookup, so
//! the provider sees at most one call per address per TTL while it answers.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GeoConfig;
use crate::error::{TrackingError, TrackingResult};

/// Boxed future returned by resolvers.
pub type GeoFuture<'a> = Pin<Box<dyn Future<Output = TrackingResult<GeoLocation>> + Send + 'a>>;

/// Coarse location of an address. Only these two fields are ever kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Country name.
    pub country: Option<String>,
    /// City name.
    pub city: Option<String>,
}

impl GeoLocation {
    /// Create a location.
    #[must_use]
    pub fn new(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: Some(country.into()),
            city: Some(city.into()),
        }
    }

    /// A location with nothing known.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            country: None,
            city: None,
        }
    }

    /// Check whether anything is known.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        self.country.is_none() && self.city.is_none()
    }
}

/// External geolocation provider.
pub trait GeoResolver: Send + Sync {
    /// Resolve an address.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::Geo` if the provider fails or has no answer.
    fn lookup(&self, ip: IpAddr) -> GeoFuture<'_>;
}

/// Provider response. Everything but country and city is ignored.
///
/// Providers disagree on the country key. Some send both an ISO code in
/// `country` and the name in `country_name`, so the keys are read separately
/// and the most descriptive one wins.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderResponse {
    country_name: Option<String>,
    #[serde(rename = "countryName")]
    country_name_camel: Option<String>,
    country: Option<String>,
    city: Option<String>,
    error: Option<bool>,
    reason: Option<String>,
}

impl ProviderResponse {
    fn into_location(self) -> GeoLocation {
        GeoLocation {
            country: self
                .country_name
                .or(self.country_name_camel)
                .or(self.country),
            city: self.city,
        }
    }
}

/// Resolver backed by an HTTP JSON API.
///
/// The URL template must contain `{ip}`, e.g. `https://ipapi.co/{ip}/json/`.
#[derive(Debug, Clone)]
pub struct HttpGeoResolver {
    client: reqwest::Client,
    url_template: String,
}

impl HttpGeoResolver {
    /// Create a resolver for a URL template.
    ///
    /// The client timeout is a backstop; [`GeoLocator`] applies its own.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::Config` if the template lacks `{ip}` or the
    /// HTTP client cannot be built.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> TrackingResult<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{ip}") {
            return Err(TrackingError::Config(format!(
                "geolocation URL template has no {{ip}} placeholder: {url_template}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackingError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url_template,
        })
    }

    /// The URL queried for an address.
    #[must_use]
    pub fn url_for(&self, ip: IpAddr) -> String {
        self.url_template.replace("{ip}", &ip.to_string())
    }
}

impl GeoResolver for HttpGeoResolver {
    fn lookup(&self, ip: IpAddr) -> GeoFuture<'_> {
        Box::pin(async move {
            let geo_err = |reason: String| TrackingError::Geo { ip, reason };

            let response = self
                .client
                .get(self.url_for(ip))
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| geo_err(e.to_string()))?;

            let body: ProviderResponse = response.json().await.map_err(|e| geo_err(e.to_string()))?;

            if body.error == Some(true) {
                return Err(geo_err(
                    body.reason.unwrap_or_else(|| "provider returned an error".into()),
                ));
            }

            Ok(body.into_location())
        })
    }
}

/// Resolver answering from a fixed table. Unknown addresses fail.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoResolver {
    table: HashMap<IpAddr, GeoLocation>,
}

impl StaticGeoResolver {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    #[must_use]
    pub fn with_entry(mut self, ip: IpAddr, location: GeoLocation) -> Self {
        self.table.insert(ip, location);
        self
    }
}

impl GeoResolver for StaticGeoResolver {
    fn lookup(&self, ip: IpAddr) -> GeoFuture<'_> {
        let result = self.table.get(&ip).cloned().ok_or_else(|| TrackingError::Geo {
            ip,
            reason: "address not in table".into(),
        });
        Box::pin(async move { result })
    }
}

/// Cached location with its expiry.
#[derive(Debug, Clone)]
struct GeoCacheEntry {
    location: GeoLocation,
    expires_at: Instant,
}

/// Time-bounded address → location cache.
///
/// Expired entries are evicted when read, and swept from the whole map at
/// most once per TTL as new entries arrive.
#[derive(Debug)]
pub struct GeoCache {
    ttl: Duration,
    entries: RwLock<HashMap<IpAddr, GeoCacheEntry>>,
    last_sweep: Mutex<Option<Instant>>,
}

impl GeoCache {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            last_sweep: Mutex::new(None),
        }
    }

    /// Look up an address.
    #[must_use]
    pub fn get(&self, ip: &IpAddr) -> Option<GeoLocation> {
        self.get_at(ip, Instant::now())
    }

    /// Look up an address as of `now`. Expired entries are evicted.
    #[must_use]
    pub fn get_at(&self, ip: &IpAddr, now: Instant) -> Option<GeoLocation> {
        {
            let entries = self.entries.read();
            match entries.get(ip) {
                None => return None,
                Some(entry) if now < entry.expires_at => return Some(entry.location.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write();
        // Re-check under the write lock; another request may have refreshed it.
        match entries.get(ip) {
            Some(entry) if now < entry.expires_at => Some(entry.location.clone()),
            Some(_) => {
                entries.remove(ip);
                None
            }
            None => None,
        }
    }

    /// Cache a location.
    pub fn insert(&self, ip: IpAddr, location: GeoLocation) {
        self.insert_at(ip, location, Instant::now());
    }

    /// Cache a location as of `now`.
    ///
    /// Nothing is cached if the expiry cannot be represented.
    pub fn insert_at(&self, ip: IpAddr, location: GeoLocation, now: Instant) {
        let Some(expires_at) = now.checked_add(self.ttl) else {
            warn!(ip = %ip, ttl = ?self.ttl, "Geolocation TTL out of range, not caching");
            return;
        };

        let sweep = self.sweep_due(now);
        let mut entries = self.entries.write();
        if sweep {
            let before = entries.len();
            entries.retain(|_, e| now < e.expires_at);
            debug!(removed = before - entries.len(), "Swept expired geolocation entries");
        }
        entries.insert(ip, GeoCacheEntry {
            location,
            expires_at,
        });
    }

    fn sweep_due(&self, now: Instant) -> bool {
        let mut last = self.last_sweep.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.ttl => false,
            Some(_) => {
                *last = Some(now);
                true
            }
            None => {
                *last = Some(now);
                false
            }
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }

    /// Number of cached entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Configured TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Cache in front of a resolver, with a per-lookup timeout.
pub struct GeoLocator {
    resolver: Option<Arc<dyn GeoResolver>>,
    cache: GeoCache,
    timeout: Duration,
    inflight: Mutex<HashMap<IpAddr, Arc<AsyncMutex<()>>>>,
}

/// Claim on the per-address lookup gate. Dropping it forgets the gate once
/// nobody else holds it.
struct InflightSlot<'a> {
    inflight: &'a Mutex<HashMap<IpAddr, Arc<AsyncMutex<()>>>>,
    ip: IpAddr,
    gate: Arc<AsyncMutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn claim(inflight: &'a Mutex<HashMap<IpAddr, Arc<AsyncMutex<()>>>>, ip: IpAddr) -> Self {
        let gate = Arc::clone(inflight.lock().entry(ip).or_default());
        Self { inflight, ip, gate }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        // One reference is ours, one is the map's.
        if Arc::strong_count(&self.gate) <= 2
            && inflight
                .get(&self.ip)
                .is_some_and(|g| Arc::ptr_eq(g, &self.gate))
        {
            inflight.remove(&self.ip);
        }
    }
}

impl GeoLocator {
    /// Create a locator.
    #[must_use]
    pub fn new(resolver: Arc<dyn GeoResolver>, cache_ttl: Duration, timeout: Duration) -> Self {
        Self {
            resolver: Some(resolver),
            cache: GeoCache::new(cache_ttl),
            timeout,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// A locator that never resolves anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            resolver: None,
            cache: GeoCache::new(Duration::ZERO),
            timeout: Duration::ZERO,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Build from configuration. Disabled unless enabled with a provider URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP resolver cannot be built.
    pub fn from_config(config: &GeoConfig) -> TrackingResult<Self> {
        match (&config.provider_url, config.enabled) {
            (Some(url), true) => {
                let resolver = HttpGeoResolver::new(url.clone(), config.resolver_timeout)?;
                Ok(Self::new(
                    Arc::new(resolver),
                    config.cache_ttl,
                    config.resolver_timeout,
                ))
            }
            _ => Ok(Self::disabled()),
        }
    }

    /// Locate an address. Never fails; unknown on any error.
    pub async fn locate(&self, ip: IpAddr) -> GeoLocation {
        self.locate_at(ip, Instant::now()).await
    }

    /// Locate an address, treating `now` as the current cache time.
    pub async fn locate_at(&self, ip: IpAddr, now: Instant) -> GeoLocation {
        let Some(resolver) = &self.resolver else {
            return GeoLocation::unknown();
        };

        if let Some(hit) = self.cache.get_at(&ip, now) {
            debug!(ip = %ip, "Geolocation cache hit");
            return hit;
        }

        let slot = InflightSlot::claim(&self.inflight, ip);
        let _turn = slot.gate.lock().await;
        if let Some(hit) = self.cache.get_at(&ip, now) {
            debug!(ip = %ip, "Geolocation filled by concurrent lookup");
            return hit;
        }

        self.resolve(resolver.as_ref(), ip, now).await
    }

    async fn resolve(&self, resolver: &dyn GeoResolver, ip: IpAddr, now: Instant) -> GeoLocation {
        let outcome = match tokio::time::timeout(self.timeout, resolver.lookup(ip)).await {
            Ok(result) => result,
            Err(_) => Err(TrackingError::GeoTimeout {
                ip,
                timeout: self.timeout,
            }),
        };

        match outcome {
            Ok(location) => {
                debug!(ip = %ip, country = ?location.country, city = ?location.city, "Geolocation resolved");
                self.cache.insert_at(ip, location.clone(), now);
                location
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Geolocation lookup failed");
                GeoLocation::unknown()
            }
        }
    }

    /// Check if lookups are performed.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.resolver.is_some()
    }

    /// The underlying cache.
    #[must_use]
    pub const fn cache(&self) -> &GeoCache {
        &self.cache
    }
}

impl std::fmt::Debug for GeoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoLocator")
            .field("enabled", &self.resolver.is_some())
            .field("cache_size", &self.cache.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Resolver that counts calls and can be switched into failure.
    pub(crate) struct CountingResolver {
        pub calls: AtomicUsize,
        pub failing: AtomicBool,
        pub location: GeoLocation,
        pub delay: Option<Duration>,
    }

    impl CountingResolver {
        pub(crate) fn new(location: GeoLocation) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                location,
                delay: None,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GeoResolver for CountingResolver {
        fn lookup(&self, ip: IpAddr) -> GeoFuture<'_> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.failing.load(Ordering::SeqCst) {
                    return Err(TrackingError::Geo {
                        ip,
                        reason: "provider down".into(),
                    });
                }
                Ok(self.location.clone())
            })
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    // ==================== GeoCache Tests ====================

    #[test]
    fn test_cache_hit_within_ttl() {
        let cache = GeoCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_at(ip("1.1.1.1"), GeoLocation::new("Australia", "Sydney"), t0);

        let hit = cache.get_at(&ip("1.1.1.1"), t0 + Duration::from_secs(59));
        assert_eq!(hit, Some(GeoLocation::new("Australia", "Sydney")));
    }

    #[test]
    fn test_cache_entry_expires_at_ttl() {
        let cache = GeoCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_at(ip("1.1.1.1"), GeoLocation::new("Australia", "Sydney"), t0);

        assert!(cache.get_at(&ip("1.1.1.1"), t0 + Duration::from_secs(60)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_purge_expired() {
        let cache = GeoCache::new(Duration::from_secs(10));
        let t0 = Instant::now();
        cache.insert_at(ip("1.1.1.1"), GeoLocation::unknown(), t0);
        cache.insert_at(ip("2.2.2.2"), GeoLocation::unknown(), t0 + Duration::from_secs(5));

        assert_eq!(cache.purge_expired(t0 + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_insert_sweeps_expired_once_per_ttl() {
        let cache = GeoCache::new(Duration::from_secs(10));
        let t0 = Instant::now();
        for i in 0..100u8 {
            let addr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, i));
            cache.insert_at(addr, GeoLocation::unknown(), t0);
        }
        assert_eq!(cache.len(), 100);

        cache.insert_at(ip("1.1.1.1"), GeoLocation::unknown(), t0 + Duration::from_secs(11));

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unrepresentable_ttl_is_not_cached() {
        let cache = GeoCache::new(Duration::from_secs(u64::MAX));
        cache.insert(ip("1.1.1.1"), GeoLocation::new("Australia", "Sydney"));

        assert!(cache.is_empty());
    }

    // ==================== GeoLocator Tests ====================

    #[tokio::test]
    async fn test_second_lookup_served_from_cache() {
        let resolver = Arc::new(CountingResolver::new(GeoLocation::new("Kenya", "Nairobi")));
        let locator = GeoLocator::new(resolver.clone(), DAY, Duration::from_secs(2));
        let t0 = Instant::now();

        let first = locator.locate_at(ip("41.90.0.1"), t0).await;
        let second = locator.locate_at(ip("41.90.0.1"), t0 + Duration::from_secs(3600)).await;

        assert_eq!(first, second);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_lookup_repeats_after_ttl() {
        let resolver = Arc::new(CountingResolver::new(GeoLocation::new("Kenya", "Nairobi")));
        let locator = GeoLocator::new(resolver.clone(), DAY, Duration::from_secs(2));
        let t0 = Instant::now();

        locator.locate_at(ip("41.90.0.1"), t0).await;
        locator.locate_at(ip("41.90.0.1"), t0 + DAY + Duration::from_secs(1)).await;

        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let resolver = Arc::new(CountingResolver::new(GeoLocation::new("Kenya", "Nairobi")));
        resolver.failing.store(true, Ordering::SeqCst);
        let locator = GeoLocator::new(resolver.clone(), DAY, Duration::from_secs(2));

        let first = locator.locate(ip("41.90.0.1")).await;
        assert!(first.is_unknown());
        assert!(locator.cache().is_empty());

        resolver.failing.store(false, Ordering::SeqCst);
        let second = locator.locate(ip("41.90.0.1")).await;

        assert_eq!(second, GeoLocation::new("Kenya", "Nairobi"));
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut slow = CountingResolver::new(GeoLocation::new("Kenya", "Nairobi"));
        slow.delay = Some(Duration::from_secs(30));
        let resolver = Arc::new(slow);
        let locator = GeoLocator::new(resolver.clone(), DAY, Duration::from_secs(2));

        let location = locator.locate(ip("41.90.0.1")).await;

        assert!(location.is_unknown());
        assert!(locator.cache().is_empty());
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_lookup() {
        let mut slow = CountingResolver::new(GeoLocation::new("Kenya", "Nairobi"));
        slow.delay = Some(Duration::from_millis(500));
        let resolver = Arc::new(slow);
        let locator = GeoLocator::new(resolver.clone(), DAY, Duration::from_secs(2));

        let (a, b, c) = tokio::join!(
            locator.locate(ip("41.90.0.1")),
            locator.locate(ip("41.90.0.1")),
            locator.locate(ip("41.90.0.1")),
        );

        assert_eq!(a, GeoLocation::new("Kenya", "Nairobi"));
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(resolver.calls(), 1);
        assert!(locator.inflight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_for_different_addresses_both_resolve() {
        let mut slow = CountingResolver::new(GeoLocation::new("Kenya", "Nairobi"));
        slow.delay = Some(Duration::from_millis(500));
        let resolver = Arc::new(slow);
        let locator = GeoLocator::new(resolver.clone(), DAY, Duration::from_secs(2));

        tokio::join!(locator.locate(ip("41.90.0.1")), locator.locate(ip("41.90.0.2")));

        assert_eq!(resolver.calls(), 2);
        assert_eq!(locator.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_locator() {
        let locator = GeoLocator::disabled();
        assert!(!locator.is_enabled());
        assert!(locator.locate(ip("8.8.8.8")).await.is_unknown());
    }

    #[test]
    fn test_from_config_without_provider_is_disabled() {
        let locator = GeoLocator::from_config(&GeoConfig::default()).unwrap();
        assert!(!locator.is_enabled());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticGeoResolver::new()
            .with_entry(ip("8.8.8.8"), GeoLocation::new("United States", "Mountain View"));

        assert!(resolver.lookup(ip("8.8.8.8")).await.is_ok());
        assert!(matches!(
            resolver.lookup(ip("9.9.9.9")).await,
            Err(TrackingError::Geo { .. })
        ));
    }

    // ==================== HttpGeoResolver Tests ====================

    #[test]
    fn test_http_resolver_url() {
        let resolver =
            HttpGeoResolver::new("https://ipapi.co/{ip}/json/", Duration::from_secs(2)).unwrap();
        assert_eq!(resolver.url_for(ip("8.8.8.8")), "https://ipapi.co/8.8.8.8/json/");
    }

    #[test]
    fn test_http_resolver_requires_placeholder() {
        let result = HttpGeoResolver::new("https://ipapi.co/json/", Duration::from_secs(2));
        assert!(matches!(result, Err(TrackingError::Config(_))));
    }

    #[test]
    fn test_provider_response_keeps_only_country_and_city() {
        let json = r#"{
            "ip": "8.8.8.8",
            "countryName": "United States",
            "city": "Mountain View",
            "latitude": 37.4,
            "org": "GOOGLE"
        }"#;
        let body: ProviderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            body.into_location(),
            GeoLocation::new("United States", "Mountain View")
        );
    }

    #[test]
    fn test_provider_response_prefers_name_over_iso_code() {
        let json = r#"{
            "ip": "8.8.8.8",
            "city": "Mountain View",
            "region": "California",
            "country": "US",
            "country_name": "United States",
            "country_code": "US",
            "latitude": 37.42301,
            "org": "GOOGLE"
        }"#;
        let body: ProviderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            body.into_location(),
            GeoLocation::new("United States", "Mountain View")
        );
    }

    #[test]
    fn test_provider_response_country_only_key() {
        let json = r#"{ "status": "success", "country": "Germany", "city": "Berlin" }"#;
        let body: ProviderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.into_location(), GeoLocation::new("Germany", "Berlin"));
    }

    #[test]
    fn test_provider_error_payload() {
        let json = r#"{ "ip": "10.0.0.1", "error": true, "reason": "Reserved IP Address" }"#;
        let body: ProviderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.error, Some(true));
        assert_eq!(body.reason.as_deref(), Some("Reserved IP Address"));
    }
}
