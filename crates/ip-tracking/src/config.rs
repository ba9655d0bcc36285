//! Tracking configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TrackingError, TrackingResult};

/// What the deny-list guard does when its store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through; the outage is logged.
    #[default]
    Open,
    /// Reject the request as if the address were listed.
    Closed,
}

/// Configuration for the deny-list guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Behaviour on store failure.
    pub failure_policy: FailurePolicy,
}

/// Longest accepted geolocation cache TTL.
pub const MAX_GEO_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration for geolocation lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Whether lookups are performed at all.
    pub enabled: bool,
    /// Provider URL template; `{ip}` is replaced with the address.
    pub provider_url: Option<String>,
    /// How long a successful lookup is cached.
    pub cache_ttl: Duration,
    /// Upper bound for a single provider call.
    pub resolver_timeout: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_url: None,
            cache_ttl: Duration::from_secs(24 * 60 * 60), // 24 hours
            resolver_timeout: Duration::from_secs(2),
        }
    }
}

/// A request budget: at most `limit` attempts per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Maximum attempts allowed in one window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
}

impl RateLimitRule {
    /// Create a rule.
    #[must_use]
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Create a per-minute rule.
    #[must_use]
    pub const fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// Rate limits for one protected endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointRateLimitConfig {
    /// Exact path of the protected endpoint.
    pub endpoint: String,
    /// HTTP methods the limit applies to (empty = all methods).
    pub methods: Vec<String>,
    /// Budget keyed by origin address.
    pub by_address: RateLimitRule,
    /// Budget keyed by authenticated identity.
    pub by_identity: RateLimitRule,
}

impl EndpointRateLimitConfig {
    /// Check whether a method is subject to this limit.
    #[must_use]
    pub fn applies_to_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

impl Default for EndpointRateLimitConfig {
    fn default() -> Self {
        Self {
            endpoint: "/login".into(),
            methods: vec!["POST".into()],
            by_address: RateLimitRule::per_minute(5),
            by_identity: RateLimitRule::per_minute(10),
        }
    }
}

/// Configuration for the anomaly scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// How often the scanner runs.
    pub period: Duration,
    /// Trailing window each scan inspects.
    pub window: Duration,
    /// Requests per window above which an address is flagged.
    pub volume_threshold: usize,
    /// Paths whose access is flagged.
    pub sensitive_paths: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60 * 60),
            window: Duration::from_secs(60 * 60),
            volume_threshold: 100,
            sensitive_paths: vec!["/admin".into(), "/login".into()],
        }
    }
}

/// Main tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Deny-list guard settings.
    pub guard: GuardConfig,
    /// Geolocation settings.
    pub geo: GeoConfig,
    /// Per-endpoint rate limits.
    pub rate_limits: Vec<EndpointRateLimitConfig>,
    /// Anomaly scanner settings.
    pub scanner: ScannerConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            geo: GeoConfig::default(),
            rate_limits: vec![EndpointRateLimitConfig::default()],
            scanner: ScannerConfig::default(),
        }
    }
}

impl TrackingConfig {
    /// Create a new builder for tracking configuration.
    #[must_use]
    pub fn builder() -> TrackingConfigBuilder {
        TrackingConfigBuilder::default()
    }

    /// Load and validate configuration from a JSON file.
    ///
    /// Missing sections fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails
    /// validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> TrackingResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that would make a component inert
    /// or nonsensical.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::Config` describing the first invalid value.
    pub fn validate(&self) -> TrackingResult<()> {
        if self.geo.cache_ttl.is_zero() {
            return Err(TrackingError::Config("geo.cache_ttl must be non-zero".into()));
        }
        if self.geo.cache_ttl > MAX_GEO_CACHE_TTL {
            return Err(TrackingError::Config(format!(
                "geo.cache_ttl must not exceed {MAX_GEO_CACHE_TTL:?}"
            )));
        }
        if self.geo.resolver_timeout.is_zero() {
            return Err(TrackingError::Config(
                "geo.resolver_timeout must be non-zero".into(),
            ));
        }
        if let Some(url) = &self.geo.provider_url {
            if !url.contains("{ip}") {
                return Err(TrackingError::Config(format!(
                    "geo.provider_url must contain an {{ip}} placeholder: {url}"
                )));
            }
        }

        for endpoint in &self.rate_limits {
            if !endpoint.endpoint.starts_with('/') {
                return Err(TrackingError::Config(format!(
                    "rate limit endpoint must start with '/': {}",
                    endpoint.endpoint
                )));
            }
            for (name, rule) in [
                ("by_address", &endpoint.by_address),
                ("by_identity", &endpoint.by_identity),
            ] {
                if rule.limit == 0 || rule.window.is_zero() {
                    return Err(TrackingError::Config(format!(
                        "{}: {name} needs a non-zero limit and window",
                        endpoint.endpoint
                    )));
                }
            }
        }

        if self.scanner.period.is_zero() || self.scanner.window.is_zero() {
            return Err(TrackingError::Config(
                "scanner period and window must be non-zero".into(),
            ));
        }
        if let Some(bad) = self.scanner.sensitive_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(TrackingError::Config(format!(
                "sensitive path must start with '/': {bad:?}"
            )));
        }

        Ok(())
    }

    /// Get the rate limit configured for an endpoint path, if any.
    #[must_use]
    pub fn rate_limit_for_endpoint(&self, path: &str) -> Option<&EndpointRateLimitConfig> {
        self.rate_limits.iter().find(|e| e.endpoint == path)
    }
}

/// Builder for `TrackingConfig`.
#[derive(Debug, Clone, Default)]
pub struct TrackingConfigBuilder {
    config: TrackingConfig,
}

impl TrackingConfigBuilder {
    /// Set the guard failure policy.
    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.guard.failure_policy = policy;
        self
    }

    /// Set geolocation configuration.
    #[must_use]
    pub fn geo(mut self, config: GeoConfig) -> Self {
        self.config.geo = config;
        self
    }

    /// Replace all endpoint rate limits with a single one.
    #[must_use]
    pub fn rate_limit(mut self, config: EndpointRateLimitConfig) -> Self {
        self.config.rate_limits = vec![config];
        self
    }

    /// Remove all endpoint rate limits.
    #[must_use]
    pub fn without_rate_limits(mut self) -> Self {
        self.config.rate_limits.clear();
        self
    }

    /// Set scanner configuration.
    #[must_use]
    pub fn scanner(mut self, config: ScannerConfig) -> Self {
        self.config.scanner = config;
        self
    }

    /// Add a sensitive path.
    #[must_use]
    pub fn sensitive_path(mut self, path: impl Into<String>) -> Self {
        self.config.scanner.sensitive_paths.push(path.into());
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> TrackingConfig {
        self.config
    }
}
