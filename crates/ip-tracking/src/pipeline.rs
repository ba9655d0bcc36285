//! Request admission pipeline.
//!
//! A [`Pipeline`] runs an ordered chain of [`RequestStage`]s before handing a
//! request to the application handler. The first stage that rejects ends the
//! chain; later stages and the handler never see the request.
//!
//! The default chain built by [`Pipeline::from_config`] is:
//!
//! 1. [`GuardStage`]: deny-listed addresses get `403`
//! 2. [`RecordStage`]: every admitted request is recorded
//! 3. [`RateLimitStage`]: per-endpoint budgets, `429` when spent
//!
//! The client address is derived once per request and shared by every stage.
//! When none can be derived, stages see the request through
//! [`RequestStage::process_unaddressed`]; only identity budgets still apply.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::address::{RequestMeta, client_address};
use crate::config::TrackingConfig;
use crate::error::TrackingResult;
use crate::geo::GeoLocator;
use crate::guard::{DenyListGuard, GuardDecision};
use crate::rate_limit::{EndpointRateLimit, RateDecision};
use crate::recorder::RequestRecorder;
use crate::store::{DenyList, RequestLog};

/// An inbound request as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    /// Address metadata.
    pub meta: RequestMeta,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Authenticated identity, if any.
    pub identity: Option<String>,
    /// When the request arrived.
    pub received_at: DateTime<Utc>,
}

impl InboundRequest {
    /// Create an anonymous request received now.
    #[must_use]
    pub fn new(meta: RequestMeta, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            meta,
            method: method.into(),
            path: path.into(),
            identity: None,
            received_at: Utc::now(),
        }
    }

    /// Set the authenticated identity.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the arrival time.
    #[must_use]
    pub const fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The origin address is deny-listed.
    #[error("forbidden")]
    Forbidden,
    /// A rate limit is exhausted.
    #[error("too many requests, retry after {retry_after:?}")]
    TooManyRequests {
        /// Time until the budget resets.
        retry_after: Duration,
    },
}

impl Rejection {
    /// HTTP status code for the rejection.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::TooManyRequests { .. } => 429,
        }
    }
}

/// Result of passing a request through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The handler ran and produced a response.
    Handled(T),
    /// A stage rejected the request.
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    /// Check if the request was rejected.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The rejection, if any.
    #[must_use]
    pub const fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Handled(_) => None,
            Self::Rejected(r) => Some(*r),
        }
    }

    /// The handler's response, if it ran.
    pub fn into_handled(self) -> Option<T> {
        match self {
            Self::Handled(t) => Some(t),
            Self::Rejected(_) => None,
        }
    }
}

/// Verdict of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageVerdict {
    /// Pass the request on.
    Continue,
    /// Stop here.
    Reject(Rejection),
}

/// Boxed future returned by stages.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = StageVerdict> + Send + 'a>>;

/// One step of the admission chain.
pub trait RequestStage: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Inspect a request from `address`.
    fn process<'a>(&'a self, request: &'a InboundRequest, address: IpAddr) -> StageFuture<'a>;

    /// Inspect a request whose client address is unknown.
    fn process_unaddressed<'a>(&'a self, _request: &'a InboundRequest) -> StageFuture<'a> {
        Box::pin(async { StageVerdict::Continue })
    }
}

/// Rejects deny-listed addresses.
#[derive(Debug, Clone)]
pub struct GuardStage {
    guard: DenyListGuard,
}

impl GuardStage {
    /// Wrap a guard.
    #[must_use]
    pub const fn new(guard: DenyListGuard) -> Self {
        Self { guard }
    }
}

impl RequestStage for GuardStage {
    fn name(&self) -> &'static str {
        "guard"
    }

    fn process<'a>(&'a self, _request: &'a InboundRequest, address: IpAddr) -> StageFuture<'a> {
        Box::pin(async move {
            match self.guard.check(address).await {
                GuardDecision::Allow => StageVerdict::Continue,
                GuardDecision::Deny => StageVerdict::Reject(Rejection::Forbidden),
            }
        })
    }
}

/// Records every request that reaches it. Never rejects.
#[derive(Debug, Clone)]
pub struct RecordStage {
    recorder: Arc<RequestRecorder>,
}

impl RecordStage {
    /// Wrap a recorder.
    #[must_use]
    pub const fn new(recorder: Arc<RequestRecorder>) -> Self {
        Self { recorder }
    }
}

impl RequestStage for RecordStage {
    fn name(&self) -> &'static str {
        "record"
    }

    fn process<'a>(&'a self, request: &'a InboundRequest, address: IpAddr) -> StageFuture<'a> {
        Box::pin(async move {
            self.recorder
                .record(address, &request.path, request.received_at)
                .await;
            StageVerdict::Continue
        })
    }
}

/// Applies per-endpoint rate limits.
#[derive(Debug)]
pub struct RateLimitStage {
    limits: Vec<EndpointRateLimit>,
}

impl RateLimitStage {
    /// Create a stage over a set of endpoint limits.
    #[must_use]
    pub const fn new(limits: Vec<EndpointRateLimit>) -> Self {
        Self { limits }
    }

    fn applicable<'a>(
        &'a self,
        request: &'a InboundRequest,
    ) -> impl Iterator<Item = &'a EndpointRateLimit> + 'a {
        self.limits
            .iter()
            .filter(|l| l.applies_to(&request.path, &request.method))
    }
}

impl RequestStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn process<'a>(&'a self, request: &'a InboundRequest, address: IpAddr) -> StageFuture<'a> {
        let verdict = first_denial(
            self.applicable(request)
                .map(|l| l.check(address, request.identity.as_deref())),
        );
        Box::pin(async move { verdict })
    }

    fn process_unaddressed<'a>(&'a self, request: &'a InboundRequest) -> StageFuture<'a> {
        let verdict = match request.identity.as_deref() {
            Some(identity) => first_denial(
                self.applicable(request)
                    .map(|l| l.check_identity(identity)),
            ),
            None => StageVerdict::Continue,
        };
        Box::pin(async move { verdict })
    }
}

fn first_denial(mut decisions: impl Iterator<Item = RateDecision>) -> StageVerdict {
    decisions
        .find_map(|decision| match decision {
            RateDecision::Allow => None,
            RateDecision::Deny { retry_after } => {
                Some(StageVerdict::Reject(Rejection::TooManyRequests { retry_after }))
            }
        })
        .unwrap_or(StageVerdict::Continue)
}

/// Ordered chain of stages in front of a handler.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn RequestStage>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    #[must_use]
    pub fn stage(mut self, stage: impl RequestStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Build the standard guard, record and rate-limit chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the geolocation resolver cannot be built.
    pub fn from_config(
        config: &TrackingConfig,
        deny_list: Arc<dyn DenyList>,
        log: Arc<dyn RequestLog>,
    ) -> TrackingResult<Self> {
        let guard = DenyListGuard::from_config(deny_list, &config.guard);
        let locator = Arc::new(GeoLocator::from_config(&config.geo)?);
        let recorder = Arc::new(RequestRecorder::new(log, locator));

        let mut pipeline = Self::new()
            .stage(GuardStage::new(guard))
            .stage(RecordStage::new(recorder));

        if !config.rate_limits.is_empty() {
            let limits = config
                .rate_limits
                .iter()
                .cloned()
                .map(EndpointRateLimit::from_config)
                .collect();
            pipeline = pipeline.stage(RateLimitStage::new(limits));
        }

        Ok(pipeline)
    }

    /// Names of the configured stages, in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the stages without invoking a handler.
    ///
    /// # Errors
    ///
    /// Returns the rejection of the first stage that rejects.
    pub async fn admit(&self, request: &InboundRequest) -> Result<(), Rejection> {
        let Some(address) = client_address(&request.meta) else {
            warn!(path = %request.path, "No client address, skipping address tracking");
            for stage in &self.stages {
                if let StageVerdict::Reject(rejection) = stage.process_unaddressed(request).await {
                    debug!(stage = stage.name(), %rejection, "Request without address rejected");
                    return Err(rejection);
                }
            }
            return Ok(());
        };

        for stage in &self.stages {
            if let StageVerdict::Reject(rejection) = stage.process(request, address).await {
                debug!(ip = %address, stage = stage.name(), %rejection, "Request rejected");
                return Err(rejection);
            }
        }
        Ok(())
    }

    /// Admit a request and, if it passes, run the handler on it.
    pub async fn handle<T, F, Fut>(&self, request: InboundRequest, handler: F) -> Outcome<T>
    where
        F: FnOnce(InboundRequest) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.admit(&request).await {
            Ok(()) => Outcome::Handled(handler(request).await),
            Err(rejection) => Outcome::Rejected(rejection),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
