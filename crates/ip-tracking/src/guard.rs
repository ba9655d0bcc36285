//! Deny-list admission check.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::{FailurePolicy, GuardConfig};
use crate::store::DenyList;

/// Result of a deny-list check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// The address may proceed.
    Allow,
    /// The address must be rejected.
    Deny,
}

impl GuardDecision {
    /// Check if the decision allows the request.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Rejects addresses present on the deny-list.
///
/// The check is an exact match on the canonical address with no side
/// effects. When the store cannot be read the configured [`FailurePolicy`]
/// decides.
#[derive(Clone)]
pub struct DenyListGuard {
    deny_list: Arc<dyn DenyList>,
    policy: FailurePolicy,
}

impl DenyListGuard {
    /// Create a guard with the default (fail-open) policy.
    #[must_use]
    pub fn new(deny_list: Arc<dyn DenyList>) -> Self {
        Self {
            deny_list,
            policy: FailurePolicy::default(),
        }
    }

    /// Create a guard from configuration.
    #[must_use]
    pub fn from_config(deny_list: Arc<dyn DenyList>, config: &GuardConfig) -> Self {
        Self {
            deny_list,
            policy: config.failure_policy,
        }
    }

    /// Set the store-failure policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Configured store-failure policy.
    #[must_use]
    pub const fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Decide whether an address may proceed.
    pub async fn check(&self, ip: IpAddr) -> GuardDecision {
        let ip = ip.to_canonical();
        match self.deny_list.contains(ip).await {
            Ok(true) => {
                warn!(ip = %ip, "Rejected denied address");
                GuardDecision::Deny
            }
            Ok(false) => {
                debug!(ip = %ip, "Address not on deny-list");
                GuardDecision::Allow
            }
            Err(e) => match self.policy {
                FailurePolicy::Open => {
                    error!(ip = %ip, error = %e, "Deny-list unavailable, failing open");
                    GuardDecision::Allow
                }
                FailurePolicy::Closed => {
                    error!(ip = %ip, error = %e, "Deny-list unavailable, failing closed");
                    GuardDecision::Deny
                }
            },
        }
    }
}

impl std::fmt::Debug for DenyListGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenyListGuard")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
