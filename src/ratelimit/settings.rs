//! Per-limiter settings: what is metered, how it is scoped, how long a window lasts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{FleetQuotaError, Result};

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Header carrying the remaining request quota.
pub const REMAINING_REQUESTS_HEADER: &str = "x-ratelimit-remaining-requests";
/// Header carrying the remaining token quota.
pub const REMAINING_TOKENS_HEADER: &str = "x-ratelimit-remaining-tokens";

/// What a limiter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// One unit per successful request
    Requests,
    /// Tokens reported by the downstream response
    Tokens,
}

impl MetricKind {
    /// Usage known to be spent by the pending request before it runs.
    ///
    /// A request always costs one request. Its token cost is only known
    /// once the downstream has answered.
    pub fn pending_cost(&self) -> u64 {
        match self {
            MetricKind::Requests => 1,
            MetricKind::Tokens => 0,
        }
    }

    /// Usage to record for a successful response, if measurable.
    pub fn measure(&self, total_tokens: Option<u64>) -> Option<u64> {
        match self {
            MetricKind::Requests => Some(1),
            MetricKind::Tokens => total_tokens,
        }
    }

    /// Name of the metadata field reporting remaining quota.
    pub fn remaining_header(&self) -> &'static str {
        match self {
            MetricKind::Requests => REMAINING_REQUESTS_HEADER,
            MetricKind::Tokens => REMAINING_TOKENS_HEADER,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Requests => "requests",
            MetricKind::Tokens => "tokens",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a quota is shared by everyone or partitioned per principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// One bucket for every caller
    Global,
    /// One bucket per resolved principal
    #[serde(alias = "per_consumer")]
    PerPrincipal,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Global => "global",
            LimitScope::PerPrincipal => "per-principal",
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the limiter step does when the usage store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Surface the store error to the pipeline caller
    #[default]
    Propagate,
    /// Admit the request and log the failure
    FailOpen,
    /// Reject the request as temporarily unavailable
    FailClosed,
}

/// Validated settings for one limiter step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSettings {
    step_name: String,
    window: Duration,
    limit: u64,
    scope: LimitScope,
    metric: MetricKind,
    on_store_error: StoreFailurePolicy,
    store_timeout: Duration,
}

impl LimiterSettings {
    /// Create settings, rejecting windows shorter than a second and unnamed steps.
    pub fn new(
        step_name: impl Into<String>,
        window: Duration,
        limit: u64,
        scope: LimitScope,
        metric: MetricKind,
    ) -> Result<Self> {
        let step_name = step_name.into();
        if step_name.trim().is_empty() {
            return Err(FleetQuotaError::Config(
                "limiter step name must not be empty".to_string(),
            ));
        }
        if window.as_secs() == 0 {
            return Err(FleetQuotaError::Config(format!(
                "limiter '{}' window must be at least one second",
                step_name
            )));
        }

        Ok(Self {
            step_name,
            window: Duration::from_secs(window.as_secs()),
            limit,
            scope,
            metric,
            on_store_error: StoreFailurePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    /// Set the store failure policy.
    pub fn with_store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    /// Set the per-operation store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn scope(&self) -> LimitScope {
        self.scope
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn on_store_error(&self) -> StoreFailurePolicy {
        self.on_store_error
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }
}
