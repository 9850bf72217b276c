//! Quota key generation.

use std::fmt;

use super::settings::{LimitScope, LimiterSettings, MetricKind};
use super::window::Window;

/// Principal segment used when a bucket is not partitioned by caller.
pub const ALL_PRINCIPALS: &str = "all";

/// A key that uniquely identifies one quota bucket in one window.
///
/// Every node computing the same logical bucket builds the same key, and keys
/// from different windows never collide, so usage never carries over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    /// Pipeline the limiter step belongs to
    pub pipeline: String,
    /// Limiter step name
    pub step: String,
    /// Metered quantity
    pub metric: MetricKind,
    /// Bucket partitioning
    pub scope: LimitScope,
    /// Window length in seconds
    pub window_secs: u64,
    /// Window id since the epoch
    pub window_id: u64,
    /// Principal, or `all` for unpartitioned buckets
    pub principal: String,
}

impl QuotaKey {
    /// Build the key for a request.
    ///
    /// Global limiters ignore the principal. Per-principal limiters fall back
    /// to the shared `all` bucket when no principal was resolved.
    pub fn new(
        pipeline: &str,
        settings: &LimiterSettings,
        principal: Option<&str>,
        window: &Window,
    ) -> Self {
        let principal = match settings.scope() {
            LimitScope::Global => ALL_PRINCIPALS,
            LimitScope::PerPrincipal => principal
                .filter(|p| !p.is_empty())
                .unwrap_or(ALL_PRINCIPALS),
        };

        Self {
            pipeline: pipeline.to_string(),
            step: settings.step_name().to_string(),
            metric: settings.metric(),
            scope: settings.scope(),
            window_secs: window.duration_secs(),
            window_id: window.id(),
            principal: principal.to_string(),
        }
    }

    /// Convert to the key addressed in the usage store.
    /// Format: "quota|{pipeline}|{step}|{metric}|{scope}|{window_secs}|{window_id}|{principal}"
    pub fn to_store_key(&self) -> String {
        format!(
            "quota|{}|{}|{}|{}|{}|{}|{}",
            self.pipeline,
            self.step,
            self.metric,
            self.scope,
            self.window_secs,
            self.window_id,
            self.principal
        )
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn settings(scope: LimitScope, metric: MetricKind) -> LimiterSettings {
        LimiterSettings::new("limiter", Duration::from_secs(60), 100, scope, metric).unwrap()
    }

    fn window() -> Window {
        Window::containing(
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 2, 30).unwrap(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_global_key_format() {
        let key = QuotaKey::new(
            "chat",
            &settings(LimitScope::Global, MetricKind::Requests),
            Some("alice"),
            &window(),
        );
        assert_eq!(key.to_store_key(), "quota|chat|limiter|requests|global|60|2|all");
        assert_eq!(key.to_string(), key.to_store_key());
    }

    #[test]
    fn test_per_principal_key() {
        let settings = settings(LimitScope::PerPrincipal, MetricKind::Tokens);
        let alice = QuotaKey::new("chat", &settings, Some("alice"), &window());
        let bob = QuotaKey::new("chat", &settings, Some("bob"), &window());
        let anonymous = QuotaKey::new("chat", &settings, None, &window());

        assert_eq!(alice.to_store_key(), "quota|chat|limiter|tokens|per-principal|60|2|alice");
        assert_ne!(alice, bob);
        assert_eq!(anonymous.principal, ALL_PRINCIPALS);
    }

    #[test]
    fn test_keys_differ_across_windows() {
        let settings = settings(LimitScope::Global, MetricKind::Requests);
        let current = window();
        let a = QuotaKey::new("chat", &settings, None, &current);
        let b = QuotaKey::new("chat", &settings, None, &current.next());
        assert_ne!(a.to_store_key(), b.to_store_key());
    }

    #[test]
    fn test_keys_differ_across_configuration() {
        let requests = QuotaKey::new(
            "chat",
            &settings(LimitScope::Global, MetricKind::Requests),
            None,
            &window(),
        );
        let tokens = QuotaKey::new(
            "chat",
            &settings(LimitScope::Global, MetricKind::Tokens),
            None,
            &window(),
        );
        let per_principal = QuotaKey::new(
            "chat",
            &settings(LimitScope::PerPrincipal, MetricKind::Requests),
            None,
            &window(),
        );
        let other_pipeline = QuotaKey::new(
            "embeddings",
            &settings(LimitScope::Global, MetricKind::Requests),
            None,
            &window(),
        );

        assert_ne!(requests, tokens);
        assert_ne!(requests, per_principal);
        assert_ne!(requests, other_pipeline);
    }

    #[test]
    fn test_key_is_stable() {
        let settings = settings(LimitScope::PerPrincipal, MetricKind::Requests);
        let key1 = QuotaKey::new("chat", &settings, Some("alice"), &window());
        let key2 = QuotaKey::new("chat", &settings, Some("alice"), &window());
        assert_eq!(key1, key2);
    }
}
