//! Recording of this node's contribution after a successful downstream call.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::key::QuotaKey;
use super::node::NodeIdentity;
use super::settings::DEFAULT_STORE_TIMEOUT;
use super::store::{bounded, StoreError, UsageStore};
use super::window::Window;

/// Result of recording usage for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedUsage {
    /// This node's total before the write
    pub prior: u64,
    /// This node's total after the write
    pub total: u64,
}

/// Writes this node's running total for a window and keeps the record alive
/// until the window ends.
///
/// Every store round trip is bounded by its own timeout.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn UsageStore>,
    node: NodeIdentity,
    timeout: Duration,
}

impl UsageRecorder {
    /// Create a recorder writing the field owned by `node`.
    pub fn new(store: Arc<dyn UsageStore>, node: NodeIdentity) -> Self {
        Self {
            store,
            node,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound each store call by `timeout` instead of the default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// Add `delta` to this node's total for `key`.
    ///
    /// The node's current total is read again right before the overwrite so
    /// that the base is as fresh as possible. Concurrent requests on this node
    /// can still interleave between that read and the write; the last writer
    /// wins and the earlier contribution is lost. That undercount is accepted
    /// rather than serialised with a per-key lock.
    pub async fn record(
        &self,
        key: &QuotaKey,
        delta: u64,
        window: &Window,
    ) -> Result<RecordedUsage, StoreError> {
        let store_key = key.to_store_key();
        let prior = bounded(
            self.timeout,
            self.store.get_field(&store_key, self.node.as_str()),
        )
        .await?
        .unwrap_or(0);
        let total = prior.saturating_add(delta);

        self.commit(key, total, window).await?;

        debug!(
            key = %store_key,
            node = %self.node,
            prior = prior,
            total = total,
            "Recorded node usage"
        );

        Ok(RecordedUsage { prior, total })
    }

    /// Write an already computed total and refresh the record's expiry.
    ///
    /// Writing the same total twice leaves the aggregate unchanged, so a
    /// commit whose expiry step failed or timed out can be repeated safely.
    pub async fn commit(&self, key: &QuotaKey, total: u64, window: &Window) -> Result<(), StoreError> {
        let store_key = key.to_store_key();
        bounded(
            self.timeout,
            self.store.set_field(&store_key, self.node.as_str(), total),
        )
        .await?;
        // The store cannot set a TTL atomically with the write.
        bounded(self.timeout, self.store.expire_at(&store_key, window.end())).await
    }
}
