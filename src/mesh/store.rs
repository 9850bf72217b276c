//! Usage store backed by the gossip cluster.
//!
//! Every node's contribution lives in its own chitchat node state under the
//! quota key, so the node id is the field name and no node can ever write
//! another's value. Expiry is tracked locally for our own keys and applied by
//! `purge_expired`. Values left behind by other nodes are never read once
//! their window is over because the window id is part of the key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::cluster::Cluster;
use crate::ratelimit::{Clock, StoreError, SystemClock, UsageStore};

/// A `UsageStore` whose records are gossiped across the cluster.
pub struct GossipStore {
    cluster: Arc<Cluster>,
    /// Expiry of keys this node has published
    expiries: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl GossipStore {
    /// Create a store on top of a running cluster node.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_clock(cluster, Arc::new(SystemClock))
    }

    pub fn with_clock(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            expiries: DashMap::new(),
            clock,
        }
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Delete this node's values for every key past its expiry.
    ///
    /// Returns the number of keys removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.expiries.remove(key);
        }
        self.cluster.delete_local(&expired).await;

        if !expired.is_empty() {
            debug!(count = expired.len(), "Purged expired usage records");
        }
        expired.len()
    }

    fn is_expired(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.expiries.get(key).map_or(false, |at| *at <= now)
    }
}

fn parse_value(field: &str, value: &str) -> Result<u64, StoreError> {
    value.parse().map_err(|_| StoreError::Malformed {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[async_trait]
impl UsageStore for GossipStore {
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<u64>, StoreError> {
        if field == self.cluster.node_id() && self.is_expired(key) {
            return Ok(None);
        }
        match self.cluster.node_value(key, field).await {
            Some(value) => parse_value(field, &value).map(Some),
            None => Ok(None),
        }
    }

    async fn get_all_and_sum(&self, key: &str) -> Result<u64, StoreError> {
        let own_expired = self.is_expired(key);
        let mut total: u64 = 0;

        for (node_id, value) in self.cluster.values(key).await {
            if own_expired && node_id == self.cluster.node_id() {
                continue;
            }
            let count = parse_value(&node_id, &value).map_err(|e| {
                warn!(key = %key, node = %node_id, value = %value, "Malformed usage value");
                e
            })?;
            total = total.saturating_add(count);
        }

        Ok(total)
    }

    async fn set_field(&self, key: &str, field: &str, value: u64) -> Result<(), StoreError> {
        if field != self.cluster.node_id() {
            return Err(StoreError::ForeignField {
                node: self.cluster.node_id().to_string(),
                field: field.to_string(),
            });
        }

        self.purge_expired().await;
        self.cluster.set_local(key, value).await;
        Ok(())
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.cluster.node_value(key, self.cluster.node_id()).await.is_some() {
            self.expiries.insert(key.to_string(), at);
        }
        Ok(())
    }
}
