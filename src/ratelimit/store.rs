//! Usage store abstraction and the in-memory implementation.
//!
//! A usage record is an expiring hash: one field per node, each holding that
//! node's running total for the window. Nodes only ever write their own
//! field, so concurrent writers never contend on the same value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use super::clock::{Clock, SystemClock};

/// Infrastructure failures talking to the usage store.
///
/// These are never folded into "zero usage"; the caller decides whether to
/// fail open or closed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("node {node} may not write field {field}")]
    ForeignField { node: String, field: String },
    #[error("malformed value {value:?} in field {field}")]
    Malformed { field: String, value: String },
}

/// Trait for usage store implementations.
///
/// This abstracts over the in-process `MemoryStore` and the gossip-backed
/// `GossipStore` so the limiter step can work with either.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Read one node's contribution. A missing key or field is `None`.
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<u64>, StoreError>;

    /// Sum every node's contribution. A missing key is zero usage.
    async fn get_all_and_sum(&self, key: &str) -> Result<u64, StoreError>;

    /// Overwrite one node's contribution with its latest running total.
    async fn set_field(&self, key: &str, field: &str, value: u64) -> Result<(), StoreError>;

    /// Set or refresh the instant after which the whole record disappears.
    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Bound a store operation so a hung connection surfaces as a timeout.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

#[derive(Debug, Default)]
struct UsageRecord {
    fields: HashMap<String, u64>,
    expires_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Expiring hash store held in process memory.
///
/// Shared by reference between limiter steps it behaves like a single shared
/// store instance for every simulated node. Expired records are dropped on
/// access and swept on every write according to the injected clock.
pub struct MemoryStore {
    records: DashMap<String, UsageRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.records.iter().filter(|r| !r.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            trace!(purged, "Purged expired usage records");
        }
        purged
    }

    /// Drop a record if it has expired, returning whether it did.
    fn evict_if_expired(&self, key: &str) -> bool {
        let now = self.clock.now();
        let evicted = self.records.remove_if(key, |_, record| record.is_expired(now));
        if evicted.is_some() {
            trace!(key = %key, "Usage record expired");
        }
        evicted.is_some()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<u64>, StoreError> {
        self.evict_if_expired(key);
        Ok(self
            .records
            .get(key)
            .and_then(|record| record.fields.get(field).copied()))
    }

    async fn get_all_and_sum(&self, key: &str) -> Result<u64, StoreError> {
        self.evict_if_expired(key);
        Ok(self
            .records
            .get(key)
            .map(|record| record.fields.values().fold(0u64, |acc, v| acc.saturating_add(*v)))
            .unwrap_or(0))
    }

    async fn set_field(&self, key: &str, field: &str, value: u64) -> Result<(), StoreError> {
        self.purge_expired();
        self.records
            .entry(key.to_string())
            .or_default()
            .fields
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.evict_if_expired(key) {
            return Ok(());
        }
        if let Some(mut record) = self.records.get_mut(key) {
            record.expires_at = Some(at);
        }
        Ok(())
    }
}
