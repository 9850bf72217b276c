//! Error types for the Fleetquota service.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::ratelimit::StoreError;

/// Main error type for Fleetquota operations.
#[derive(Error, Debug)]
pub enum FleetQuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared usage store errors
    #[error("Usage store error: {0}")]
    Store(#[from] StoreError),

    /// Failures reported by the downstream pipeline
    #[error("Downstream error: {0}")]
    Downstream(String),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Fleetquota operations.
pub type Result<T> = std::result::Result<T, FleetQuotaError>;
