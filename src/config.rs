//! Configuration management for Fleetquota.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FleetQuotaError, Result};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{
    LimitScope, LimiterSettings, MetricKind, NodeIdentity, StoreFailurePolicy,
};

/// Prefix of environment variables overriding file configuration,
/// e.g. `FLEETQUOTA__MESH__CLUSTER_ID`.
pub const ENV_PREFIX: &str = "FLEETQUOTA";

/// Main configuration for the Fleetquota service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetQuotaConfig {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Gossip mesh configuration
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Limiter steps, in pipeline order
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier; falls back to the hostname, then a random UUID
    #[serde(default)]
    pub node_id: Option<String>,
}

impl NodeConfig {
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::resolve(self.node_id.as_deref())
    }
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Address to listen on for gossip
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes used to join the cluster
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Cluster identifier shared by all fleet members
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Grace period before a dead node's state is dropped, in seconds
    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,

    /// How often expired usage records are purged, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl MeshConfig {
    /// Build the cluster configuration for a node.
    pub fn cluster_config(&self, node: &NodeIdentity) -> ClusterConfig {
        ClusterConfig {
            node_id: node.to_string(),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "fleetquota".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    30
}

/// Configuration of one limiter step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Step name, part of every quota key
    pub step_name: String,

    /// Window length in seconds
    pub window_secs: u64,

    /// Usage allowed per window
    pub limit: u64,

    /// Global or per-principal buckets
    #[serde(default = "default_scope")]
    pub scope: LimitScope,

    /// Requests or tokens
    #[serde(default = "default_metric")]
    pub metric: MetricKind,

    /// Behaviour when the usage store is unreachable
    #[serde(default)]
    pub on_store_error: StoreFailurePolicy,

    /// Bound on each store operation in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_scope() -> LimitScope {
    LimitScope::Global
}

fn default_metric() -> MetricKind {
    MetricKind::Requests
}

fn default_store_timeout() -> u64 {
    500
}

impl TryFrom<&LimiterConfig> for LimiterSettings {
    type Error = FleetQuotaError;

    fn try_from(config: &LimiterConfig) -> Result<Self> {
        Ok(LimiterSettings::new(
            config.step_name.clone(),
            Duration::from_secs(config.window_secs),
            config.limit,
            config.scope,
            config.metric,
        )?
        .with_store_failure_policy(config.on_store_error)
        .with_store_timeout(Duration::from_millis(config.store_timeout_ms)))
    }
}

impl FleetQuotaConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FleetQuotaError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file, applying `FLEETQUOTA__*`
    /// environment overrides on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(FleetQuotaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file {} not found", path.display()),
            )));
        }

        ::config::Config::builder()
            .add_source(::config::File::new(
                &path.to_string_lossy(),
                ::config::FileFormat::Yaml,
            ))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FleetQuotaError::Config(e.to_string()))
    }

    /// Validate every limiter and return their settings in pipeline order.
    pub fn limiter_settings(&self) -> Result<Vec<LimiterSettings>> {
        self.limiters.iter().map(LimiterSettings::try_from).collect()
    }
}
