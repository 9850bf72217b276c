use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetquota::config::FleetQuotaConfig;
use fleetquota::mesh::{Cluster, GossipStore};

/// Fleet member node hosting the gossip usage store.
///
/// The binary joins the mesh, keeps this node's usage state swept and leaves
/// cleanly on shutdown. Limiter steps run inside the serving process that
/// embeds the crate; the binary only checks that their configuration is valid.
#[derive(Debug, Parser)]
#[command(name = "fleetquota", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node identity, overriding the configuration
    #[arg(long)]
    node_id: Option<String>,

    /// Gossip listen address, overriding the configuration
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Seed node to join; may be repeated
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Fleetquota node");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => FleetQuotaConfig::load(path)?,
        None => FleetQuotaConfig::default(),
    };
    if args.node_id.is_some() {
        config.node.node_id = args.node_id.clone();
    }
    if let Some(listen_addr) = args.listen_addr {
        config.mesh.listen_addr = listen_addr;
    }
    config.mesh.seed_nodes.extend(args.seeds.iter().cloned());

    let node = config.node.identity();
    info!(node = %node, limiters = config.limiters.len(), "Configuration loaded");

    // Refuse to join the fleet with a limiter configuration embedders would reject
    for settings in config.limiter_settings()? {
        info!(
            step = %settings.step_name(),
            limit = settings.limit(),
            window_secs = settings.window().as_secs(),
            scope = %settings.scope(),
            metric = %settings.metric(),
            "Limiter configuration valid"
        );
    }

    let cluster = Arc::new(Cluster::start(config.mesh.cluster_config(&node)).await?);
    let store = Arc::new(GossipStore::new(cluster.clone()));

    // Periodically drop our expired contributions from gossip state
    let sweeper = {
        let store = store.clone();
        let interval = config.mesh.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.purge_expired().await;
            }
        })
    };

    shutdown_signal().await;

    sweeper.abort();
    let _ = sweeper.await;
    drop(store);

    match Arc::try_unwrap(cluster) {
        Ok(cluster) => cluster.shutdown().await?,
        Err(_) => warn!("Cluster still referenced, skipping graceful shutdown"),
    }

    info!("Fleetquota node stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
