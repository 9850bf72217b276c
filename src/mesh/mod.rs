//! Peer mesh networking module using Chitchat.
//!
//! Fleet members gossip their own usage contributions to each other, which
//! makes the cluster itself usable as the shared usage store.

mod cluster;
mod store;

pub use cluster::{Cluster, ClusterConfig, ClusterError};
pub use store::GossipStore;
