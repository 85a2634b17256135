// Core services for change replication and cluster synchronization

pub mod archive;
pub mod away;
pub mod changes;
pub mod cluster;
pub mod cluster_client;
pub mod counters;
pub mod member_event;
pub mod nodes;
pub mod quorum;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use cluster::{ClusterConfig, ClusterContext, ClusterStores, ProtocolTimeouts};
