//! Strand Core - Change replication and cluster synchronization
//!
//! This crate provides:
//! - Node registry and status state machine
//! - Change sequencing with quorum-agreed change ids
//! - Archive of committed changes with on-disk spill
//! - Three-phase synchronization of lagging nodes
//! - Away mode for mutually exclusive maintenance

pub mod model;
pub mod service;

// Re-export cluster module
pub mod cluster {
    pub use crate::service::cluster::{
        ClusterConfig, ClusterContext, ClusterStores, ProtocolTimeouts, load_node_state,
    };
    pub use crate::service::nodes::ClusterHealthSummary;
}

// Re-export commonly used types
pub use model::{Configuration, NodeStateFile};
pub use service::changes::{ChangeApplier, FatalHandler, LoggingApplier, exit_on_fatal};
pub use service::counters::{Counter, Counters};
pub use service::{ClusterConfig, ClusterContext, ClusterStores, ProtocolTimeouts};
pub use service::transport::{LocalNetwork, NodeMessageHandler, NodeTransport};

// Re-export common functions
pub use strand_common::local_ip;
