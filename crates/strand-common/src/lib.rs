//! Strand Common - Shared types, errors, and utilities
//!
//! This crate provides the foundational types used across all Strand components:
//! - Identifier aliases for nodes and changes
//! - Error types and error codes
//! - Utility functions

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, ErrorKind, StrandError};
pub use utils::{local_ip, now_millis, parse_peer, plural};

/// Cluster-wide node identifier
pub type NodeId = u32;

/// Cluster-wide change identifier
pub type ChangeId = u64;

/// Result type used by every Strand crate
pub type Result<T> = std::result::Result<T, StrandError>;

/// Maximum number of members in a cluster
pub const MAX_NODES: usize = 64;

/// Default port for node-to-node connections
pub const DEFAULT_NODE_PORT: u16 = 9220;
