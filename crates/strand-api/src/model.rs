// Shared data models exchanged between nodes
// Node lifecycle status, node info snapshots and change packages

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use strand_common::{ChangeId, NodeId};

/// Lifecycle status of a cluster node
///
/// Variants are declared in rank order: a status compares greater than every
/// status declared before it, so `status >= NodeStatus::Connected` reads as
/// "reachable".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    Offline,
    Connecting,
    Connected,
    Building,
    ShuttingDown,
    Synchronizing,
    Away,
    AwaySoon,
    Ready,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Connecting => "CONNECTING",
            NodeStatus::Connected => "CONNECTED",
            NodeStatus::Building => "BUILDING",
            NodeStatus::ShuttingDown => "SHUTTING_DOWN",
            NodeStatus::Synchronizing => "SYNCHRONIZING",
            NodeStatus::Away => "AWAY",
            NodeStatus::AwaySoon => "AWAY_SOON",
            NodeStatus::Ready => "READY",
        }
    }

    /// True for every status at or above `CONNECTED`
    pub fn is_reachable(&self) -> bool {
        *self >= NodeStatus::Connected
    }

    pub fn is_away_or_soon(&self) -> bool {
        matches!(self, NodeStatus::Away | NodeStatus::AwaySoon)
    }

    /// Validates a status change of *this* node.
    ///
    /// `CONNECTING` and `CONNECTED` only describe how a peer is seen from the
    /// outside, so this node never transitions into them.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;

        if *self == next {
            return true;
        }

        match (*self, next) {
            (_, Connecting | Connected) => false,
            (Offline, Building | Synchronizing) => true,
            (Building, Synchronizing | ShuttingDown | Offline) => true,
            (Synchronizing, Ready | ShuttingDown | Offline) => true,
            (Ready, AwaySoon | ShuttingDown) => true,
            (AwaySoon, Away | Ready) => true,
            (Away, AwaySoon) => true,
            (ShuttingDown, Offline) => true,
            _ => false,
        }
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(NodeStatus::Offline),
            "CONNECTING" => Ok(NodeStatus::Connecting),
            "CONNECTED" => Ok(NodeStatus::Connected),
            "BUILDING" => Ok(NodeStatus::Building),
            "SHUTTING_DOWN" => Ok(NodeStatus::ShuttingDown),
            "SYNCHRONIZING" => Ok(NodeStatus::Synchronizing),
            "AWAY" => Ok(NodeStatus::Away),
            "AWAY_SOON" => Ok(NodeStatus::AwaySoon),
            "READY" => Ok(NodeStatus::Ready),
            _ => Err(format!("unknown node status: {}", s)),
        }
    }
}

/// Snapshot of a node as announced in `NODE_INFO` and `REQ_CONNECT`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub committed_change_id: ChangeId,
    pub stored_change_id: ChangeId,
    pub next_free_id: ChangeId,
    pub away_counter: u32,
}

impl NodeInfo {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Scope a change applies to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "id")]
pub enum ChangeScope {
    #[default]
    Cluster,
    Collection(u64),
}

impl Display for ChangeScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeScope::Cluster => write!(f, "cluster"),
            ChangeScope::Collection(id) => write!(f, "collection:{}", id),
        }
    }
}

/// A committed (or committable) change as it travels between nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePackage {
    pub id: ChangeId,
    pub node_id: NodeId,
    pub scope: ChangeScope,
    /// Serialized task operations, applied in order
    pub tasks: Vec<Vec<u8>>,
}

impl ChangePackage {
    pub fn new(id: ChangeId, node_id: NodeId, scope: ChangeScope, tasks: Vec<Vec<u8>>) -> Self {
        Self {
            id,
            node_id,
            scope,
            tasks,
        }
    }
}
