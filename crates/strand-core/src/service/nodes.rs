//! Node registry
//!
//! Owns every known cluster member (this node included) together with its
//! lifecycle status and replication progress. Status changes are published
//! through [`StatusChangeEventPublisher`] so in-flight quorum requests and
//! listeners can react to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};

use strand_api::model::{NodeInfo, NodeStatus};
use strand_common::{ChangeId, MAX_NODES, NodeId, Result, StrandError};

use super::member_event::{StatusChangeEvent, StatusChangeEventPublisher};

/// A cluster member as seen by this node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub committed_change_id: ChangeId,
    pub stored_change_id: ChangeId,
    pub next_free_id: ChangeId,
    pub away_counter: u32,
    /// Sync sessions currently referencing this node
    sync_refs: usize,
    /// Removal requested while sync sessions were still referencing the node
    removed: bool,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            status: NodeStatus::Offline,
            committed_change_id: 0,
            stored_change_id: 0,
            next_free_id: 0,
            away_counter: 0,
            sync_refs: 0,
            removed: false,
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            address: self.address.clone(),
            port: self.port,
            status: self.status,
            committed_change_id: self.committed_change_id,
            stored_change_id: self.stored_change_id,
            next_free_id: self.next_free_id,
            away_counter: self.away_counter,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Cluster health summary
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterHealthSummary {
    pub total: usize,
    pub reachable: usize,
    pub ready: usize,
    pub synchronizing: usize,
    pub away: usize,
    pub offline: usize,
}

impl ClusterHealthSummary {
    pub fn is_healthy(&self) -> bool {
        self.reachable > self.total / 2
    }
}

/// Registry of cluster members
pub struct NodeRegistry {
    this_node: NodeId,
    nodes: RwLock<BTreeMap<NodeId, Node>>,
    events: Arc<StatusChangeEventPublisher>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("this_node", &self.this_node)
            .field("member_count", &self.nodes.read().len())
            .finish()
    }
}

impl NodeRegistry {
    /// Create a registry holding only this node
    pub fn new(this: Node, events: Arc<StatusChangeEventPublisher>) -> Self {
        let this_node = this.id;
        let mut nodes = BTreeMap::new();
        nodes.insert(this.id, this);

        Self {
            this_node,
            nodes: RwLock::new(nodes),
            events,
        }
    }

    pub fn this_node_id(&self) -> NodeId {
        self.this_node
    }

    pub fn events(&self) -> &Arc<StatusChangeEventPublisher> {
        &self.events
    }

    /// Register a member; an already known id keeps its current record
    pub async fn register(&self, node: Node) -> Result<()> {
        let event = {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&node.id) {
                return Ok(());
            }
            if nodes.len() >= MAX_NODES {
                return Err(StrandError::InvalidNodeState(format!(
                    "cannot register node {}, the cluster is limited to {} members",
                    node.id, MAX_NODES
                )));
            }
            info!(node_id = node.id, "Registering node {}", node.endpoint());
            let event = StatusChangeEvent::member_join(node.id, false, node.status);
            nodes.insert(node.id, node);
            event
        };
        self.events.publish(event).await;
        Ok(())
    }

    /// Remove a peer; removal is deferred while a sync session references it
    pub async fn remove(&self, node_id: NodeId) -> Result<()> {
        if node_id == self.this_node {
            return Err(StrandError::InvalidNodeState(
                "this node cannot be removed from its own registry".to_string(),
            ));
        }

        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(&node_id) else {
                return Ok(());
            };
            if node.sync_refs > 0 {
                debug!(node_id, "Deferring removal, node is referenced by a sync session");
                node.removed = true;
                return Ok(());
            }
            let status = node.status;
            nodes.remove(&node_id);
            StatusChangeEvent::member_leave(node_id, status)
        };
        info!(node_id, "Removed node");
        self.events.publish(event).await;
        Ok(())
    }

    /// Mark a node as referenced by a sync session
    pub fn acquire_sync_ref(&self, node_id: NodeId) -> bool {
        match self.nodes.write().get_mut(&node_id) {
            Some(node) => {
                node.sync_refs += 1;
                true
            }
            None => false,
        }
    }

    /// Release a sync session reference, finishing a deferred removal
    pub async fn release_sync_ref(&self, node_id: NodeId) {
        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(&node_id) else {
                return;
            };
            node.sync_refs = node.sync_refs.saturating_sub(1);
            if !(node.removed && node.sync_refs == 0) {
                return;
            }
            let status = node.status;
            nodes.remove(&node_id);
            StatusChangeEvent::member_leave(node_id, status)
        };
        info!(node_id, "Removed node after its last sync session ended");
        self.events.publish(event).await;
    }

    pub fn get(&self, node_id: NodeId) -> Option<Node> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn this_node(&self) -> Node {
        self.nodes
            .read()
            .get(&self.this_node)
            .cloned()
            .unwrap_or_else(|| Node::new(self.this_node, "", 0))
    }

    pub fn this_info(&self) -> NodeInfo {
        self.this_node().info()
    }

    pub fn status(&self) -> NodeStatus {
        self.status_of(self.this_node).unwrap_or_default()
    }

    pub fn status_of(&self, node_id: NodeId) -> Option<NodeStatus> {
        self.nodes.read().get(&node_id).map(|n| n.status)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn all_info(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().map(Node::info).collect()
    }

    /// Ids of every peer, reachable or not
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .keys()
            .copied()
            .filter(|id| *id != self.this_node)
            .collect()
    }

    /// Peers at status `CONNECTED` or better
    pub fn reachable_peers(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.id != self.this_node && n.status.is_reachable())
            .map(|n| n.id)
            .collect()
    }

    /// Change the status of this node
    ///
    /// The transition is validated; an unchanged status is a no-op.
    pub async fn update_status(&self, status: NodeStatus) -> Result<()> {
        let event = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(&self.this_node)
                .ok_or_else(|| StrandError::InternalError("this node is missing".to_string()))?;
            let previous = node.status;
            if previous == status {
                return Ok(());
            }
            if !previous.can_transition_to(status) {
                return Err(StrandError::InvalidTransition {
                    from: previous.to_string(),
                    to: status.to_string(),
                });
            }
            node.status = status;
            StatusChangeEvent::status_change(self.this_node, true, previous, status)
        };
        self.events.publish(event).await;
        Ok(())
    }

    /// Record how a peer is seen by the transport (connecting, connected, offline)
    pub async fn set_peer_status(&self, node_id: NodeId, status: NodeStatus) {
        if node_id == self.this_node {
            warn!(node_id, "Ignoring transport status for this node");
            return;
        }
        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(&node_id) else {
                return;
            };
            let previous = node.status;
            if previous == status {
                return;
            }
            node.status = status;
            StatusChangeEvent::status_change(node_id, false, previous, status)
        };
        self.events.publish(event).await;
    }

    /// Apply a peer's `NODE_INFO`, registering it when unknown
    pub async fn update_from_info(&self, info: &NodeInfo) -> Result<()> {
        if info.id == self.this_node {
            return Ok(());
        }
        if self.get(info.id).is_none() {
            self.register(Node::new(info.id, info.address.clone(), info.port))
                .await?;
        }

        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(&info.id) else {
                return Ok(());
            };
            let previous = node.status;
            node.address = info.address.clone();
            node.port = info.port;
            node.committed_change_id = info.committed_change_id;
            node.stored_change_id = info.stored_change_id;
            node.next_free_id = info.next_free_id;
            node.away_counter = info.away_counter;
            node.status = info.status;
            (previous != info.status)
                .then(|| StatusChangeEvent::status_change(info.id, false, previous, info.status))
        };
        if let Some(event) = event {
            self.events.publish(event).await;
        }
        Ok(())
    }

    /// Record this node's replication progress
    pub fn set_this_progress(&self, committed: ChangeId, next_free_id: ChangeId) {
        if let Some(node) = self.nodes.write().get_mut(&self.this_node) {
            node.committed_change_id = committed;
            node.next_free_id = next_free_id;
        }
    }

    pub fn set_this_stored(&self, stored: ChangeId) {
        if let Some(node) = self.nodes.write().get_mut(&self.this_node) {
            node.stored_change_id = stored;
        }
    }

    pub fn away_counter(&self) -> u32 {
        self.nodes
            .read()
            .get(&self.this_node)
            .map(|n| n.away_counter)
            .unwrap_or(0)
    }

    pub fn set_away_counter(&self, counter: u32) {
        if let Some(node) = self.nodes.write().get_mut(&self.this_node) {
            node.away_counter = counter;
        }
    }

    /// Record the counter a peer announced with its away request
    pub fn set_peer_away_counter(&self, node_id: NodeId, counter: u32) {
        if let Some(node) = self.nodes.write().get_mut(&node_id) {
            node.away_counter = counter;
        }
    }

    /// True iff strictly more than half of all members are at `CONNECTED` or better
    pub fn has_quorum(&self) -> bool {
        let nodes = self.nodes.read();
        let reachable = nodes.values().filter(|n| n.status.is_reachable()).count();
        reachable > nodes.len() / 2
    }

    /// Number of accepts (this node included) a quorum request needs
    pub fn quorum_size(&self) -> usize {
        self.len() / 2 + 1
    }

    pub fn pick_random_ready_peer(&self) -> Option<NodeId> {
        let ready: Vec<NodeId> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.id != self.this_node && n.status == NodeStatus::Ready)
            .map(|n| n.id)
            .collect();
        ready.choose(&mut rand::rng()).copied()
    }

    /// A peer in `AWAY`, or failing that one in `AWAY_SOON`
    pub fn pick_away_or_away_soon_peer(&self) -> Option<NodeId> {
        let nodes = self.nodes.read();
        let peers = || nodes.values().filter(|n| n.id != self.this_node);
        peers()
            .find(|n| n.status == NodeStatus::Away)
            .or_else(|| peers().find(|n| n.status == NodeStatus::AwaySoon))
            .map(|n| n.id)
    }

    pub fn lowest_committed_id(&self) -> ChangeId {
        self.nodes
            .read()
            .values()
            .map(|n| n.committed_change_id)
            .min()
            .unwrap_or(0)
    }

    pub fn lowest_stored_id(&self) -> ChangeId {
        self.nodes
            .read()
            .values()
            .map(|n| n.stored_change_id)
            .min()
            .unwrap_or(0)
    }

    pub fn highest_committed_id(&self) -> ChangeId {
        self.nodes
            .read()
            .values()
            .map(|n| n.committed_change_id)
            .max()
            .unwrap_or(0)
    }

    /// True when any member is synchronizing
    pub fn require_sync(&self) -> bool {
        self.nodes
            .read()
            .values()
            .any(|n| n.status == NodeStatus::Synchronizing)
    }

    /// Decide whether a synchronizing node may declare itself caught up
    /// without a sync source.
    ///
    /// Refused while a peer known to be ahead is reachable. Unreachable peers
    /// might be ahead too, so each call with an unreachable peer consumes one
    /// unit of `retry_offline` and refuses until the budget is spent.
    pub fn ignore_sync(&self, retry_offline: &mut u32) -> bool {
        let nodes = self.nodes.read();
        let Some(this) = nodes.get(&self.this_node) else {
            return false;
        };

        let mut any_offline = false;
        for node in nodes.values().filter(|n| n.id != self.this_node) {
            if !node.status.is_reachable() {
                any_offline = true;
                continue;
            }
            if node.committed_change_id > this.committed_change_id {
                return false;
            }
        }

        if any_offline && *retry_offline > 0 {
            *retry_offline -= 1;
            return false;
        }
        true
    }

    /// Position of this node in the id-sorted member list, rotated by the
    /// committed change id so periodic work moves around the cluster.
    pub fn relative_index(&self, committed: ChangeId) -> usize {
        let nodes = self.nodes.read();
        let n = nodes.len().max(1);
        let position = nodes
            .keys()
            .position(|id| *id == self.this_node)
            .unwrap_or(0);
        (position + n - (committed % n as u64) as usize) % n
    }

    pub fn health_summary(&self) -> ClusterHealthSummary {
        let mut summary = ClusterHealthSummary::default();
        for node in self.nodes.read().values() {
            summary.total += 1;
            if node.status.is_reachable() {
                summary.reachable += 1;
            }
            match node.status {
                NodeStatus::Ready => summary.ready += 1,
                NodeStatus::Synchronizing => summary.synchronizing += 1,
                NodeStatus::Away | NodeStatus::AwaySoon => summary.away += 1,
                NodeStatus::Offline => summary.offline += 1,
                _ => {}
            }
        }
        summary
    }
}
