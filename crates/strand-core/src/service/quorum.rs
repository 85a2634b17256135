//! Quorum requests
//!
//! A node that wants a new change id (or permission to go away) asks every
//! reachable peer and decides as soon as the answers so far settle it: a
//! collision or rejection ends the request, and so does a majority of accepts. Two nodes asking for the same id
//! at the same time are resolved by [`tie_break`], a pure function every node
//! evaluates identically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use strand_api::model::NodeStatus;
use strand_api::node::{NodeRequest, NodeResponse};
use strand_common::{ChangeId, NodeId};

use super::cluster::ProtocolTimeouts;
use super::nodes::NodeRegistry;
use super::transport::NodeTransport;

/// Tie-break value of `node_id` for `change_id`; the lower value wins
pub fn tie_break(node_id: NodeId, change_id: ChangeId, cluster_size: usize) -> u64 {
    let size = cluster_size.max(1) as u64;
    (node_id as u64 % size + change_id % size) % size
}

/// True when `node_id` beats `other` for `change_id`
///
/// Equal values are decided by the lower node id, so exactly one of two
/// distinct nodes wins.
pub fn wins_tie_break(
    node_id: NodeId,
    other: NodeId,
    change_id: ChangeId,
    cluster_size: usize,
) -> bool {
    let mine = tie_break(node_id, change_id, cluster_size);
    let theirs = tie_break(other, change_id, cluster_size);
    mine < theirs || (mine == theirs && node_id < other)
}

/// What a quorum is asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumKind {
    ChangeId(ChangeId),
    Away { counter: u32 },
}

impl QuorumKind {
    fn request(&self, this_node: NodeId) -> NodeRequest {
        match *self {
            QuorumKind::ChangeId(change_id) => NodeRequest::ChangeId { change_id },
            QuorumKind::Away { counter } => NodeRequest::Away {
                node_id: this_node,
                counter,
            },
        }
    }

    fn timeout(&self, timeouts: &ProtocolTimeouts) -> Duration {
        match self {
            QuorumKind::ChangeId(_) => timeouts.change_id,
            QuorumKind::Away { .. } => timeouts.away,
        }
    }

    /// Statuses this node may hold while the request is in flight
    fn allows(&self, status: NodeStatus) -> bool {
        match self {
            QuorumKind::ChangeId(_) => {
                matches!(status, NodeStatus::Ready | NodeStatus::Synchronizing)
            }
            QuorumKind::Away { .. } => matches!(
                status,
                NodeStatus::Ready | NodeStatus::Synchronizing | NodeStatus::AwaySoon
            ),
        }
    }
}

/// Answer of a single peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerOutcome {
    Accepted,
    Rejected,
    Collision(NodeId),
    /// Timed out or unreachable; not counted either way
    NoResponse,
}

impl From<&NodeResponse> for PeerOutcome {
    fn from(response: &NodeResponse) -> Self {
        match response {
            NodeResponse::Accept => PeerOutcome::Accepted,
            NodeResponse::Collision { node_id } => PeerOutcome::Collision(*node_id),
            _ => PeerOutcome::Rejected,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumDecision {
    Accepted,
    Rejected,
    /// Another node holds the id, retry with a fresh one
    Collision { node_id: NodeId },
    /// Too few accepts
    Lost,
    /// This node changed status while the request was in flight
    Cancelled,
}

/// One request in flight
#[derive(Debug)]
pub struct QuorumRequest {
    pub kind: QuorumKind,
    /// Members needed, this node included
    pub quorum_size: usize,
    pub outcomes: BTreeMap<NodeId, PeerOutcome>,
}

impl QuorumRequest {
    pub fn new(kind: QuorumKind, quorum_size: usize, peers: &[NodeId]) -> Self {
        Self {
            kind,
            quorum_size,
            outcomes: peers
                .iter()
                .map(|peer| (*peer, PeerOutcome::NoResponse))
                .collect(),
        }
    }

    pub fn record(&mut self, peer: NodeId, outcome: PeerOutcome) {
        self.outcomes.insert(peer, outcome);
    }

    pub fn accepted(&self) -> usize {
        1 + self
            .outcomes
            .values()
            .filter(|o| **o == PeerOutcome::Accepted)
            .count()
    }

    /// Decision reachable from the answers recorded so far, `None` while more
    /// answers could still change it
    pub fn settled(&self) -> Option<QuorumDecision> {
        match self.decide() {
            QuorumDecision::Lost => None,
            decision => Some(decision),
        }
    }

    /// A collision outranks a rejection: the id is taken and a fresh one may
    /// still succeed.
    pub fn decide(&self) -> QuorumDecision {
        if let Some(node_id) = self.outcomes.values().find_map(|o| match o {
            PeerOutcome::Collision(node_id) => Some(*node_id),
            _ => None,
        }) {
            return QuorumDecision::Collision { node_id };
        }
        if self.outcomes.values().any(|o| *o == PeerOutcome::Rejected) {
            return QuorumDecision::Rejected;
        }
        if self.accepted() >= self.quorum_size {
            QuorumDecision::Accepted
        } else {
            QuorumDecision::Lost
        }
    }
}

/// Sends quorum requests to peers
pub struct QuorumCoordinator {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    timeouts: ProtocolTimeouts,
}

impl QuorumCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        timeouts: ProtocolTimeouts,
    ) -> Self {
        Self {
            registry,
            transport,
            timeouts,
        }
    }

    /// Ask every reachable peer and decide once the answers settle the request
    ///
    /// Peers that have not answered by then are left to finish in the
    /// background; their answers no longer affect the decision.
    pub async fn request(&self, kind: QuorumKind) -> QuorumDecision {
        let this_node = self.registry.this_node_id();
        if !kind.allows(self.registry.status()) {
            return QuorumDecision::Cancelled;
        }

        let peers = self.registry.reachable_peers();
        let mut quorum = QuorumRequest::new(kind, self.registry.quorum_size(), &peers);
        if 1 + peers.len() < quorum.quorum_size {
            warn!(
                "Quorum request {:?} needs {} member(s), only {} reachable",
                kind,
                quorum.quorum_size,
                1 + peers.len()
            );
            return QuorumDecision::Lost;
        }

        let mut events = self.registry.events().subscribe();
        let request = kind.request(this_node);
        let timeout = kind.timeout(&self.timeouts);
        let mut pending: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let peer = *peer;
                let request = request.clone();
                let transport = self.transport.clone();
                async move { (peer, transport.request(peer, request, timeout).await) }
            })
            .collect();

        while !pending.is_empty() {
            if let Some(decision) = quorum.settled() {
                debug!(
                    accepted = quorum.accepted(),
                    needed = quorum.quorum_size,
                    outstanding = pending.len(),
                    "Quorum request {:?} settled early: {:?}",
                    kind,
                    decision
                );
                tokio::spawn(async move { while pending.next().await.is_some() {} });
                return decision;
            }
            tokio::select! {
                Some((peer, result)) = pending.next() => {
                    let outcome = match &result {
                        Ok(response) => PeerOutcome::from(response),
                        Err(e) => {
                            debug!(peer, "No quorum answer: {}", e);
                            PeerOutcome::NoResponse
                        }
                    };
                    quorum.record(peer, outcome);
                }
                Ok(event) = events.recv() => {
                    if event.is_self && !kind.allows(event.current) {
                        info!("Quorum request {:?} cancelled, status is now {}", kind, event.current);
                        return QuorumDecision::Cancelled;
                    }
                }
            }
            if !kind.allows(self.registry.status()) {
                return QuorumDecision::Cancelled;
            }
        }

        let decision = quorum.decide();
        debug!(
            accepted = quorum.accepted(),
            needed = quorum.quorum_size,
            "Quorum request {:?} decided: {:?}",
            kind,
            decision
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;

    use strand_api::node::NodeMessage;

    use super::super::member_event::StatusChangeEventPublisher;
    use super::super::nodes::Node;
    use super::super::transport::{LocalNetwork, NodeMessageHandler};

    /// Answers every request after `delay`
    struct SlowPeer {
        delay: Duration,
        answer: NodeResponse,
    }

    #[async_trait]
    impl NodeMessageHandler for SlowPeer {
        async fn on_request(&self, _from: NodeId, _request: NodeRequest) -> NodeResponse {
            tokio::time::sleep(self.delay).await;
            self.answer.clone()
        }

        async fn on_message(&self, _from: NodeId, _message: NodeMessage) {}
    }

    /// Node 0 in a three node cluster, peers 1 and 2 answering as given
    async fn coordinator(
        peers: [(Duration, NodeResponse); 2],
    ) -> (QuorumCoordinator, Vec<Arc<dyn NodeMessageHandler>>) {
        let mut this = Node::new(0, "127.0.0.1", 9220);
        this.status = NodeStatus::Ready;
        let registry = Arc::new(NodeRegistry::new(
            this,
            Arc::new(StatusChangeEventPublisher::new(64)),
        ));

        let network = LocalNetwork::new();
        let mut handlers = Vec::new();
        for (i, (delay, answer)) in peers.into_iter().enumerate() {
            let id = i as NodeId + 1;
            let mut node = Node::new(id, "127.0.0.1", 9220 + id as u16);
            node.status = NodeStatus::Ready;
            registry.register(node).await.unwrap();

            let handler: Arc<dyn NodeMessageHandler> = Arc::new(SlowPeer { delay, answer });
            network.attach(id, Arc::downgrade(&handler));
            handlers.push(handler);
        }

        let coordinator =
            QuorumCoordinator::new(registry, network.transport(0), ProtocolTimeouts::default());
        (coordinator, handlers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_majority_does_not_wait_for_hung_peer() {
        let (coordinator, _handlers) = coordinator([
            (Duration::ZERO, NodeResponse::Accept),
            (Duration::from_secs(3600), NodeResponse::Accept),
        ])
        .await;

        let started = tokio::time::Instant::now();
        let decision = coordinator.request(QuorumKind::ChangeId(1)).await;
        assert_eq!(decision, QuorumDecision::Accepted);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reject_does_not_undo_majority() {
        let (coordinator, _handlers) = coordinator([
            (Duration::ZERO, NodeResponse::Accept),
            (Duration::from_secs(1), NodeResponse::Reject),
        ])
        .await;

        assert_eq!(
            coordinator.request(QuorumKind::ChangeId(7)).await,
            QuorumDecision::Accepted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collision_ends_request_early() {
        let (coordinator, _handlers) = coordinator([
            (Duration::from_secs(3600), NodeResponse::Accept),
            (Duration::ZERO, NodeResponse::Collision { node_id: 2 }),
        ])
        .await;

        let started = tokio::time::Instant::now();
        assert_eq!(
            coordinator.request(QuorumKind::ChangeId(3)).await,
            QuorumDecision::Collision { node_id: 2 }
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peers_lose_quorum() {
        let (coordinator, _handlers) = coordinator([
            (Duration::from_secs(3600), NodeResponse::Accept),
            (Duration::from_secs(3600), NodeResponse::Accept),
        ])
        .await;

        assert_eq!(
            coordinator.request(QuorumKind::ChangeId(3)).await,
            QuorumDecision::Lost
        );
    }

    #[test]
    fn test_tie_break_example() {
        // 3 nodes proposing id 10: node 2 scores 0, node 0 scores 1, node 1 scores 2
        assert_eq!(tie_break(0, 10, 3), 1);
        assert_eq!(tie_break(1, 10, 3), 2);
        assert_eq!(tie_break(2, 10, 3), 0);
        assert!(wins_tie_break(0, 1, 10, 3));
        assert!(wins_tie_break(2, 0, 10, 3));
        assert!(!wins_tie_break(1, 2, 10, 3));
    }

    #[test]
    fn test_tie_break_equal_scores() {
        // 4 and 0 both score 0 in a cluster of 4
        assert!(wins_tie_break(0, 4, 8, 4));
        assert!(!wins_tie_break(4, 0, 8, 4));
    }

    #[test]
    fn test_decide() {
        let mut quorum = QuorumRequest::new(QuorumKind::ChangeId(5), 2, &[1, 2]);
        assert_eq!(quorum.decide(), QuorumDecision::Lost);

        assert_eq!(quorum.settled(), None);

        quorum.record(1, PeerOutcome::Accepted);
        assert_eq!(quorum.decide(), QuorumDecision::Accepted);
        assert_eq!(quorum.settled(), Some(QuorumDecision::Accepted));

        quorum.record(2, PeerOutcome::Rejected);
        assert_eq!(quorum.decide(), QuorumDecision::Rejected);

        quorum.record(2, PeerOutcome::Collision(2));
        assert_eq!(quorum.decide(), QuorumDecision::Collision { node_id: 2 });
    }

    #[test]
    fn test_non_responders_excluded() {
        let mut quorum = QuorumRequest::new(QuorumKind::Away { counter: 1 }, 3, &[1, 2, 3, 4]);
        quorum.record(1, PeerOutcome::Accepted);
        quorum.record(2, PeerOutcome::NoResponse);
        assert_eq!(quorum.decide(), QuorumDecision::Lost);
        quorum.record(3, PeerOutcome::Accepted);
        assert_eq!(quorum.decide(), QuorumDecision::Accepted);
    }

    proptest! {
        #[test]
        fn exactly_one_winner(a in 0u32..64, b in 0u32..64, change_id in any::<u64>(), size in 1usize..64) {
            prop_assume!(a != b);
            let size = size.max(a.max(b) as usize + 1);
            prop_assert_ne!(
                wins_tie_break(a, b, change_id, size),
                wins_tie_break(b, a, change_id, size)
            );
        }

        #[test]
        fn tie_break_is_deterministic(node in 0u32..64, change_id in any::<u64>(), size in 1usize..64) {
            let value = tie_break(node, change_id, size);
            prop_assert!(value < size as u64);
            prop_assert_eq!(value, tie_break(node, change_id, size));
        }
    }
}
