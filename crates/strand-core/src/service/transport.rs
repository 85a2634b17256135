//! Node transport abstraction
//!
//! [`NodeTransport`] is how replication components talk to peers; the
//! [`NodeMessageHandler`] is how incoming traffic reaches them. The TCP
//! implementation lives in `cluster_client`; [`LocalNetwork`] wires several
//! in-process nodes together and can simulate partitions.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use strand_api::node::{NodeMessage, NodeRequest, NodeResponse};
use strand_common::{NodeId, Result, StrandError};

/// Outgoing side of node-to-node traffic
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Send a request and wait for its response, bounded by `timeout`
    async fn request(
        &self,
        to: NodeId,
        request: NodeRequest,
        timeout: Duration,
    ) -> Result<NodeResponse>;

    /// Queue a fire-and-forget message
    fn send(&self, to: NodeId, message: NodeMessage) -> Result<()>;

    /// Learn where `node_id` can be reached
    fn register_peer(&self, _node_id: NodeId, _endpoint: String) {}
}

/// Incoming side of node-to-node traffic
#[async_trait]
pub trait NodeMessageHandler: Send + Sync {
    async fn on_request(&self, from: NodeId, request: NodeRequest) -> NodeResponse;

    async fn on_message(&self, from: NodeId, message: NodeMessage);
}

/// In-process network connecting [`LocalTransport`]s
#[derive(Default)]
pub struct LocalNetwork {
    handlers: DashMap<NodeId, Weak<dyn NodeMessageHandler>>,
    /// Unordered pairs of nodes that cannot reach each other
    partitions: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create the transport used by `node_id`
    pub fn transport(self: &Arc<Self>, node_id: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node_id,
            network: self.clone(),
        })
    }

    /// Route traffic addressed to `node_id` to `handler`
    pub fn attach(&self, node_id: NodeId, handler: Weak<dyn NodeMessageHandler>) {
        self.handlers.insert(node_id, handler);
    }

    /// Take `node_id` off the network
    pub fn detach(&self, node_id: NodeId) {
        self.handlers.remove(&node_id);
    }

    fn key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b { (a, b) } else { (b, a) }
    }

    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.partitions.write().insert(Self::key(a, b));
    }

    /// Cut `node_id` off from every other node
    pub fn isolate(&self, node_id: NodeId, others: &[NodeId]) {
        let mut partitions = self.partitions.write();
        for other in others.iter().filter(|o| **o != node_id) {
            partitions.insert(Self::key(node_id, *other));
        }
    }

    pub fn heal(&self) {
        self.partitions.write().clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn NodeMessageHandler>> {
        if self.partitions.read().contains(&Self::key(from, to)) {
            return Err(StrandError::NodeUnavailable(to));
        }
        self.handlers
            .get(&to)
            .and_then(|h| h.upgrade())
            .ok_or(StrandError::NodeUnavailable(to))
    }
}

/// Transport bound to one node of a [`LocalNetwork`]
pub struct LocalTransport {
    node_id: NodeId,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn request(
        &self,
        to: NodeId,
        request: NodeRequest,
        timeout: Duration,
    ) -> Result<NodeResponse> {
        let handler = self.network.route(self.node_id, to)?;
        let name = request.name();
        // let concurrently started requests interleave like they would on a wire
        tokio::task::yield_now().await;
        tokio::time::timeout(timeout, handler.on_request(self.node_id, request))
            .await
            .map_err(|_| StrandError::Timeout {
                node_id: to,
                request: name,
                timeout,
            })
    }

    fn send(&self, to: NodeId, message: NodeMessage) -> Result<()> {
        let handler = self.network.route(self.node_id, to)?;
        let from = self.node_id;
        debug!(from, to, "Sending {}", message.proto());
        tokio::spawn(async move {
            handler.on_message(from, message).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        messages: AtomicUsize,
    }

    #[async_trait]
    impl NodeMessageHandler for Echo {
        async fn on_request(&self, _from: NodeId, request: NodeRequest) -> NodeResponse {
            match request {
                NodeRequest::Sync { .. } => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    NodeResponse::Sync
                }
                _ => NodeResponse::Accept,
            }
        }

        async fn on_message(&self, _from: NodeId, _message: NodeMessage) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_local_request_and_partition() {
        let network = LocalNetwork::new();
        let echo: Arc<dyn NodeMessageHandler> = Arc::new(Echo {
            messages: AtomicUsize::new(0),
        });
        network.attach(1, Arc::downgrade(&echo));

        let transport = network.transport(0);
        let res = transport
            .request(1, NodeRequest::ChangeId { change_id: 1 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(res, NodeResponse::Accept);

        network.partition(1, 0);
        let err = transport
            .request(1, NodeRequest::Setup, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::NodeUnavailable(1)));

        network.heal();
        assert!(transport.send(1, NodeMessage::MissingChange { change_id: 3 }).is_ok());
        assert!(transport.send(2, NodeMessage::MissingChange { change_id: 3 }).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_request_timeout() {
        let network = LocalNetwork::new();
        let echo: Arc<dyn NodeMessageHandler> = Arc::new(Echo {
            messages: AtomicUsize::new(0),
        });
        network.attach(1, Arc::downgrade(&echo));

        let err = network
            .transport(0)
            .request(1, NodeRequest::Sync { start: 1 }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Timeout { node_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unavailable() {
        let network = LocalNetwork::new();
        {
            let echo: Arc<dyn NodeMessageHandler> = Arc::new(Echo {
                messages: AtomicUsize::new(0),
            });
            network.attach(1, Arc::downgrade(&echo));
        }
        assert!(network
            .transport(0)
            .send(1, NodeMessage::MissingChange { change_id: 1 })
            .is_err());
    }
}
