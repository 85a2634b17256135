// Shared helpers for multi-node tests over the in-process network

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use strand_api::model::{ChangePackage, NodeStatus};
use strand_common::{ChangeId, NodeId, Result, StrandError};
use strand_core::service::changes::ChangeApplier;
use strand_core::service::nodes::Node;
use strand_core::service::transport::LocalNetwork;
use strand_core::{ClusterConfig, ClusterContext, ClusterStores};

/// Records the order in which changes were applied
#[derive(Default)]
pub struct RecordingApplier {
    pub applied: Mutex<Vec<ChangeId>>,
}

impl ChangeApplier for RecordingApplier {
    fn apply(&self, change: &ChangePackage) -> Result<()> {
        self.applied.lock().push(change.id);
        Ok(())
    }
}

pub struct TestNode {
    pub ctx: Arc<ClusterContext>,
    pub applier: Arc<RecordingApplier>,
    dir: TempDir,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.ctx.this_node_id()
    }

    pub fn applied(&self) -> Vec<ChangeId> {
        self.applier.applied.lock().clone()
    }

    /// Directory holding this node's stores
    pub fn data_dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// A node resuming from `committed`, attached to `network`
pub async fn node(
    network: &Arc<LocalNetwork>,
    id: NodeId,
    committed: ChangeId,
    config: ClusterConfig,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut this = Node::new(id, "127.0.0.1", 9220 + id as u16);
    this.committed_change_id = committed;
    let applier = Arc::new(RecordingApplier::default());
    let ctx = ClusterContext::new(
        config,
        this,
        network.transport(id),
        ClusterStores::open(dir.path()).unwrap(),
        applier.clone(),
        Arc::new(|err: &StrandError| panic!("fatal replication error: {}", err)),
    )
    .await;
    network.attach(id, ctx.handler());
    TestNode {
        ctx,
        applier,
        dir,
    }
}

/// Make every node know every other one and exchange a heartbeat
pub async fn connect_all(nodes: &[TestNode]) {
    for a in nodes {
        for b in nodes.iter().filter(|b| b.id() != a.id()) {
            a.ctx
                .add_peer(b.id(), "127.0.0.1", 9220 + b.id() as u16)
                .await
                .unwrap();
        }
    }
    heartbeat(nodes).await;
}

pub async fn heartbeat(nodes: &[TestNode]) {
    for node in nodes {
        node.ctx.heartbeat().await;
    }
}

pub async fn set_status(node: &TestNode, path: &[NodeStatus]) {
    for status in path {
        node.ctx.registry().update_status(*status).await.unwrap();
    }
}

pub async fn make_ready(node: &TestNode) {
    set_status(node, &[NodeStatus::Synchronizing, NodeStatus::Ready]).await;
}

/// `n` ready nodes at committed id 0 with running commit loops
pub async fn ready_cluster(network: &Arc<LocalNetwork>, n: u32) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for id in 0..n {
        let node = node(network, id, 0, ClusterConfig::default()).await;
        make_ready(&node).await;
        tokio::spawn(node.ctx.sequencer().clone().run());
        nodes.push(node);
    }
    connect_all(&nodes).await;
    nodes
}

/// Poll `cond` until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
