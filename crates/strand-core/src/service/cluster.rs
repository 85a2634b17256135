// Cluster management and coordination
// Wires the registry, sequencer, quorum, sync and away components of one node together

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use strand_api::model::{ChangeScope, NodeInfo, NodeStatus};
use strand_api::node::{NodeMessage, NodeRequest, NodeResponse};
use strand_common::{ChangeId, NodeId, Result, StrandError};

use crate::model::{Configuration, NodeStateFile};

use super::{
    archive::{ArchiveConfig, ArchiveStore, FileArchiveStore},
    away::{AwayConfig, AwayCoordinator, MaintenanceJob, SnapshotJob},
    changes::{ChangeApplier, ChangeLog, ChangeSequencer, FatalHandler, SequencerConfig},
    cluster_client::ClusterClientConfig,
    counters::Counters,
    member_event::{
        LoggingStatusChangeListener, StatusChangeEvent, StatusChangeEventPublisher,
        StatusChangeListener, StatusChangeType,
    },
    nodes::{ClusterHealthSummary, Node, NodeRegistry},
    quorum::QuorumCoordinator,
    sync::{
        EmptySnapshot, FileStateStore, SnapshotSource, StateStore, SyncConfig, SyncReceiver,
        SyncServer, Synchronizer,
    },
    transport::{NodeMessageHandler, NodeTransport},
};

/// Timeouts per request kind
#[derive(Clone, Debug)]
pub struct ProtocolTimeouts {
    pub connect: Duration,
    pub change_id: Duration,
    pub away: Duration,
    pub setup: Duration,
    pub sync_part: Duration,
    pub sync_done: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            change_id: Duration::from_secs(60),
            away: Duration::from_secs(5),
            setup: Duration::from_secs(10),
            sync_part: Duration::from_secs(10),
            sync_done: Duration::from_secs(300),
        }
    }
}

impl ProtocolTimeouts {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_timeout_ms()),
            change_id: Duration::from_millis(config.change_id_timeout_ms()),
            away: Duration::from_millis(config.away_timeout_ms()),
            setup: Duration::from_millis(config.setup_timeout_ms()),
            sync_part: Duration::from_millis(config.sync_part_timeout_ms()),
            sync_done: Duration::from_millis(config.sync_done_timeout_ms()),
        }
    }
}

/// Cluster context configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub timeouts: ProtocolTimeouts,
    pub client: ClusterClientConfig,
    pub sequencer: SequencerConfig,
    pub archive: ArchiveConfig,
    pub sync: SyncConfig,
    pub away: AwayConfig,
    /// Interval of the connect/heartbeat round
    pub heartbeat_interval: Duration,
    /// Event queue size
    pub event_queue_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            timeouts: ProtocolTimeouts::default(),
            client: ClusterClientConfig::default(),
            sequencer: SequencerConfig::default(),
            archive: ArchiveConfig::default(),
            sync: SyncConfig::default(),
            away: AwayConfig::default(),
            heartbeat_interval: Duration::from_secs(2),
            event_queue_size: 1024,
        }
    }
}

impl ClusterConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            timeouts: ProtocolTimeouts::from_configuration(config),
            client: ClusterClientConfig::from_configuration(config),
            sequencer: SequencerConfig::from_configuration(config),
            archive: ArchiveConfig::from_configuration(config),
            sync: SyncConfig::from_configuration(config),
            away: AwayConfig::from_configuration(config),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms()),
            event_queue_size: 1024,
        }
    }
}

/// Durable stores of one node
#[derive(Clone)]
pub struct ClusterStores {
    pub state: Arc<dyn StateStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub snapshot: Arc<dyn SnapshotSource>,
}

impl ClusterStores {
    /// File stores below `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            state: Arc::new(FileStateStore::new(data_dir.join("state"))?),
            archive: Arc::new(FileArchiveStore::new(data_dir.join("archive"))?),
            snapshot: Arc::new(EmptySnapshot),
        })
    }
}

/// Broadcasts `NODE_INFO` whenever this node changes status
struct InfoBroadcaster {
    registry: Weak<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
}

#[async_trait::async_trait]
impl StatusChangeListener for InfoBroadcaster {
    async fn on_status_change(&self, event: &StatusChangeEvent) {
        if !event.is_self || event.change_type != StatusChangeType::StatusChange {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let info = registry.this_info();
        for peer in registry.reachable_peers() {
            if let Err(e) = self.transport.send(peer, NodeMessage::Info { info: info.clone() }) {
                debug!(node_id = peer, "Cannot announce status: {}", e);
            }
        }
    }
}

/// Everything one node runs, shared through `Arc` handles
pub struct ClusterContext {
    config: ClusterConfig,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    counters: Arc<Counters>,
    sequencer: Arc<ChangeSequencer>,
    sync_server: Arc<SyncServer>,
    receiver: Arc<SyncReceiver>,
    synchronizer: Arc<Synchronizer>,
    away: Arc<AwayCoordinator>,
    state_file: Mutex<Option<PathBuf>>,
    saved_committed: AtomicU64,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("this_node", &self.registry.this_node_id())
            .field("status", &self.registry.status())
            .field("member_count", &self.registry.len())
            .finish()
    }
}

impl ClusterContext {
    /// Build the components of `this` node
    ///
    /// `this.committed_change_id` and `this.stored_change_id` describe the
    /// state the node resumes from.
    pub async fn new(
        config: ClusterConfig,
        this: Node,
        transport: Arc<dyn NodeTransport>,
        stores: ClusterStores,
        applier: Arc<dyn ChangeApplier>,
        on_fatal: FatalHandler,
    ) -> Arc<Self> {
        let committed_id = this.committed_change_id;
        let events = Arc::new(StatusChangeEventPublisher::new(config.event_queue_size));
        let registry = Arc::new(NodeRegistry::new(this, events.clone()));
        events
            .register_listener(Arc::new(LoggingStatusChangeListener))
            .await;
        events
            .register_listener(Arc::new(InfoBroadcaster {
                registry: Arc::downgrade(&registry),
                transport: transport.clone(),
            }))
            .await;

        let counters = Arc::new(Counters::new());
        let quorum = Arc::new(QuorumCoordinator::new(
            registry.clone(),
            transport.clone(),
            config.timeouts.clone(),
        ));
        let log = Arc::new(Mutex::new(ChangeLog::new(committed_id, &config.archive)));
        let sequencer = Arc::new(ChangeSequencer::new(
            config.sequencer.clone(),
            log,
            registry.clone(),
            quorum.clone(),
            transport.clone(),
            applier,
            counters.clone(),
            on_fatal,
        ));
        let sync_server = Arc::new(SyncServer::new(
            registry.clone(),
            transport.clone(),
            sequencer.clone(),
            stores.state.clone(),
            stores.archive.clone(),
            config.timeouts.clone(),
            config.sync.clone(),
        ));
        let receiver = Arc::new(SyncReceiver::new(
            registry.clone(),
            sequencer.clone(),
            stores.state.clone(),
            stores.archive.clone(),
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            registry.clone(),
            transport.clone(),
            sequencer.clone(),
            receiver.clone(),
            config.sync.clone(),
            config.timeouts.clone(),
        ));
        let job: Arc<dyn MaintenanceJob> =
            Arc::new(SnapshotJob::new(stores.state.clone(), stores.snapshot.clone()));
        let away = Arc::new(AwayCoordinator::new(
            config.away.clone(),
            registry.clone(),
            quorum,
            sequencer.clone(),
            sync_server.clone(),
            stores.archive.clone(),
            job,
            counters.clone(),
        ));

        Arc::new(Self {
            config,
            registry,
            transport,
            counters,
            sequencer,
            sync_server,
            receiver,
            synchronizer,
            away,
            state_file: Mutex::new(None),
            saved_committed: AtomicU64::new(committed_id),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Persist the node state into `path` on progress and on stop
    pub fn set_state_file(&self, path: PathBuf) {
        *self.state_file.lock() = Some(path);
    }

    /// Handler to attach to the transport
    pub fn handler(self: &Arc<Self>) -> Weak<dyn NodeMessageHandler> {
        let handler: Arc<dyn NodeMessageHandler> = self.clone();
        Arc::downgrade(&handler)
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn sequencer(&self) -> &Arc<ChangeSequencer> {
        &self.sequencer
    }

    pub fn away(&self) -> &Arc<AwayCoordinator> {
        &self.away
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub fn sync_server(&self) -> &Arc<SyncServer> {
        &self.sync_server
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn this_node_id(&self) -> NodeId {
        self.registry.this_node_id()
    }

    pub fn status(&self) -> NodeStatus {
        self.registry.status()
    }

    pub fn committed_id(&self) -> ChangeId {
        self.sequencer.committed_id()
    }

    pub fn health_summary(&self) -> ClusterHealthSummary {
        self.registry.health_summary()
    }

    /// Register a configured peer
    pub async fn add_peer(&self, node_id: NodeId, address: &str, port: u16) -> Result<()> {
        let node = Node::new(node_id, address, port);
        self.transport.register_peer(node_id, node.endpoint());
        self.registry.register(node).await
    }

    /// Replicate `tasks`, returning the committed change id
    pub async fn propose(&self, tasks: Vec<Vec<u8>>, scope: ChangeScope) -> Result<ChangeId> {
        self.sequencer.propose(tasks, scope).await
    }

    /// Leave `OFFLINE` and start the background loops
    ///
    /// A node resuming from a committed change id synchronizes right away,
    /// a fresh node first learns the members from a peer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let resume = self.committed_id() > 0;
        info!(
            node_id = self.this_node_id(),
            committed_id = self.committed_id(),
            "Starting node, {} member(s)",
            self.registry.len()
        );
        if resume {
            self.registry.update_status(NodeStatus::Synchronizing).await?;
            self.heartbeat().await;
        } else {
            self.registry.update_status(NodeStatus::Building).await?;
            self.heartbeat().await;
            self.setup().await;
            self.registry.update_status(NodeStatus::Synchronizing).await?;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.sequencer.clone().run()));
        tasks.push(tokio::spawn(self.synchronizer.clone().run()));
        tasks.push(tokio::spawn(self.away.clone().run()));

        let ctx = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while ctx.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                ctx.heartbeat().await;
                ctx.save_progress();
            }
        }));
        Ok(())
    }

    /// Stop the background loops and go `OFFLINE`
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node_id = self.this_node_id(), "Stopping node");

        self.sequencer.stop();
        self.synchronizer.stop();
        self.away.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // away nodes come back through AWAY_SOON and READY before shutting down
        let path: &[NodeStatus] = match self.status() {
            NodeStatus::Away => &[
                NodeStatus::AwaySoon,
                NodeStatus::Ready,
                NodeStatus::ShuttingDown,
            ],
            NodeStatus::AwaySoon => &[NodeStatus::Ready, NodeStatus::ShuttingDown],
            NodeStatus::Ready => &[NodeStatus::ShuttingDown],
            _ => &[],
        };
        for status in path {
            if let Err(e) = self.registry.update_status(*status).await {
                warn!("Cannot shut down cleanly: {}", e);
                break;
            }
        }
        if let Err(e) = self.registry.update_status(NodeStatus::Offline).await {
            debug!("Status left as {}: {}", self.status(), e);
        }
        if let Err(e) = self.save_state() {
            warn!("Cannot save node state: {}", e);
        }
    }

    /// Exchange `REQ_CONNECT` with every peer
    ///
    /// Doubles as the liveness check: a peer that does not answer is marked
    /// `OFFLINE` until the next round reaches it.
    pub async fn heartbeat(&self) {
        let peers = self.registry.peer_ids();
        let rounds = peers.into_iter().map(|peer| self.connect(peer));
        join_all(rounds).await;
    }

    async fn connect(&self, peer: NodeId) {
        if self.registry.status_of(peer) == Some(NodeStatus::Offline) {
            self.registry
                .set_peer_status(peer, NodeStatus::Connecting)
                .await;
        }
        let request = NodeRequest::Connect {
            info: self.registry.this_info(),
        };
        match self
            .transport
            .request(peer, request, self.config.timeouts.connect)
            .await
        {
            Ok(NodeResponse::Connect { info }) => {
                if let Err(e) = self.registry.update_from_info(&answered(info)).await {
                    warn!(node_id = peer, "Cannot apply node info: {}", e);
                }
            }
            Ok(other) => {
                debug!(node_id = peer, "Unexpected answer to REQ_CONNECT: {}", other.proto());
                self.registry.set_peer_status(peer, NodeStatus::Offline).await;
            }
            Err(e) => {
                if self.registry.status_of(peer) != Some(NodeStatus::Offline) {
                    debug!(node_id = peer, "Node unreachable: {}", e);
                }
                self.registry.set_peer_status(peer, NodeStatus::Offline).await;
            }
        }
    }

    /// Learn the cluster members from the first peer that answers `REQ_SETUP`
    pub async fn setup(&self) -> bool {
        for peer in self.registry.reachable_peers() {
            match self
                .transport
                .request(peer, NodeRequest::Setup, self.config.timeouts.setup)
                .await
            {
                Ok(NodeResponse::Setup { nodes }) => {
                    // only learn unknown members, their status comes from our own heartbeat
                    for info in nodes.iter().filter(|n| self.registry.get(n.id).is_none()) {
                        if info.id == self.this_node_id() {
                            continue;
                        }
                        self.transport.register_peer(info.id, info.endpoint());
                        let node = Node::new(info.id, info.address.clone(), info.port);
                        if let Err(e) = self.registry.register(node).await {
                            warn!(node_id = info.id, "Cannot register member: {}", e);
                        }
                    }
                    info!(node_id = peer, "Cluster setup received, {} member(s)", nodes.len());
                    return true;
                }
                Ok(other) => debug!(node_id = peer, "Setup refused: {}", other.proto()),
                Err(e) => debug!(node_id = peer, "Setup failed: {}", e),
            }
        }
        false
    }

    fn save_progress(&self) {
        let committed = self.committed_id();
        if self.saved_committed.swap(committed, Ordering::SeqCst) != committed
            && let Err(e) = self.save_state()
        {
            warn!("Cannot save node state: {}", e);
        }
    }

    /// Write the node state file, if one is configured
    pub fn save_state(&self) -> Result<()> {
        let Some(path) = self.state_file.lock().clone() else {
            return Ok(());
        };
        let this = self.registry.this_node();
        NodeStateFile {
            node_id: this.id,
            address: this.address,
            port: this.port,
            committed_change_id: self.committed_id(),
            stored_change_id: this.stored_change_id,
        }
        .save(&path)
    }
}

/// A peer that answered is at least `CONNECTED`
fn answered(mut info: NodeInfo) -> NodeInfo {
    if !info.status.is_reachable() {
        info.status = NodeStatus::Connected;
    }
    info
}

#[async_trait::async_trait]
impl NodeMessageHandler for ClusterContext {
    async fn on_request(&self, from: NodeId, request: NodeRequest) -> NodeResponse {
        match request {
            NodeRequest::Connect { info } => {
                self.transport.register_peer(info.id, info.endpoint());
                if let Err(e) = self.registry.update_from_info(&answered(info)).await {
                    return e.into();
                }
                NodeResponse::Connect {
                    info: self.registry.this_info(),
                }
            }
            NodeRequest::ChangeId { change_id } => self.sequencer.accept_id(change_id, from).into(),
            NodeRequest::Away { node_id, counter } => self.away.accept(node_id, counter),
            NodeRequest::Setup => NodeResponse::Setup {
                nodes: self.registry.all_info(),
            },
            NodeRequest::Sync { start } => self.sync_server.on_sync_request(from, start).await,
            request @ (NodeRequest::SyncFPart { .. }
            | NodeRequest::SyncFDone
            | NodeRequest::SyncAPart { .. }
            | NodeRequest::SyncADone
            | NodeRequest::SyncEPart { .. }
            | NodeRequest::SyncEDone) => self.receiver.on_request(from, request).await,
        }
    }

    async fn on_message(&self, from: NodeId, message: NodeMessage) {
        match message {
            NodeMessage::Change { change } => {
                if self.sequencer.accept_remote(change) {
                    self.sequencer.wake();
                }
            }
            NodeMessage::Info { info } => {
                if info.id != from {
                    debug!(node_id = from, "Ignoring info relayed for node {}", info.id);
                    return;
                }
                if let Err(e) = self.registry.update_from_info(&info).await {
                    warn!(node_id = from, "Cannot apply node info: {}", e);
                }
            }
            NodeMessage::MissingChange { change_id } => {
                self.sequencer.on_missing_change(from, change_id)
            }
        }
    }
}

/// Read the node state to resume from
///
/// With `init` a fresh state is created when none exists yet; otherwise a
/// missing or corrupt state file refuses startup.
pub fn load_node_state(
    path: &Path,
    init: bool,
    node_id: NodeId,
    address: &str,
    port: u16,
) -> Result<NodeStateFile> {
    if init && !path.exists() {
        let state = NodeStateFile {
            node_id,
            address: address.to_string(),
            port,
            ..Default::default()
        };
        state.save(path)?;
        info!(node_id, "Initialized node state in {}", path.display());
        return Ok(state);
    }

    let state = NodeStateFile::load(path)?;
    if state.node_id != node_id {
        return Err(StrandError::InvalidNodeState(format!(
            "{} belongs to node {}, not {}",
            path.display(),
            state.node_id,
            node_id
        )));
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::changes::LoggingApplier;
    use crate::service::transport::LocalNetwork;

    async fn context(network: &Arc<LocalNetwork>, id: NodeId, dir: &Path) -> Arc<ClusterContext> {
        let ctx = ClusterContext::new(
            ClusterConfig::default(),
            Node::new(id, "127.0.0.1", 9220 + id as u16),
            network.transport(id),
            ClusterStores::open(dir).unwrap(),
            Arc::new(LoggingApplier),
            Arc::new(|_: &StrandError| {}),
        )
        .await;
        network.attach(id, ctx.handler());
        ctx
    }

    #[test]
    fn test_protocol_timeouts_default() {
        let timeouts = ProtocolTimeouts::default();
        assert_eq!(timeouts.connect, Duration::from_secs(5));
        assert_eq!(timeouts.change_id, Duration::from_secs(60));
        assert_eq!(timeouts.away, Duration::from_secs(5));
        assert_eq!(timeouts.setup, Duration::from_secs(10));
        assert_eq!(timeouts.sync_part, Duration::from_secs(10));
        assert_eq!(timeouts.sync_done, Duration::from_secs(300));
    }

    #[test]
    fn test_cluster_config_from_configuration() {
        let config = config::Config::builder()
            .set_default("strand.protocol.connect-timeout", 1500)
            .unwrap()
            .build()
            .unwrap();
        let config = ClusterConfig::from_configuration(&Configuration::from_config(config));
        assert_eq!(config.timeouts.connect, Duration::from_millis(1500));
        assert_eq!(config.client.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.timeouts.away, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_heartbeat_connects_peers() {
        let dir = tempfile::tempdir().unwrap();
        let network = LocalNetwork::new();
        let a = context(&network, 1, &dir.path().join("a")).await;
        let b = context(&network, 2, &dir.path().join("b")).await;
        a.add_peer(2, "127.0.0.1", 9222).await.unwrap();
        a.registry().update_status(NodeStatus::Building).await.unwrap();

        a.heartbeat().await;
        // node 2 answered as OFFLINE and is promoted to CONNECTED
        assert_eq!(a.registry().status_of(2), Some(NodeStatus::Connected));
        // and node 2 learned about node 1 from the request
        assert_eq!(b.registry().status_of(1), Some(NodeStatus::Building));

        network.detach(2);
        a.heartbeat().await;
        assert_eq!(a.registry().status_of(2), Some(NodeStatus::Offline));
    }

    #[tokio::test]
    async fn test_setup_learns_members() {
        let dir = tempfile::tempdir().unwrap();
        let network = LocalNetwork::new();
        let a = context(&network, 1, &dir.path().join("a")).await;
        let b = context(&network, 2, &dir.path().join("b")).await;
        let _c = context(&network, 3, &dir.path().join("c")).await;
        b.add_peer(3, "127.0.0.1", 9223).await.unwrap();

        a.add_peer(2, "127.0.0.1", 9222).await.unwrap();
        a.heartbeat().await;
        assert!(a.setup().await);
        assert_eq!(a.registry().len(), 3);
        assert!(a.registry().get(3).is_some());
    }

    #[tokio::test]
    async fn test_away_request_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let network = LocalNetwork::new();
        let a = context(&network, 1, dir.path()).await;
        a.add_peer(2, "127.0.0.1", 9222).await.unwrap();

        let response = a
            .on_request(2, NodeRequest::Away { node_id: 2, counter: 4 })
            .await;
        assert_eq!(response, NodeResponse::Accept);
        assert_eq!(a.registry().get(2).map(|n| n.away_counter), Some(4));
        // the reservation belongs to node 2 now
        let response = a
            .on_request(3, NodeRequest::Away { node_id: 3, counter: 0 })
            .await;
        assert_eq!(response, NodeResponse::Reject);
    }

    #[tokio::test]
    async fn test_stop_while_away_goes_offline() {
        for path in [
            &[NodeStatus::Ready][..],
            &[NodeStatus::Ready, NodeStatus::AwaySoon],
            &[NodeStatus::Ready, NodeStatus::AwaySoon, NodeStatus::Away],
        ] {
            let dir = tempfile::tempdir().unwrap();
            let network = LocalNetwork::new();
            let a = context(&network, 1, dir.path()).await;
            a.set_state_file(NodeStateFile::path_in(dir.path()));
            a.start().await.unwrap();
            for status in path {
                a.registry().update_status(*status).await.unwrap();
            }

            let mut events = a.registry().events().subscribe();
            a.stop().await;
            assert_eq!(a.status(), NodeStatus::Offline, "stopped from {:?}", path);

            let mut seen = Vec::new();
            while let Ok(event) = events.try_recv() {
                if event.is_self {
                    seen.push(event.current);
                }
            }
            assert_eq!(seen.last(), Some(&NodeStatus::Offline));
            assert!(seen.contains(&NodeStatus::ShuttingDown));
        }
    }

    #[test]
    fn test_load_node_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = NodeStateFile::path_in(dir.path());

        assert!(load_node_state(&path, false, 1, "127.0.0.1", 9221).is_err());
        let state = load_node_state(&path, true, 1, "127.0.0.1", 9221).unwrap();
        assert_eq!(state.committed_change_id, 0);
        assert!(load_node_state(&path, false, 1, "127.0.0.1", 9221).is_ok());
        assert!(load_node_state(&path, false, 2, "127.0.0.1", 9221).is_err());

        std::fs::write(&path, b"not json").unwrap();
        assert!(load_node_state(&path, true, 1, "127.0.0.1", 9221).is_err());
    }
}
