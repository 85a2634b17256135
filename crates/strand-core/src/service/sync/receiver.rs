// Sync receiver
// Polls for a sync source while SYNCHRONIZING and applies what the source sends

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use strand_api::model::{ChangePackage, NodeStatus};
use strand_api::node::{NodeRequest, NodeResponse, PartAck, SyncPart};
use strand_common::error::NODE_ERROR;
use strand_common::{ChangeId, NodeId, Result, StrandError};

use super::SyncConfig;
use super::state::StateStore;
use crate::service::archive::ArchiveStore;
use crate::service::changes::ChangeSequencer;
use crate::service::cluster::ProtocolTimeouts;
use crate::service::nodes::NodeRegistry;
use crate::service::transport::NodeTransport;

/// Result of one synchronizer poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPoll {
    /// This node is not synchronizing
    Idle,
    /// A sync was requested from the given node
    Requested(NodeId),
    /// No source was needed, this node is now `READY`
    CaughtUp,
    /// No source available yet
    Waiting,
    Failed,
}

/// Receiving side of the sync requests
///
/// Parts are only accepted from the node a sync was last requested from.
pub struct SyncReceiver {
    registry: Arc<NodeRegistry>,
    sequencer: Arc<ChangeSequencer>,
    state_store: Arc<dyn StateStore>,
    archive_store: Arc<dyn ArchiveStore>,
    source: Mutex<Option<NodeId>>,
}

impl SyncReceiver {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sequencer: Arc<ChangeSequencer>,
        state_store: Arc<dyn StateStore>,
        archive_store: Arc<dyn ArchiveStore>,
    ) -> Self {
        Self {
            registry,
            sequencer,
            state_store,
            archive_store,
            source: Mutex::new(None),
        }
    }

    /// Accept sync parts from `node_id` only
    pub fn expect_source(&self, node_id: NodeId) {
        *self.source.lock() = Some(node_id);
    }

    pub fn source(&self) -> Option<NodeId> {
        *self.source.lock()
    }

    /// Handle one of the `REQ_SYNC*PART`/`REQ_SYNC*DONE` requests
    pub async fn on_request(&self, from: NodeId, request: NodeRequest) -> NodeResponse {
        let status = self.registry.status();
        if status != NodeStatus::Synchronizing {
            return NodeResponse::error(
                NODE_ERROR,
                format!("node is {} and not synchronizing", status),
            );
        }
        if self.source() != Some(from) {
            warn!(
                node_id = from,
                "Refusing {} from a node that is not the sync source",
                request.name()
            );
            return NodeResponse::error(
                NODE_ERROR,
                format!("node {} is not the sync source", from),
            );
        }

        let result = match request {
            NodeRequest::SyncFPart { part } => self
                .write(&part, |p| {
                    self.state_store.write_part(&p.target, p.offset, &p.data)
                })
                .map(|ack| NodeResponse::SyncFPart { ack }),
            NodeRequest::SyncFDone => self.full_done(),
            NodeRequest::SyncAPart { part } => self
                .write(&part, |p| {
                    self.archive_store.write_part(&p.target, p.offset, &p.data)
                })
                .map(|ack| NodeResponse::SyncAPart { ack }),
            NodeRequest::SyncADone => self.archive_done(),
            NodeRequest::SyncEPart { change, frontier } => self.live_part(change, frontier),
            NodeRequest::SyncEDone => self.live_done(from).await,
            other => Err(StrandError::BadData(format!(
                "{} is not a sync part",
                other.name()
            ))),
        };
        result.unwrap_or_else(|e| {
            warn!(node_id = from, "Sync request failed: {}", e);
            e.into()
        })
    }

    fn write(&self, part: &SyncPart, write: impl FnOnce(&SyncPart) -> Result<()>) -> Result<PartAck> {
        write(part)?;
        let offset = if part.more {
            part.offset + part.data.len() as u64
        } else {
            0
        };
        Ok(PartAck {
            target: part.target.clone(),
            offset,
        })
    }

    fn full_done(&self) -> Result<NodeResponse> {
        let stored = self.state_store.restore()?;
        self.sequencer.restore(stored);
        Ok(NodeResponse::SyncFDone {
            next_change_id: stored + 1,
        })
    }

    fn archive_done(&self) -> Result<NodeResponse> {
        let loaded = self.sequencer.load_synced_archive(self.archive_store.as_ref())?;
        info!(
            committed_id = self.sequencer.committed_id(),
            "Loaded {} change(s) from synced archive files", loaded
        );
        Ok(NodeResponse::SyncADone {
            next_change_id: self.sequencer.next_missing_id(),
        })
    }

    fn live_part(&self, change: ChangePackage, frontier: ChangeId) -> Result<NodeResponse> {
        let change_id = change.id;
        self.sequencer.commit_synced(change)?;
        let next = self.sequencer.next_missing_id();
        debug!(change_id, next, frontier, "Applied synced change");
        Ok(NodeResponse::SyncEPart {
            next_change_id: (next <= frontier).then_some(next),
        })
    }

    async fn live_done(&self, from: NodeId) -> Result<NodeResponse> {
        self.registry.update_status(NodeStatus::Ready).await?;
        *self.source.lock() = None;
        info!(
            node_id = from,
            committed_id = self.sequencer.committed_id(),
            "Synchronized"
        );
        Ok(NodeResponse::SyncEDone)
    }
}

/// Finds a sync source while this node is `SYNCHRONIZING`
pub struct Synchronizer {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    sequencer: Arc<ChangeSequencer>,
    receiver: Arc<SyncReceiver>,
    config: SyncConfig,
    timeouts: ProtocolTimeouts,
    retry_offline: Mutex<u32>,
    running: AtomicBool,
}

impl Synchronizer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        sequencer: Arc<ChangeSequencer>,
        receiver: Arc<SyncReceiver>,
        config: SyncConfig,
        timeouts: ProtocolTimeouts,
    ) -> Self {
        let retry_offline = config.retry_offline;
        Self {
            registry,
            transport,
            sequencer,
            receiver,
            config,
            timeouts,
            retry_offline: Mutex::new(retry_offline),
            running: AtomicBool::new(false),
        }
    }

    pub async fn poll_once(&self) -> SyncPoll {
        if self.registry.status() != NodeStatus::Synchronizing {
            return SyncPoll::Idle;
        }

        // stay with a source that is still serving, a running session keeps going
        let current = self.receiver.source().filter(|node_id| {
            self.registry
                .status_of(*node_id)
                .is_some_and(|status| status.is_away_or_soon())
        });
        let Some(source) = current.or_else(|| self.registry.pick_away_or_away_soon_peer()) else {
            let caught_up = self.registry.ignore_sync(&mut self.retry_offline.lock());
            if !caught_up {
                return SyncPoll::Waiting;
            }
            return match self.registry.update_status(NodeStatus::Ready).await {
                Ok(()) => {
                    info!(
                        committed_id = self.sequencer.committed_id(),
                        "No sync source needed"
                    );
                    SyncPoll::CaughtUp
                }
                Err(e) => {
                    warn!("Cannot leave synchronizing: {}", e);
                    SyncPoll::Failed
                }
            };
        };

        let start = self.sequencer.committed_id() + 1;
        // parts may arrive before the answer does
        self.receiver.expect_source(source);
        let request = NodeRequest::Sync { start };
        match self
            .transport
            .request(source, request, self.timeouts.sync_part)
            .await
        {
            Ok(NodeResponse::Sync) => {
                debug!(node_id = source, start, "Sync requested");
                *self.retry_offline.lock() = self.config.retry_offline;
                SyncPoll::Requested(source)
            }
            Ok(other) => {
                debug!(node_id = source, "Sync refused: {}", other.proto());
                SyncPoll::Failed
            }
            Err(e) => {
                debug!(node_id = source, "Sync request failed: {}", e);
                SyncPoll::Failed
            }
        }
    }

    /// Poll until [`Synchronizer::stop`]
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.config.initial_delay).await;

        while self.running.load(Ordering::SeqCst) {
            let delay = match self.poll_once().await {
                SyncPoll::Requested(_) => self.config.repeat_interval,
                _ => self.config.poll_interval,
            };
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::archive::{ArchiveConfig, FileArchiveStore};
    use crate::service::changes::{ChangeLog, LoggingApplier, SequencerConfig};
    use crate::service::counters::Counters;
    use crate::service::member_event::StatusChangeEventPublisher;
    use crate::service::nodes::Node;
    use crate::service::quorum::QuorumCoordinator;
    use crate::service::sync::state::FileStateStore;
    use crate::service::transport::LocalNetwork;
    use strand_api::model::ChangeScope;

    struct Fixture {
        registry: Arc<NodeRegistry>,
        sequencer: Arc<ChangeSequencer>,
        receiver: Arc<SyncReceiver>,
        synchronizer: Synchronizer,
        _dir: tempfile::TempDir,
    }

    async fn fixture(peer_status: NodeStatus) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(StatusChangeEventPublisher::new(64));
        let mut this = Node::new(0, "127.0.0.1", 9220);
        this.status = NodeStatus::Synchronizing;
        let registry = Arc::new(NodeRegistry::new(this, events));
        let mut peer = Node::new(1, "127.0.0.1", 9221);
        peer.status = peer_status;
        registry.register(peer).await.unwrap();

        let network = LocalNetwork::new();
        let transport: Arc<dyn NodeTransport> = network.transport(0);
        let quorum = Arc::new(QuorumCoordinator::new(
            registry.clone(),
            transport.clone(),
            ProtocolTimeouts::default(),
        ));
        let sequencer = Arc::new(ChangeSequencer::new(
            SequencerConfig::default(),
            Arc::new(Mutex::new(ChangeLog::new(0, &ArchiveConfig::default()))),
            registry.clone(),
            quorum,
            transport.clone(),
            Arc::new(LoggingApplier),
            Arc::new(Counters::new()),
            Arc::new(|_: &StrandError| {}),
        ));
        let receiver = Arc::new(SyncReceiver::new(
            registry.clone(),
            sequencer.clone(),
            Arc::new(FileStateStore::new(dir.path().join("store")).unwrap()),
            Arc::new(FileArchiveStore::new(dir.path().join("archive")).unwrap()),
        ));
        let synchronizer = Synchronizer::new(
            registry.clone(),
            transport,
            sequencer.clone(),
            receiver.clone(),
            SyncConfig {
                retry_offline: 2,
                ..Default::default()
            },
            ProtocolTimeouts::default(),
        );
        Fixture {
            registry,
            sequencer,
            receiver,
            synchronizer,
            _dir: dir,
        }
    }

    fn change(id: ChangeId) -> ChangePackage {
        ChangePackage::new(id, 1, ChangeScope::Cluster, vec![vec![1]])
    }

    #[tokio::test]
    async fn test_live_parts_report_next_missing_id() {
        let f = fixture(NodeStatus::Away).await;
        f.receiver.expect_source(1);

        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncEPart { change: change(1), frontier: 3 })
            .await;
        assert_eq!(res, NodeResponse::SyncEPart { next_change_id: Some(2) });

        // a change broadcast meanwhile is already queued
        f.sequencer.accept_remote(change(3));
        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncEPart { change: change(2), frontier: 3 })
            .await;
        assert_eq!(res, NodeResponse::SyncEPart { next_change_id: None });
        assert_eq!(f.sequencer.committed_id(), 3);

        let res = f.receiver.on_request(1, NodeRequest::SyncEDone).await;
        assert_eq!(res, NodeResponse::SyncEDone);
        assert_eq!(f.registry.status(), NodeStatus::Ready);

        // parts are refused once ready
        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncEPart { change: change(4), frontier: 4 })
            .await;
        assert!(matches!(res, NodeResponse::Error { code, .. } if code == NODE_ERROR.code));
        assert_eq!(f.receiver.source(), None);
    }

    #[tokio::test]
    async fn test_parts_from_other_nodes_are_refused() {
        let f = fixture(NodeStatus::Away).await;

        // nothing was requested yet
        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncEPart { change: change(1), frontier: 1 })
            .await;
        assert!(matches!(res, NodeResponse::Error { code, .. } if code == NODE_ERROR.code));

        f.receiver.expect_source(1);
        let res = f
            .receiver
            .on_request(2, NodeRequest::SyncEPart { change: change(1), frontier: 1 })
            .await;
        assert!(matches!(res, NodeResponse::Error { code, .. } if code == NODE_ERROR.code));
        assert_eq!(f.sequencer.committed_id(), 0);

        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncEPart { change: change(1), frontier: 1 })
            .await;
        assert_eq!(res, NodeResponse::SyncEPart { next_change_id: None });
        assert_eq!(f.sequencer.committed_id(), 1);
    }

    #[tokio::test]
    async fn test_part_ack_offsets() {
        let f = fixture(NodeStatus::Away).await;
        f.receiver.expect_source(1);
        let part = |offset, data: &[u8], more| SyncPart {
            target: "0000000000000001-0000000000000002.json".to_string(),
            offset,
            data: data.to_vec(),
            more,
        };

        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncAPart { part: part(0, b"[{\"id\":1,", true) })
            .await;
        let NodeResponse::SyncAPart { ack } = res else {
            panic!("unexpected response");
        };
        assert_eq!(ack.offset, 9);

        let res = f
            .receiver
            .on_request(1, NodeRequest::SyncAPart { part: part(9, b"x", false) })
            .await;
        let NodeResponse::SyncAPart { ack } = res else {
            panic!("unexpected response");
        };
        assert!(ack.is_complete());
    }

    #[tokio::test]
    async fn test_caught_up_after_offline_budget() {
        let f = fixture(NodeStatus::Offline).await;
        assert_eq!(f.synchronizer.poll_once().await, SyncPoll::Waiting);
        assert_eq!(f.synchronizer.poll_once().await, SyncPoll::Waiting);
        assert_eq!(f.synchronizer.poll_once().await, SyncPoll::CaughtUp);
        assert_eq!(f.registry.status(), NodeStatus::Ready);
        assert_eq!(f.synchronizer.poll_once().await, SyncPoll::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_source_fails() {
        let f = fixture(NodeStatus::Away).await;
        assert_eq!(f.synchronizer.poll_once().await, SyncPoll::Failed);
        assert_eq!(f.registry.status(), NodeStatus::Synchronizing);
        // the chosen source is remembered for the next poll
        assert_eq!(f.receiver.source(), Some(1));
    }
}
