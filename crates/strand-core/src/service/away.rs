//! Away mode
//!
//! One node at a time leaves `READY` to run maintenance: it stores a snapshot,
//! compacts the archive and serves sync sessions to lagging peers. Nodes take
//! turns through a counter that grows while a node waits, a tie-break for
//! equal counters and a short-lived reservation granted by the quorum.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use strand_api::model::NodeStatus;
use strand_api::node::NodeResponse;
use strand_common::{ChangeId, NodeId, Result, StrandError};

use super::archive::ArchiveStore;
use super::changes::ChangeSequencer;
use super::counters::{Counter, Counters};
use super::nodes::NodeRegistry;
use super::quorum::{QuorumCoordinator, QuorumDecision, QuorumKind, wins_tie_break};
use super::sync::{SnapshotSource, StateStore, SyncServer};

/// Away coordinator configuration
#[derive(Clone, Debug)]
pub struct AwayConfig {
    /// Delay before the first attempt of the node with relative index 0
    pub base_delay: Duration,
    /// Extra delay per relative index
    pub step_delay: Duration,
    /// How long `AWAY_SOON` waits for the change queue to drain
    pub soon_timer: Duration,
    /// Lifetime of a reservation granted to a peer
    pub block_time: Duration,
    /// Attempts skipped for minor reasons while changes are pending
    pub skip_count: u32,
    /// Grace period for a synchronizing member to start its session
    pub sync_wait: Duration,
}

impl Default for AwayConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2500),
            step_delay: Duration::from_secs(17),
            soon_timer: Duration::from_secs(10),
            block_time: Duration::from_secs(15),
            skip_count: 25,
            sync_wait: Duration::from_secs(3),
        }
    }
}

impl AwayConfig {
    pub fn from_configuration(config: &crate::model::Configuration) -> Self {
        Self {
            base_delay: Duration::from_millis(config.away_base_delay_ms()),
            step_delay: Duration::from_millis(config.away_step_delay_ms()),
            soon_timer: Duration::from_millis(config.away_soon_timer_ms()),
            block_time: Duration::from_millis(config.away_block_time_ms()),
            skip_count: config.away_skip_count(),
            sync_wait: Duration::from_millis(config.away_sync_wait_ms()),
        }
    }

    /// Delay between attempts for a node at `relative_index`
    pub fn delay_for(&self, relative_index: usize) -> Duration {
        self.base_delay + self.step_delay * relative_index as u32
    }
}

/// Local maintenance run while this node is away
pub trait MaintenanceJob: Send + Sync {
    /// Persist the state up to `committed_id`; returns the stored change id
    fn run(&self, committed_id: ChangeId) -> Result<ChangeId>;
}

/// Stores a snapshot of the local state
pub struct SnapshotJob {
    store: Arc<dyn StateStore>,
    source: Arc<dyn SnapshotSource>,
}

impl SnapshotJob {
    pub fn new(store: Arc<dyn StateStore>, source: Arc<dyn SnapshotSource>) -> Self {
        Self { store, source }
    }
}

impl MaintenanceJob for SnapshotJob {
    fn run(&self, committed_id: ChangeId) -> Result<ChangeId> {
        self.store.save(committed_id, self.source.snapshot()?)?;
        Ok(committed_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The archive holds changes that could be compacted
    Minor,
    /// A member is synchronizing and needs a source
    Major,
}

/// Why this node did not go away now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deferral {
    /// The peer waited longer; this node's counter was bumped
    PeerAhead(NodeId),
    /// Same counter, the peer wins the tie-break
    PeerWinsTie(NodeId),
    PeerAway(NodeId),
    /// A reservation for another node is active
    Blocked(NodeId),
    QueueNotDrained,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwayOutcome {
    NotReady,
    NothingToDo,
    /// Minor reason skipped while changes are pending
    Skipped,
    Deferred(Deferral),
    /// The quorum refused the reservation
    Lost,
    Completed { stored_change_id: ChangeId },
}

/// Decide whether another member should go away first
///
/// `peers` holds `(node_id, away_counter)` of the candidates.
pub fn election(
    this_node: NodeId,
    own_counter: u32,
    peers: &[(NodeId, u32)],
    committed_id: ChangeId,
    cluster_size: usize,
) -> Option<Deferral> {
    if let Some((peer, _)) = peers.iter().find(|(_, counter)| *counter > own_counter) {
        return Some(Deferral::PeerAhead(*peer));
    }
    peers
        .iter()
        .filter(|(_, counter)| *counter == own_counter)
        .find(|(peer, _)| wins_tie_break(*peer, this_node, committed_id, cluster_size))
        .map(|(peer, _)| Deferral::PeerWinsTie(*peer))
}

/// Reservation granted by `accept`
#[derive(Clone, Copy, Debug, Default)]
pub struct AwayBlock {
    holder: Option<(NodeId, Instant)>,
}

impl AwayBlock {
    /// Current holder, if the reservation has not expired
    pub fn holder(&self, block_time: Duration) -> Option<NodeId> {
        self.holder
            .filter(|(_, since)| since.elapsed() < block_time)
            .map(|(node_id, _)| node_id)
    }

    /// Grant the reservation to `node_id` unless another node holds it
    pub fn grant(&mut self, node_id: NodeId, block_time: Duration) -> bool {
        match self.holder(block_time) {
            Some(holder) if holder != node_id => false,
            _ => {
                self.holder = Some((node_id, Instant::now()));
                true
            }
        }
    }

    pub fn release(&mut self, node_id: NodeId) {
        if self.holder.is_some_and(|(holder, _)| holder == node_id) {
            self.holder = None;
        }
    }
}

pub struct AwayCoordinator {
    config: AwayConfig,
    registry: Arc<NodeRegistry>,
    quorum: Arc<QuorumCoordinator>,
    sequencer: Arc<ChangeSequencer>,
    sync_server: Arc<SyncServer>,
    archive_store: Arc<dyn ArchiveStore>,
    job: Arc<dyn MaintenanceJob>,
    counters: Arc<Counters>,
    block: Mutex<AwayBlock>,
    skipped: AtomicU32,
    running: AtomicBool,
}

impl AwayCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AwayConfig,
        registry: Arc<NodeRegistry>,
        quorum: Arc<QuorumCoordinator>,
        sequencer: Arc<ChangeSequencer>,
        sync_server: Arc<SyncServer>,
        archive_store: Arc<dyn ArchiveStore>,
        job: Arc<dyn MaintenanceJob>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            config,
            registry,
            quorum,
            sequencer,
            sync_server,
            archive_store,
            job,
            counters,
            block: Mutex::new(AwayBlock::default()),
            skipped: AtomicU32::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Answer `REQ_AWAY` from a peer
    pub fn accept(&self, node_id: NodeId, counter: u32) -> NodeResponse {
        let status = self.registry.status();
        if status.is_away_or_soon() {
            debug!(node_id, "Rejecting away request, this node is {}", status);
            return NodeResponse::Reject;
        }
        if !self.block.lock().grant(node_id, self.config.block_time) {
            debug!(node_id, "Rejecting away request, another node holds the reservation");
            return NodeResponse::Reject;
        }
        self.registry.set_peer_away_counter(node_id, counter);
        NodeResponse::Accept
    }

    fn severity(&self) -> Option<Severity> {
        if self.registry.require_sync() {
            return Some(Severity::Major);
        }
        let archived = self.sequencer.log().lock().archive().len();
        (archived > 0).then_some(Severity::Minor)
    }

    /// One attempt to go away and run maintenance
    pub async fn trigger_once(&self) -> AwayOutcome {
        if self.registry.status() != NodeStatus::Ready {
            return AwayOutcome::NotReady;
        }
        let Some(severity) = self.severity() else {
            return AwayOutcome::NothingToDo;
        };

        if self.registry.len() == 1 {
            return self.maintain_alone().await;
        }

        if severity == Severity::Minor
            && self.sequencer.queue_len() > 0
            && self.skipped.load(Ordering::SeqCst) < self.config.skip_count
        {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            return AwayOutcome::Skipped;
        }

        if let Some(deferral) = self.check_peers() {
            debug!("Away deferred: {:?}", deferral);
            return AwayOutcome::Deferred(deferral);
        }

        let this_node = self.registry.this_node_id();
        if !self.block.lock().grant(this_node, self.config.block_time) {
            let holder = self
                .block
                .lock()
                .holder(self.config.block_time)
                .unwrap_or(this_node);
            return AwayOutcome::Deferred(Deferral::Blocked(holder));
        }

        let counter = self.registry.away_counter();
        let decision = self.quorum.request(QuorumKind::Away { counter }).await;
        if decision != QuorumDecision::Accepted {
            self.block.lock().release(this_node);
            self.counters.incr(Counter::QuorumLost);
            info!("Away request not accepted: {:?}", decision);
            return AwayOutcome::Lost;
        }

        let outcome = self.go_away(severity).await;
        self.block.lock().release(this_node);
        outcome
    }

    fn check_peers(&self) -> Option<Deferral> {
        let this_node = self.registry.this_node_id();
        let peers: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|n| n.id != this_node && n.status.is_reachable())
            .collect();

        if let Some(peer) = peers.iter().find(|n| n.status.is_away_or_soon()) {
            return Some(Deferral::PeerAway(peer.id));
        }

        let candidates: Vec<(NodeId, u32)> = peers
            .iter()
            .filter(|n| n.status == NodeStatus::Ready)
            .map(|n| (n.id, n.away_counter))
            .collect();
        let own = self.registry.away_counter();
        let deferral = election(
            this_node,
            own,
            &candidates,
            self.sequencer.committed_id(),
            self.registry.len(),
        );
        if matches!(deferral, Some(Deferral::PeerAhead(_))) {
            self.registry.set_away_counter(own + 1);
        }
        deferral
    }

    async fn go_away(&self, severity: Severity) -> AwayOutcome {
        if let Err(e) = self.registry.update_status(NodeStatus::AwaySoon).await {
            warn!("Cannot go away soon: {}", e);
            return AwayOutcome::NotReady;
        }
        if !self.sequencer.wait_drained(self.config.soon_timer).await {
            info!("Change queue did not drain, staying ready");
            self.set_status(NodeStatus::Ready).await;
            return AwayOutcome::Deferred(Deferral::QueueNotDrained);
        }
        self.set_status(NodeStatus::Away).await;
        info!("Away ({:?}), running maintenance", severity);

        let stored_change_id = match self.run_maintenance().await {
            Ok(stored) => stored,
            Err(e) => {
                error!("Maintenance failed: {}", e);
                self.registry
                    .this_node()
                    .stored_change_id
            }
        };

        self.serve_syncs().await;

        self.set_status(NodeStatus::AwaySoon).await;
        self.set_status(NodeStatus::Ready).await;
        self.registry.set_away_counter(0);
        self.skipped.store(0, Ordering::SeqCst);
        info!(stored_change_id, "Back from away");
        AwayOutcome::Completed { stored_change_id }
    }

    async fn set_status(&self, status: NodeStatus) {
        if let Err(e) = self.registry.update_status(status).await {
            warn!("Cannot change status to {}: {}", status, e);
        }
    }

    /// Store a snapshot and compact the archive on the blocking pool
    pub async fn run_maintenance(&self) -> Result<ChangeId> {
        let log = self.sequencer.log().clone();
        let job = self.job.clone();
        let store = self.archive_store.clone();

        let (stored, compacted) = tokio::task::spawn_blocking(move || -> Result<(ChangeId, usize)> {
            let mut log = log.lock();
            let stored = job.run(log.committed_id())?;
            let compacted = log.archive_mut().compact(store.as_ref())?;
            Ok((stored, compacted))
        })
        .await
        .map_err(|e| StrandError::InternalError(format!("maintenance task failed: {}", e)))??;

        self.counters.add(Counter::GarbageCollected, compacted as u64);
        self.registry.set_this_stored(stored);
        debug!(stored, compacted, "Maintenance finished");
        Ok(stored)
    }

    /// Keep serving while sessions run or a member still needs a source
    async fn serve_syncs(&self) {
        let started = Instant::now();
        loop {
            let waiting = self.registry.require_sync() && started.elapsed() < self.config.sync_wait;
            if !self.sync_server.has_sessions() && !waiting {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn maintain_alone(&self) -> AwayOutcome {
        let archived = self.sequencer.log().lock().archive().len();
        if archived < self.sequencer.log().lock().archive().threshold() {
            return AwayOutcome::NothingToDo;
        }
        match self.run_maintenance().await {
            Ok(stored_change_id) => AwayOutcome::Completed { stored_change_id },
            Err(e) => {
                error!("Maintenance failed: {}", e);
                AwayOutcome::NothingToDo
            }
        }
    }

    /// Attempt periodically until [`AwayCoordinator::stop`]
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            let index = self.registry.relative_index(self.sequencer.committed_id());
            tokio::time::sleep(self.config.delay_for(index)).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let outcome = self.trigger_once().await;
            debug!("Away attempt: {:?}", outcome);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for() {
        let config = AwayConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(2500));
        assert_eq!(config.delay_for(2), Duration::from_millis(36500));
    }

    #[test]
    fn test_election() {
        // a peer that waited longer goes first
        assert_eq!(election(0, 1, &[(1, 2), (2, 0)], 10, 3), Some(Deferral::PeerAhead(1)));
        // equal counters: for committed id 10, node 2 scores 0 and beats node 0
        assert_eq!(election(0, 0, &[(2, 0)], 10, 3), Some(Deferral::PeerWinsTie(2)));
        assert_eq!(election(2, 0, &[(0, 0), (1, 0)], 10, 3), None);
        // lower counters never win
        assert_eq!(election(1, 3, &[(2, 0)], 10, 3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_away_block() {
        let block_time = Duration::from_secs(15);
        let mut block = AwayBlock::default();
        assert!(block.grant(1, block_time));
        assert!(block.grant(1, block_time));
        assert!(!block.grant(2, block_time));
        assert_eq!(block.holder(block_time), Some(1));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(block.holder(block_time), None);
        assert!(block.grant(2, block_time));

        block.release(1);
        assert_eq!(block.holder(block_time), Some(2));
        block.release(2);
        assert!(block.grant(3, block_time));
    }

    #[test]
    fn test_snapshot_job() {
        use crate::service::sync::{EmptySnapshot, FileStateStore};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()).unwrap());
        let job = SnapshotJob::new(store.clone(), Arc::new(EmptySnapshot));
        assert_eq!(job.run(42).unwrap(), 42);
        assert_eq!(store.stored_change_id(), 42);
    }
}
