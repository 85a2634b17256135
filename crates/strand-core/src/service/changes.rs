//! Change sequencer
//!
//! Assigns cluster-wide ids to new changes, answers id requests from peers,
//! queues changes received from peers and commits everything strictly in id
//! order into the [`Archive`]. The queue and the archive live together in a
//! [`ChangeLog`] behind one mutex, which maintenance also takes while it runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use strand_api::model::{ChangePackage, ChangeScope, NodeStatus};
use strand_api::node::{NodeMessage, NodeResponse};
use strand_common::{ChangeId, NodeId, Result, StrandError};

use super::archive::{Archive, ArchiveConfig, ArchiveEntry, ArchiveStore};
use super::counters::{Counter, Counters};
use super::nodes::NodeRegistry;
use super::quorum::{QuorumCoordinator, QuorumDecision, QuorumKind, wins_tie_break};
use super::transport::NodeTransport;

/// Sequencer configuration
#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Wait before a missing change is requested from peers
    pub missing_timeout: Duration,
    /// Wait before a missing change id is given up
    pub gap_timeout: Duration,
    /// Wait before an id reserved by a peer without content is dropped
    pub new_timeout: Duration,
    /// How far ahead of the committed id a change may be queued
    pub max_id_gap: u64,
    /// Proposal attempts before a collision is reported to the caller
    pub max_propose_attempts: u32,
    /// Commit loop interval when nothing wakes it up earlier
    pub commit_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            missing_timeout: Duration::from_secs(6),
            gap_timeout: Duration::from_secs(42),
            new_timeout: Duration::from_secs(21),
            max_id_gap: 1000,
            max_propose_attempts: 3,
            commit_interval: Duration::from_secs(1),
        }
    }
}

impl SequencerConfig {
    pub fn from_configuration(config: &crate::model::Configuration) -> Self {
        Self {
            missing_timeout: Duration::from_millis(config.changes_missing_timeout_ms()),
            gap_timeout: Duration::from_millis(config.changes_gap_timeout_ms()),
            new_timeout: Duration::from_millis(config.changes_new_timeout_ms()),
            max_id_gap: config.changes_max_id_gap(),
            max_propose_attempts: config.changes_max_propose_attempts(),
            commit_interval: Duration::from_millis(config.changes_commit_interval_ms()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Id requested or reserved, no quorum confirmed yet
    PendingAccept,
    /// Content known and confirmed, waiting for its turn
    Accepted,
    Committed,
    /// Id given up without a commit
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote(NodeId),
}

type Waiter = oneshot::Sender<Result<ChangeId>>;

/// A queued change
#[derive(Debug)]
pub struct Change {
    pub id: ChangeId,
    pub node_id: NodeId,
    pub scope: ChangeScope,
    pub tasks: Vec<Vec<u8>>,
    pub status: ChangeStatus,
    pub origin: ChangeOrigin,
    created: Instant,
    waiter: Option<Waiter>,
}

impl Change {
    fn local(
        id: ChangeId,
        node_id: NodeId,
        scope: ChangeScope,
        tasks: Vec<Vec<u8>>,
        waiter: Waiter,
    ) -> Self {
        Self {
            id,
            node_id,
            scope,
            tasks,
            status: ChangeStatus::PendingAccept,
            origin: ChangeOrigin::Local,
            created: Instant::now(),
            waiter: Some(waiter),
        }
    }

    /// Id promised to a peer that has not sent the content yet
    fn reservation(id: ChangeId, node_id: NodeId) -> Self {
        Self {
            id,
            node_id,
            scope: ChangeScope::Cluster,
            tasks: Vec::new(),
            status: ChangeStatus::PendingAccept,
            origin: ChangeOrigin::Remote(node_id),
            created: Instant::now(),
            waiter: None,
        }
    }

    fn remote(package: ChangePackage) -> Self {
        Self {
            id: package.id,
            node_id: package.node_id,
            scope: package.scope,
            tasks: package.tasks,
            status: ChangeStatus::Accepted,
            origin: ChangeOrigin::Remote(package.node_id),
            created: Instant::now(),
            waiter: None,
        }
    }

    pub fn package(&self) -> ChangePackage {
        ChangePackage::new(self.id, self.node_id, self.scope, self.tasks.clone())
    }

    fn resolve(&mut self, result: Result<ChangeId>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }
}

/// Change queue and archive, guarded together
#[derive(Debug)]
pub struct ChangeLog {
    queue: BTreeMap<ChangeId, Change>,
    archive: Archive,
    committed_id: ChangeId,
    next_change_id: ChangeId,
    /// Since when the queue head has been waiting on a missing id
    gap_since: Option<Instant>,
    missing_requested: Option<(ChangeId, Instant)>,
}

impl ChangeLog {
    pub fn new(committed_id: ChangeId, archive: &ArchiveConfig) -> Self {
        Self {
            queue: BTreeMap::new(),
            archive: Archive::starting_after(committed_id, archive),
            committed_id,
            next_change_id: committed_id + 1,
            gap_since: None,
            missing_requested: None,
        }
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn archive_mut(&mut self) -> &mut Archive {
        &mut self.archive
    }

    pub fn committed_id(&self) -> ChangeId {
        self.committed_id
    }

    pub fn next_change_id(&self) -> ChangeId {
        self.next_change_id
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn track_id(&mut self, id: ChangeId) {
        self.next_change_id = self.next_change_id.max(id + 1);
    }

    /// Give up `id`, which must be the next id to commit
    fn skip_next(&mut self, id: ChangeId) -> Result<()> {
        if let Some(mut change) = self.queue.remove(&id) {
            change.resolve(Err(StrandError::QuorumLost(format!(
                "change id {} was given up",
                id
            ))));
        }
        self.archive.skip(id)?;
        self.committed_id = id;
        Ok(())
    }
}

pub type SharedChangeLog = Arc<Mutex<ChangeLog>>;

/// Applies committed changes to the local state
pub trait ChangeApplier: Send + Sync {
    fn apply(&self, change: &ChangePackage) -> Result<()>;
}

/// Applier that only logs what it would apply
pub struct LoggingApplier;

impl ChangeApplier for LoggingApplier {
    fn apply(&self, change: &ChangePackage) -> Result<()> {
        debug!(
            change_id = change.id,
            node_id = change.node_id,
            "Applying {} task(s) to {}",
            change.tasks.len(),
            change.scope
        );
        Ok(())
    }
}

/// Called when the local state can no longer be trusted
pub type FatalHandler = Arc<dyn Fn(&StrandError) + Send + Sync>;

/// Fatal handler terminating the process
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|err: &StrandError| {
        error!("Unrecoverable replication error, terminating: {}", err);
        std::process::exit(1);
    })
}

/// Answer to a peer asking for a change id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdAnswer {
    Accept,
    Reject,
    /// The id is held by the given node
    Collision(NodeId),
}

impl From<IdAnswer> for NodeResponse {
    fn from(answer: IdAnswer) -> Self {
        match answer {
            IdAnswer::Accept => NodeResponse::Accept,
            IdAnswer::Reject => NodeResponse::Reject,
            IdAnswer::Collision(node_id) => NodeResponse::Collision { node_id },
        }
    }
}

/// Outcome of one pass over the queue
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed: Vec<ChangeId>,
    /// Id worth requesting from peers
    pub missing: Option<ChangeId>,
    pub fatal: Option<StrandError>,
}

pub struct ChangeSequencer {
    config: SequencerConfig,
    log: SharedChangeLog,
    registry: Arc<NodeRegistry>,
    quorum: Arc<QuorumCoordinator>,
    transport: Arc<dyn NodeTransport>,
    applier: Arc<dyn ChangeApplier>,
    counters: Arc<Counters>,
    on_fatal: FatalHandler,
    wakeup: Notify,
    running: AtomicBool,
}

impl ChangeSequencer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SequencerConfig,
        log: SharedChangeLog,
        registry: Arc<NodeRegistry>,
        quorum: Arc<QuorumCoordinator>,
        transport: Arc<dyn NodeTransport>,
        applier: Arc<dyn ChangeApplier>,
        counters: Arc<Counters>,
        on_fatal: FatalHandler,
    ) -> Self {
        Self {
            config,
            log,
            registry,
            quorum,
            transport,
            applier,
            counters,
            on_fatal,
            wakeup: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn log(&self) -> &SharedChangeLog {
        &self.log
    }

    pub fn committed_id(&self) -> ChangeId {
        self.log.lock().committed_id
    }

    pub fn queue_len(&self) -> usize {
        self.log.lock().queue.len()
    }

    pub fn change_status(&self, change_id: ChangeId) -> Option<ChangeStatus> {
        let log = self.log.lock();
        if let Some(change) = log.queue.get(&change_id) {
            return Some(change.status);
        }
        if change_id == 0 || change_id > log.committed_id {
            return None;
        }
        match log.archive.entry(change_id) {
            Some(ArchiveEntry::Skipped(_)) => Some(ChangeStatus::Cancelled),
            _ => Some(ChangeStatus::Committed),
        }
    }

    /// Order `tasks` cluster-wide and wait until they are committed here
    pub async fn propose(&self, tasks: Vec<Vec<u8>>, scope: ChangeScope) -> Result<ChangeId> {
        let this_node = self.registry.this_node_id();
        if self.registry.status() != NodeStatus::Ready {
            return Err(StrandError::NodeUnavailable(this_node));
        }
        if !self.registry.has_quorum() {
            self.counters.incr(Counter::QuorumLost);
            return Err(StrandError::QuorumLost(
                "too few members are reachable".to_string(),
            ));
        }

        let attempts = self.config.max_propose_attempts.max(1);
        let mut collision = StrandError::Collision {
            change_id: 0,
            node_id: this_node,
        };
        for attempt in 1..=attempts {
            let (change_id, done) = self.allocate(this_node, scope, tasks.clone())?;

            match self.quorum.request(QuorumKind::ChangeId(change_id)).await {
                QuorumDecision::Accepted => match self.confirm(change_id) {
                    Some(package) => {
                        self.broadcast(package);
                        self.commit_pending();
                        match done.await {
                            Ok(Err(err @ StrandError::Collision { .. })) => collision = err,
                            Ok(result) => return result,
                            Err(_) => {
                                return Err(StrandError::InternalError(format!(
                                    "change {} was dropped before it was committed",
                                    change_id
                                )));
                            }
                        }
                    }
                    None => {
                        collision = StrandError::Collision {
                            change_id,
                            node_id: self.holder_of(change_id),
                        };
                    }
                },
                QuorumDecision::Collision { node_id } => {
                    self.discard(change_id);
                    collision = StrandError::Collision { change_id, node_id };
                }
                decision => {
                    self.discard(change_id);
                    self.counters.incr(Counter::QuorumLost);
                    warn!(change_id, "No quorum for change id: {:?}", decision);
                    return Err(StrandError::QuorumLost(format!(
                        "change id {}: {:?}",
                        change_id, decision
                    )));
                }
            }
            debug!(change_id, attempt, "Change id collision ({}), retrying", collision);
        }
        Err(collision)
    }

    fn allocate(
        &self,
        this_node: NodeId,
        scope: ChangeScope,
        tasks: Vec<Vec<u8>>,
    ) -> Result<(ChangeId, oneshot::Receiver<Result<ChangeId>>)> {
        let mut log = self.log.lock();
        let change_id = log.next_change_id.max(log.committed_id + 1);
        if change_id > log.committed_id + self.config.max_id_gap {
            self.counters.incr(Counter::ChangesFailed);
            return Err(StrandError::InternalError(format!(
                "change id {} is too far ahead of committed id {}",
                change_id, log.committed_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        log.queue
            .insert(change_id, Change::local(change_id, this_node, scope, tasks, tx));
        log.track_id(change_id);
        self.registry
            .set_this_progress(log.committed_id, log.next_change_id);
        Ok((change_id, rx))
    }

    /// Promote a local proposal to accepted, unless it was lost meanwhile
    fn confirm(&self, change_id: ChangeId) -> Option<ChangePackage> {
        let mut log = self.log.lock();
        let change = log.queue.get_mut(&change_id)?;
        if change.origin != ChangeOrigin::Local || change.status != ChangeStatus::PendingAccept {
            return None;
        }
        change.status = ChangeStatus::Accepted;
        Some(change.package())
    }

    fn discard(&self, change_id: ChangeId) {
        let mut log = self.log.lock();
        if log
            .queue
            .get(&change_id)
            .is_some_and(|c| c.origin == ChangeOrigin::Local)
        {
            log.queue.remove(&change_id);
        }
    }

    fn holder_of(&self, change_id: ChangeId) -> NodeId {
        let log = self.log.lock();
        log.queue
            .get(&change_id)
            .map(|c| c.node_id)
            .or_else(|| log.archive.get(change_id).map(|c| c.node_id))
            .unwrap_or_else(|| self.registry.this_node_id())
    }

    fn broadcast(&self, change: ChangePackage) {
        for peer in self.registry.reachable_peers() {
            if let Err(e) = self.transport.send(
                peer,
                NodeMessage::Change {
                    change: change.clone(),
                },
            ) {
                debug!(peer, change_id = change.id, "Change not sent: {}", e);
            }
        }
    }

    /// Answer a peer asking to use `change_id`
    pub fn accept_id(&self, change_id: ChangeId, from: NodeId) -> IdAnswer {
        let cluster_size = self.registry.len();
        let mut log = self.log.lock();

        if change_id <= log.committed_id {
            return match log.archive.get(change_id) {
                Some(change) => IdAnswer::Collision(change.node_id),
                None => IdAnswer::Reject,
            };
        }
        if change_id > log.committed_id + self.config.max_id_gap {
            warn!(
                change_id,
                from,
                "Refusing change id, committed id is {}",
                log.committed_id
            );
            return IdAnswer::Reject;
        }

        let answer = match log.queue.get_mut(&change_id) {
            None => {
                log.queue
                    .insert(change_id, Change::reservation(change_id, from));
                IdAnswer::Accept
            }
            Some(change) if change.node_id == from => IdAnswer::Accept,
            Some(change) if change.status == ChangeStatus::Accepted => {
                IdAnswer::Collision(change.node_id)
            }
            // only this node's own proposal may be given up, `confirm` notices;
            // an id reserved for another node stays with it
            Some(change)
                if change.origin == ChangeOrigin::Local
                    && !wins_tie_break(change.node_id, from, change_id, cluster_size) =>
            {
                info!(change_id, from, "Conceding change id");
                *change = Change::reservation(change_id, from);
                IdAnswer::Accept
            }
            Some(change) => IdAnswer::Collision(change.node_id),
        };
        if answer == IdAnswer::Accept {
            log.track_id(change_id);
        }
        answer
    }

    /// Queue a change received from a peer; returns whether it was queued
    pub fn accept_remote(&self, change: ChangePackage) -> bool {
        let cluster_size = self.registry.len();
        let change_id = change.id;
        {
            let mut log = self.log.lock();
            if change_id <= log.committed_id {
                debug!(change_id, "Ignoring change at or below the committed id");
                return false;
            }
            if change_id > log.committed_id + self.config.max_id_gap {
                warn!(
                    change_id,
                    "Dropping change too far ahead of committed id {}", log.committed_id
                );
                return false;
            }

            let queued_ahead = log.queue.range(change_id + 1..).next().is_some();
            match log.queue.get_mut(&change_id) {
                None => {
                    if queued_ahead {
                        self.counters.incr(Counter::ChangesUnaligned);
                    }
                    log.queue.insert(change_id, Change::remote(change));
                }
                Some(queued) if queued.status != ChangeStatus::Accepted => {
                    *queued = Change::remote(change);
                }
                Some(queued) if queued.node_id == change.node_id => return false,
                Some(queued) => {
                    if !wins_tie_break(change.node_id, queued.node_id, change_id, cluster_size) {
                        debug!(change_id, node_id = change.node_id, "Dropping losing change");
                        return false;
                    }
                    warn!(
                        change_id,
                        "Change from node {} replaces change from node {}",
                        change.node_id,
                        queued.node_id
                    );
                    queued.resolve(Err(StrandError::Collision {
                        change_id,
                        node_id: change.node_id,
                    }));
                    *queued = Change::remote(change);
                    self.counters.incr(Counter::ChangesKilled);
                }
            }
            log.track_id(change_id);
        }
        self.wakeup.notify_one();
        true
    }

    /// A committed or accepted change this node can hand to a peer
    pub fn lookup(&self, change_id: ChangeId) -> Option<ChangePackage> {
        let log = self.log.lock();
        if let Some(change) = log.archive.get(change_id) {
            return Some(change.as_ref().clone());
        }
        log.queue
            .get(&change_id)
            .filter(|c| c.status == ChangeStatus::Accepted)
            .map(Change::package)
    }

    /// Answer `NODE_MISSING_CHANGE` from `from`
    pub fn on_missing_change(&self, from: NodeId, change_id: ChangeId) {
        match self.lookup(change_id) {
            Some(change) => {
                if let Err(e) = self.transport.send(from, NodeMessage::Change { change }) {
                    debug!(from, change_id, "Missing change not sent: {}", e);
                }
            }
            None => debug!(from, change_id, "Requested change is not available"),
        }
    }

    /// Lowest id after the committed id not yet queued with content
    pub fn next_missing_id(&self) -> ChangeId {
        let log = self.log.lock();
        let mut change_id = log.committed_id + 1;
        while log
            .queue
            .get(&change_id)
            .is_some_and(|c| c.status == ChangeStatus::Accepted)
        {
            change_id += 1;
        }
        change_id
    }

    /// Commit whatever is ready and handle missing ids and fatal errors
    pub fn commit_pending(&self) -> CommitReport {
        let report = self.process();
        if let Some(err) = &report.fatal {
            (self.on_fatal)(err);
        }
        if let Some(change_id) = report.missing {
            self.request_missing(change_id);
        }
        report
    }

    fn process(&self) -> CommitReport {
        let mut report = CommitReport::default();
        let now = Instant::now();
        let mut log = self.log.lock();

        loop {
            let expected = log.committed_id + 1;
            let Some((id, status, origin, created)) = log
                .queue
                .first_key_value()
                .map(|(id, c)| (*id, c.status, c.origin, c.created))
            else {
                log.gap_since = None;
                break;
            };

            if id < expected {
                if let Some(mut stale) = log.queue.remove(&id) {
                    let holder = log.archive.get(id).map(|c| c.node_id).unwrap_or(stale.node_id);
                    stale.resolve(Err(StrandError::Collision {
                        change_id: id,
                        node_id: holder,
                    }));
                }
                continue;
            }

            if id > expected {
                let since = *log.gap_since.get_or_insert(now);
                let waited = now.duration_since(since);
                if waited >= self.config.gap_timeout {
                    warn!(change_id = expected, "Skipping missing change after {:?}", waited);
                    if let Err(e) = log.skip_next(expected) {
                        report.fatal = Some(e);
                        break;
                    }
                    self.counters.incr(Counter::ChangesSkipped);
                    log.gap_since = Some(now);
                    continue;
                }
                if waited >= self.config.missing_timeout {
                    report.missing = Some(expected);
                }
                break;
            }

            match status {
                ChangeStatus::Accepted => {
                    let Some(mut change) = log.queue.remove(&id) else {
                        break;
                    };
                    let package = Arc::new(change.package());
                    if let Err(e) = self.applier.apply(&package) {
                        report.fatal = Some(StrandError::ApplyFailed {
                            change_id: id,
                            reason: e.to_string(),
                        });
                        break;
                    }
                    if let Err(e) = log.archive.append(package) {
                        report.fatal = Some(e);
                        break;
                    }
                    log.committed_id = id;
                    if log.gap_since.take().is_some() {
                        self.counters.incr(Counter::ChangesWithGap);
                    }
                    self.counters
                        .record_commit(now.duration_since(change.created));
                    change.resolve(Ok(id));
                    report.committed.push(id);
                }
                ChangeStatus::PendingAccept => {
                    if origin == ChangeOrigin::Local {
                        break;
                    }
                    let age = now.duration_since(created);
                    if age >= self.config.new_timeout {
                        warn!(change_id = id, "Killing reserved change id after {:?}", age);
                        log.queue.remove(&id);
                        self.counters.incr(Counter::ChangesKilled);
                        continue;
                    }
                    if age >= self.config.missing_timeout {
                        report.missing = Some(id);
                    }
                    break;
                }
                ChangeStatus::Committed | ChangeStatus::Cancelled => {
                    log.queue.remove(&id);
                }
            }
        }

        if let Some(change_id) = report.missing {
            match log.missing_requested {
                Some((requested, at))
                    if requested == change_id
                        && now.duration_since(at) < self.config.missing_timeout =>
                {
                    report.missing = None;
                }
                _ => log.missing_requested = Some((change_id, now)),
            }
        }
        if !report.committed.is_empty() {
            debug!(
                "Committed {} change(s), committed id is now {}",
                report.committed.len(),
                log.committed_id
            );
        }
        self.registry
            .set_this_progress(log.committed_id, log.next_change_id);
        report
    }

    fn request_missing(&self, change_id: ChangeId) {
        info!(change_id, "Requesting missing change from peers");
        for peer in self.registry.reachable_peers() {
            if let Err(e) = self
                .transport
                .send(peer, NodeMessage::MissingChange { change_id })
            {
                debug!(peer, change_id, "Missing change request not sent: {}", e);
            }
        }
    }

    /// Commit a change delivered by a sync source
    ///
    /// The source is authoritative: ids between the committed id and the
    /// change are holes it skipped, so they are skipped here too.
    pub fn commit_synced(&self, change: ChangePackage) -> Result<CommitReport> {
        {
            let mut log = self.log.lock();
            if change.id <= log.committed_id {
                return Ok(CommitReport::default());
            }
            while log.committed_id + 1 < change.id {
                let hole = log.committed_id + 1;
                log.skip_next(hole)?;
                self.counters.incr(Counter::ChangesSkipped);
            }
            log.track_id(change.id);
            log.queue.insert(change.id, Change::remote(change));
        }
        let report = self.commit_pending();
        if let Some(err) = &report.fatal {
            return Err(StrandError::InternalError(err.to_string()));
        }
        Ok(report)
    }

    /// Replay changes persisted by archive sync; returns how many were committed
    pub fn load_synced_archive(&self, store: &dyn ArchiveStore) -> Result<usize> {
        let after = self.committed_id();
        let mut committed = 0;
        for change in store.load(after)? {
            committed += self.commit_synced(change)?.committed.len();
        }
        Ok(committed)
    }

    /// Continue after a restored snapshot holding every change up to `stored_id`
    pub fn restore(&self, stored_id: ChangeId) {
        let mut log = self.log.lock();
        let stale: Vec<ChangeId> = log.queue.range(..=stored_id).map(|(id, _)| *id).collect();
        for id in stale {
            if let Some(mut change) = log.queue.remove(&id) {
                change.resolve(Err(StrandError::SyncInterrupted(format!(
                    "change {} was replaced by a restored snapshot",
                    id
                ))));
            }
        }
        log.committed_id = stored_id;
        log.archive.reset(stored_id);
        log.track_id(stored_id);
        log.gap_since = None;
        self.registry
            .set_this_progress(log.committed_id, log.next_change_id);
        self.registry.set_this_stored(stored_id);
        info!(stored_id, "Restored from snapshot");
    }

    /// Wait until the queue is empty, `false` on timeout
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.queue_len() > 0 {
                self.wakeup.notify_one();
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Commit loop; returns after [`ChangeSequencer::stop`]
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut ticker = tokio::time::interval(self.config.commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.commit_pending();
        }
        debug!("Commit loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cluster::ProtocolTimeouts;
    use crate::service::member_event::StatusChangeEventPublisher;
    use crate::service::nodes::Node;
    use crate::service::transport::LocalNetwork;

    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<ChangeId>>,
        fail_on: Option<ChangeId>,
    }

    impl ChangeApplier for RecordingApplier {
        fn apply(&self, change: &ChangePackage) -> Result<()> {
            if self.fail_on == Some(change.id) {
                return Err(StrandError::BadData("cannot apply".to_string()));
            }
            self.applied.lock().push(change.id);
            Ok(())
        }
    }

    struct Fixture {
        sequencer: ChangeSequencer,
        applier: Arc<RecordingApplier>,
        counters: Arc<Counters>,
        fatal: Arc<AtomicBool>,
    }

    /// Sequencer of node 0 in a cluster of `members` nodes, all `READY`
    async fn fixture(members: u32, applier: RecordingApplier) -> Fixture {
        let events = Arc::new(StatusChangeEventPublisher::new(64));
        let mut this = Node::new(0, "127.0.0.1", 9220);
        this.status = NodeStatus::Ready;
        let registry = Arc::new(NodeRegistry::new(this, events));
        for id in 1..members {
            let mut node = Node::new(id, "127.0.0.1", 9220 + id as u16);
            node.status = NodeStatus::Ready;
            registry.register(node).await.unwrap();
        }

        let network = LocalNetwork::new();
        let transport: Arc<dyn NodeTransport> = network.transport(0);
        let quorum = Arc::new(QuorumCoordinator::new(
            registry.clone(),
            transport.clone(),
            ProtocolTimeouts::default(),
        ));
        let applier = Arc::new(applier);
        let counters = Arc::new(Counters::new());
        let fatal = Arc::new(AtomicBool::new(false));
        let fatal_flag = fatal.clone();
        let sequencer = ChangeSequencer::new(
            SequencerConfig::default(),
            Arc::new(Mutex::new(ChangeLog::new(0, &ArchiveConfig::default()))),
            registry,
            quorum,
            transport,
            applier.clone(),
            counters.clone(),
            Arc::new(move |_: &StrandError| fatal_flag.store(true, Ordering::SeqCst)),
        );
        Fixture {
            sequencer,
            applier,
            counters,
            fatal,
        }
    }

    fn change(id: ChangeId, node_id: NodeId) -> ChangePackage {
        ChangePackage::new(id, node_id, ChangeScope::Cluster, vec![vec![id as u8]])
    }

    #[tokio::test]
    async fn test_single_node_propose() {
        let f = fixture(1, RecordingApplier::default()).await;
        let first = f
            .sequencer
            .propose(vec![b"a".to_vec()], ChangeScope::Cluster)
            .await
            .unwrap();
        let second = f
            .sequencer
            .propose(vec![b"b".to_vec()], ChangeScope::Collection(7))
            .await
            .unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(*f.applier.applied.lock(), vec![1, 2]);
        assert_eq!(f.sequencer.committed_id(), 2);
        assert_eq!(f.sequencer.change_status(2), Some(ChangeStatus::Committed));
        assert_eq!(f.counters.get(Counter::ChangesCommitted), 2);
    }

    #[tokio::test]
    async fn test_propose_without_quorum() {
        // peers are registered as ready but nothing answers on the network
        let f = fixture(3, RecordingApplier::default()).await;
        let err = f
            .sequencer
            .propose(vec![b"a".to_vec()], ChangeScope::Cluster)
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::QuorumLost(_)));
        assert_eq!(f.sequencer.queue_len(), 0);
        assert_eq!(f.counters.get(Counter::QuorumLost), 1);
    }

    #[tokio::test]
    async fn test_accept_id_rules() {
        let f = fixture(3, RecordingApplier::default()).await;
        let s = &f.sequencer;

        assert_eq!(s.accept_id(5, 1), IdAnswer::Accept);
        assert_eq!(s.log().lock().next_change_id(), 6);
        // node 1 scores 0 for id 5, node 2 scores 1
        assert_eq!(s.accept_id(5, 2), IdAnswer::Collision(1));
        assert_eq!(s.accept_id(5, 1), IdAnswer::Accept);

        // node 1 would win id 6 from node 2, but the id is already reserved
        assert_eq!(s.accept_id(6, 2), IdAnswer::Accept);
        assert_eq!(s.accept_id(6, 1), IdAnswer::Collision(2));
        assert_eq!(s.accept_id(6, 2), IdAnswer::Accept);

        assert_eq!(s.accept_id(0, 1), IdAnswer::Reject);
        assert_eq!(s.accept_id(2000, 1), IdAnswer::Reject);
    }

    #[tokio::test]
    async fn test_own_proposal_concedes_to_tie_break_winner() {
        let f = fixture(3, RecordingApplier::default()).await;
        let s = &f.sequencer;

        // for id 1 node 0 scores 1, node 1 scores 2 and node 2 scores 0
        let (change_id, _done) = s.allocate(0, ChangeScope::Cluster, vec![vec![1]]).unwrap();
        assert_eq!(change_id, 1);
        assert_eq!(s.accept_id(1, 1), IdAnswer::Collision(0));
        assert_eq!(s.accept_id(1, 2), IdAnswer::Accept);

        // the proposal was given up and cannot be confirmed any more
        assert!(s.confirm(1).is_none());
        assert_eq!(s.accept_id(1, 1), IdAnswer::Collision(2));
    }

    #[tokio::test]
    async fn test_accept_id_after_commit_reports_holder() {
        let f = fixture(3, RecordingApplier::default()).await;
        assert!(f.sequencer.accept_remote(change(1, 2)));
        f.sequencer.commit_pending();
        assert_eq!(f.sequencer.accept_id(1, 1), IdAnswer::Collision(2));
    }

    #[tokio::test]
    async fn test_out_of_order_commit() {
        let f = fixture(3, RecordingApplier::default()).await;
        assert!(f.sequencer.accept_remote(change(2, 1)));
        assert!(f.sequencer.commit_pending().committed.is_empty());

        assert!(f.sequencer.accept_remote(change(1, 2)));
        assert_eq!(f.counters.get(Counter::ChangesUnaligned), 1);
        assert_eq!(f.sequencer.commit_pending().committed, vec![1, 2]);
        assert_eq!(*f.applier.applied.lock(), vec![1, 2]);

        // duplicates and stale changes are ignored
        assert!(!f.sequencer.accept_remote(change(2, 1)));
        assert_eq!(f.sequencer.next_missing_id(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_is_requested_then_skipped() {
        let f = fixture(3, RecordingApplier::default()).await;
        f.sequencer.accept_remote(change(2, 1));
        assert!(f.sequencer.commit_pending().missing.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(f.sequencer.commit_pending().missing, Some(1));
        // not requested again right away
        assert!(f.sequencer.commit_pending().missing.is_none());

        tokio::time::advance(Duration::from_secs(36)).await;
        let report = f.sequencer.commit_pending();
        assert_eq!(report.committed, vec![2]);
        assert_eq!(f.sequencer.change_status(1), Some(ChangeStatus::Cancelled));
        assert_eq!(f.counters.get(Counter::ChangesSkipped), 1);
        assert_eq!(f.counters.get(Counter::ChangesWithGap), 1);
        assert_eq!(f.sequencer.accept_id(1, 2), IdAnswer::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_is_killed() {
        let f = fixture(3, RecordingApplier::default()).await;
        assert_eq!(f.sequencer.accept_id(1, 1), IdAnswer::Accept);

        tokio::time::advance(Duration::from_secs(21)).await;
        f.sequencer.commit_pending();
        assert_eq!(f.sequencer.queue_len(), 0);
        assert_eq!(f.counters.get(Counter::ChangesKilled), 1);
    }

    #[tokio::test]
    async fn test_conflicting_content_uses_tie_break() {
        let f = fixture(3, RecordingApplier::default()).await;
        // id 4: node 2 scores 0, node 1 scores 2
        assert!(f.sequencer.accept_remote(change(4, 1)));
        assert!(f.sequencer.accept_remote(change(4, 2)));
        assert!(!f.sequencer.accept_remote(change(4, 1)));
        assert_eq!(f.sequencer.lookup(4).map(|c| c.node_id), Some(2));
    }

    #[tokio::test]
    async fn test_apply_failure_is_fatal() {
        let f = fixture(
            3,
            RecordingApplier {
                fail_on: Some(2),
                ..Default::default()
            },
        )
        .await;
        f.sequencer.accept_remote(change(1, 1));
        f.sequencer.accept_remote(change(2, 1));

        let report = f.sequencer.commit_pending();
        assert_eq!(report.committed, vec![1]);
        assert!(matches!(
            report.fatal,
            Some(StrandError::ApplyFailed { change_id: 2, .. })
        ));
        assert!(f.fatal.load(Ordering::SeqCst));
        assert_eq!(f.sequencer.committed_id(), 1);
    }

    #[tokio::test]
    async fn test_synced_changes_skip_source_holes() {
        let f = fixture(3, RecordingApplier::default()).await;
        f.sequencer.restore(40);
        assert_eq!(f.sequencer.committed_id(), 40);

        f.sequencer.commit_synced(change(41, 1)).unwrap();
        f.sequencer.commit_synced(change(44, 1)).unwrap();
        f.sequencer.commit_synced(change(44, 1)).unwrap();

        assert_eq!(*f.applier.applied.lock(), vec![41, 44]);
        assert_eq!(f.sequencer.change_status(42), Some(ChangeStatus::Cancelled));
        assert_eq!(f.sequencer.committed_id(), 44);
    }
}
