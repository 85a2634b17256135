// Sync source
// Serves REQ_SYNC while this node is away and drives one session per peer

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use strand_api::model::ChangePackage;
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

/// Where a session currently is; offsets only move on acknowledgement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Full {
        files: Vec<String>,
        index: usize,
        offset: u64,
    },
    Archive {
        files: Vec<String>,
        index: usize,
        offset: u64,
    },
    Live {
        next: ChangeId,
    },
    Done,
}

impl SyncPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SyncPhase::Full { .. } => "full",
            SyncPhase::Archive { .. } => "archive",
            SyncPhase::Live { .. } => "live",
            SyncPhase::Done => "done",
        }
    }
}

/// Sync state for one lagging peer
#[derive(Clone, Debug)]
pub struct SyncSession {
    pub node_id: NodeId,
    pub phase: SyncPhase,
    pub started: Instant,
}

pub struct SyncServer {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    sequencer: Arc<ChangeSequencer>,
    state_store: Arc<dyn StateStore>,
    archive_store: Arc<dyn ArchiveStore>,
    timeouts: ProtocolTimeouts,
    config: SyncConfig,
    sessions: DashMap<NodeId, SyncSession>,
}

impl SyncServer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        sequencer: Arc<ChangeSequencer>,
        state_store: Arc<dyn StateStore>,
        archive_store: Arc<dyn ArchiveStore>,
        timeouts: ProtocolTimeouts,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            sequencer,
            state_store,
            archive_store,
            timeouts,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn session(&self, node_id: NodeId) -> Option<SyncSession> {
        self.sessions.get(&node_id).map(|s| s.clone())
    }

    /// Answer `REQ_SYNC` from `from`, starting a session when none is running
    pub async fn on_sync_request(self: &Arc<Self>, from: NodeId, start: ChangeId) -> NodeResponse {
        let status = self.registry.status();
        if !status.is_away_or_soon() {
            return NodeResponse::error(
                NODE_ERROR,
                format!("node is {} and cannot serve a sync", status),
            );
        }
        if self.sessions.contains_key(&from) {
            debug!(node_id = from, "Sync session already running");
            return NodeResponse::Sync;
        }
        if !self.registry.acquire_sync_ref(from) {
            return NodeResponse::error(
                NODE_ERROR,
                format!("node {} is unknown", from),
            );
        }

        let phase = match self.plan(start, true) {
            Ok(phase) => phase,
            Err(e) => {
                self.registry.release_sync_ref(from).await;
                return e.into();
            }
        };
        info!(node_id = from, start, "Starting {} sync", phase.name());
        self.sessions.insert(
            from,
            SyncSession {
                node_id: from,
                phase,
                started: Instant::now(),
            },
        );

        let server = self.clone();
        tokio::spawn(async move {
            server.drive(from).await;
        });
        NodeResponse::Sync
    }

    /// First phase needed to bring a peer from `start` onwards
    fn plan(&self, start: ChangeId, allow_full: bool) -> Result<SyncPhase> {
        let memory_first = {
            let log = self.sequencer.log().lock();
            let archive = log.archive();
            archive.first_id().unwrap_or(archive.last_id() + 1)
        };
        if start >= memory_first {
            return Ok(SyncPhase::Live { next: start });
        }

        let files: Vec<_> = self
            .archive_store
            .files()?
            .into_iter()
            .filter(|f| f.last >= start && f.first < memory_first)
            .collect();
        let earliest = files.first().map(|f| f.first).unwrap_or(memory_first);

        if start < earliest && allow_full {
            if self.state_store.stored_change_id() > 0 {
                return Ok(SyncPhase::Full {
                    files: self.state_store.files()?,
                    index: 0,
                    offset: 0,
                });
            }
            warn!(start, "No snapshot available, changes before {} cannot be sent", earliest);
        }

        if files.is_empty() {
            Ok(SyncPhase::Live { next: start })
        } else {
            Ok(SyncPhase::Archive {
                files: files.into_iter().map(|f| f.name).collect(),
                index: 0,
                offset: 0,
            })
        }
    }

    async fn drive(self: Arc<Self>, node_id: NodeId) {
        match self.run_session(node_id).await {
            Ok(()) => info!(node_id, "Sync finished"),
            Err(e) => warn!(node_id, "Sync stopped: {}", e),
        }
        self.sessions.remove(&node_id);
        self.registry.release_sync_ref(node_id).await;
    }

    async fn run_session(&self, node_id: NodeId) -> Result<()> {
        loop {
            let phase = self
                .sessions
                .get(&node_id)
                .map(|s| s.phase.clone())
                .ok_or_else(|| StrandError::SyncInterrupted("session was dropped".to_string()))?;

            let next = match phase {
                SyncPhase::Full {
                    files,
                    index,
                    offset,
                } => self.step_full(node_id, files, index, offset).await?,
                SyncPhase::Archive {
                    files,
                    index,
                    offset,
                } => self.step_archive(node_id, files, index, offset).await?,
                SyncPhase::Live { next } => self.step_live(node_id, next).await?,
                SyncPhase::Done => return Ok(()),
            };

            if let Some(mut session) = self.sessions.get_mut(&node_id) {
                if session.phase.name() != next.name() {
                    debug!(node_id, "Sync phase {} -> {}", session.phase.name(), next.name());
                }
                session.phase = next;
            }
        }
    }

    async fn step_full(
        &self,
        node_id: NodeId,
        files: Vec<String>,
        index: usize,
        offset: u64,
    ) -> Result<SyncPhase> {
        let Some(target) = files.get(index) else {
            return match self
                .request(node_id, NodeRequest::SyncFDone, self.timeouts.sync_done)
                .await?
            {
                NodeResponse::SyncFDone { next_change_id } => self.plan(next_change_id, false),
                other => Err(unexpected("SYNCFDONE", &other)),
            };
        };

        let (data, more) = self
            .state_store
            .read_part(target, offset, self.config.part_size)?;
        let part = sync_part(target, offset, data, more);
        match self
            .request(node_id, NodeRequest::SyncFPart { part }, self.timeouts.sync_part)
            .await?
        {
            NodeResponse::SyncFPart { ack } => Ok(advance(ack, files, index, |files, index, offset| {
                SyncPhase::Full { files, index, offset }
            })),
            other => Err(unexpected("SYNCFPART", &other)),
        }
    }

    async fn step_archive(
        &self,
        node_id: NodeId,
        files: Vec<String>,
        index: usize,
        offset: u64,
    ) -> Result<SyncPhase> {
        let Some(target) = files.get(index) else {
            return match self
                .request(node_id, NodeRequest::SyncADone, self.timeouts.sync_done)
                .await?
            {
                NodeResponse::SyncADone { next_change_id } => Ok(SyncPhase::Live {
                    next: next_change_id,
                }),
                other => Err(unexpected("SYNCADONE", &other)),
            };
        };

        let (data, more) = self
            .archive_store
            .read_part(target, offset, self.config.part_size)?;
        let part = sync_part(target, offset, data, more);
        match self
            .request(node_id, NodeRequest::SyncAPart { part }, self.timeouts.sync_part)
            .await?
        {
            NodeResponse::SyncAPart { ack } => Ok(advance(ack, files, index, |files, index, offset| {
                SyncPhase::Archive { files, index, offset }
            })),
            other => Err(unexpected("SYNCAPART", &other)),
        }
    }

    /// Committed change at `next`, or the first one after a hole
    ///
    /// With `across_compacted` unset, ids that were moved to the archive store
    /// are reported as [`LiveChange::Compacted`] rather than stepped over.
    fn live_change(&self, next: ChangeId, across_compacted: bool) -> (LiveChange, ChangeId) {
        let log = self.sequencer.log().lock();
        let archive = log.archive();
        let change = if archive.is_compacted(next) {
            if !across_compacted {
                return (LiveChange::Compacted, log.committed_id());
            }
            archive.range(next).next().cloned()
        } else {
            archive
                .get(next)
                .or_else(|| archive.gap_ahead(next).and_then(|id| archive.get(id)))
        };
        let change = match change {
            Some(change) => LiveChange::Next(change.as_ref().clone()),
            None => LiveChange::Drained,
        };
        (change, log.committed_id())
    }

    async fn step_live(&self, node_id: NodeId, next: ChangeId) -> Result<SyncPhase> {
        let (change, frontier) = match self.live_change(next, false) {
            (LiveChange::Compacted, _) => {
                let phase = self.plan(next, false)?;
                if matches!(phase, SyncPhase::Archive { .. }) {
                    info!(
                        node_id,
                        next, "Changes were compacted during the sync, resending archive files"
                    );
                    return Ok(phase);
                }
                // nothing on disk covers them, the compacted ids were all holes
                debug!(node_id, next, "Compacted ids hold no changes");
                self.live_change(next, true)
            }
            found => found,
        };
        let change = match change {
            LiveChange::Next(change) => change,
            LiveChange::Drained | LiveChange::Compacted => {
                return match self
                    .request(node_id, NodeRequest::SyncEDone, self.timeouts.sync_done)
                    .await?
                {
                    NodeResponse::SyncEDone => Ok(SyncPhase::Done),
                    other => Err(unexpected("SYNCEDONE", &other)),
                };
            }
        };

        let change_id = change.id;
        match self
            .request(
                node_id,
                NodeRequest::SyncEPart { change, frontier },
                self.timeouts.sync_part,
            )
            .await?
        {
            NodeResponse::SyncEPart {
                next_change_id: Some(next),
            } => {
                if next <= change_id {
                    debug!(node_id, next, "Peer still misses an earlier change");
                }
                Ok(SyncPhase::Live { next })
            }
            // nothing missing up to the frontier; newer commits are sent next
            NodeResponse::SyncEPart {
                next_change_id: None,
            } => Ok(SyncPhase::Live {
                next: frontier + 1,
            }),
            other => Err(unexpected("SYNCEPART", &other)),
        }
    }

    /// Send a sync request, retrying on transport failures
    async fn request(
        &self,
        node_id: NodeId,
        request: NodeRequest,
        timeout: Duration,
    ) -> Result<NodeResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.request(node_id, request.clone(), timeout).await {
                Ok(NodeResponse::Error { code, message }) => {
                    return Err(StrandError::SyncInterrupted(format!(
                        "{} rejected by node {} ({}): {}",
                        request.name(),
                        node_id,
                        code,
                        message
                    )));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    debug!(node_id, attempt, "Retrying {}: {}", request.name(), e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// What the live phase finds at the next id
enum LiveChange {
    Next(ChangePackage),
    /// Moved to the archive store since the session was planned
    Compacted,
    /// Nothing newer than the peer's progress
    Drained,
}

fn sync_part(target: &str, offset: u64, data: Vec<u8>, more: bool) -> SyncPart {
    SyncPart {
        target: target.to_string(),
        offset,
        data,
        more,
    }
}

/// Next phase after an acknowledged part
fn advance(
    ack: PartAck,
    files: Vec<String>,
    index: usize,
    phase: impl FnOnce(Vec<String>, usize, u64) -> SyncPhase,
) -> SyncPhase {
    if ack.is_complete() {
        phase(files, index + 1, 0)
    } else {
        phase(files, index, ack.offset)
    }
}

fn unexpected(request: &str, response: &NodeResponse) -> StrandError {
    StrandError::SyncInterrupted(format!(
        "unexpected answer to {}: {}",
        request,
        response.proto()
    ))
}
