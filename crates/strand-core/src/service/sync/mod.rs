//! Catching up lagging nodes
//!
//! A node in `SYNCHRONIZING` asks a peer in `AWAY`/`AWAY_SOON` for everything
//! after its committed id. The source then drives up to three phases: a full
//! snapshot when its archive no longer reaches back far enough, the archive
//! files compacted to disk, and finally the changes still held in memory.

pub mod part;
mod receiver;
mod server;
mod state;

use std::time::Duration;

pub use receiver::{SyncPoll, SyncReceiver, Synchronizer};
pub use server::{SyncPhase, SyncServer, SyncSession};
pub use state::{EmptySnapshot, FileStateStore, SnapshotSource, StateManifest, StateStore};

/// Synchronizer configuration
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Delay before the first poll after startup
    pub initial_delay: Duration,
    /// Poll interval while searching for a source
    pub poll_interval: Duration,
    /// Poll interval after a sync round was started
    pub repeat_interval: Duration,
    /// Polls to wait for unreachable peers before declaring this node caught up
    pub retry_offline: u32,
    /// Maximum payload of a single sync part
    pub part_size: usize,
    /// Attempts per sync request before the session is dropped
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            repeat_interval: Duration::from_secs(5),
            retry_offline: 60,
            part_size: 128 * 1024,
            max_attempts: 3,
        }
    }
}

impl SyncConfig {
    pub fn from_configuration(config: &crate::model::Configuration) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.sync_initial_delay_ms()),
            poll_interval: Duration::from_millis(config.sync_poll_interval_ms()),
            repeat_interval: Duration::from_millis(config.sync_repeat_interval_ms()),
            retry_offline: config.sync_retry_offline(),
            part_size: config.sync_part_size().max(1),
            ..Default::default()
        }
    }
}
