// Core data models and structures
// Configuration access and the persisted node state file

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use strand_common::{ChangeId, DEFAULT_NODE_PORT, NodeId, Result, StrandError, parse_peer};

/// Name of the persisted node state file inside the data directory
pub const NODE_STATE_FILE: &str = "node.json";

/// Application configuration wrapper
/// Provides typed access to configuration values with defaults
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    // ===================== Node =====================

    /// Node id of this process (default: 0)
    pub fn node_id(&self) -> NodeId {
        self.get_u64("strand.node.id", 0) as NodeId
    }

    /// Address peers use to reach this node
    pub fn node_address(&self) -> String {
        self.config
            .get_string("strand.node.address")
            .unwrap_or_else(|_| strand_common::local_ip())
    }

    /// Port for node-to-node connections (default: 9220)
    pub fn node_port(&self) -> u16 {
        self.get_u64("strand.node.port", DEFAULT_NODE_PORT as u64) as u16
    }

    /// Directory holding the node state file, archive and store
    pub fn data_dir(&self) -> PathBuf {
        self.config
            .get_string("strand.data.dir")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"))
    }

    /// Cluster members as `(id, host, port)`, parsed from `id@host:port` entries
    pub fn cluster_nodes(&self) -> Vec<(NodeId, String, u16)> {
        self.config
            .get::<Vec<String>>("strand.cluster.nodes")
            .unwrap_or_default()
            .iter()
            .filter_map(|s| parse_peer(s))
            .collect()
    }

    // ===================== Protocol timeouts (ms) =====================

    pub fn connect_timeout_ms(&self) -> u64 {
        self.get_u64("strand.protocol.connect-timeout", 5000)
    }

    pub fn change_id_timeout_ms(&self) -> u64 {
        self.get_u64("strand.protocol.change-id-timeout", 60000)
    }

    pub fn away_timeout_ms(&self) -> u64 {
        self.get_u64("strand.protocol.away-timeout", 5000)
    }

    pub fn setup_timeout_ms(&self) -> u64 {
        self.get_u64("strand.protocol.setup-timeout", 10000)
    }

    pub fn sync_part_timeout_ms(&self) -> u64 {
        self.get_u64("strand.protocol.sync-part-timeout", 10000)
    }

    pub fn sync_done_timeout_ms(&self) -> u64 {
        self.get_u64("strand.protocol.sync-done-timeout", 300000)
    }

    /// Interval of the connect/heartbeat round (default: 2s)
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.get_u64("strand.protocol.heartbeat-interval", 2000)
    }

    // ===================== Changes =====================

    /// Delay before a missing change is requested from peers (default: 6s)
    pub fn changes_missing_timeout_ms(&self) -> u64 {
        self.get_u64("strand.changes.missing-timeout", 6000)
    }

    /// Delay before a gap in change ids is skipped (default: 42s)
    pub fn changes_gap_timeout_ms(&self) -> u64 {
        self.get_u64("strand.changes.gap-timeout", 42000)
    }

    /// Delay before a pending change without content is killed (default: 21s)
    pub fn changes_new_timeout_ms(&self) -> u64 {
        self.get_u64("strand.changes.new-timeout", 21000)
    }

    pub fn changes_max_id_gap(&self) -> u64 {
        self.get_u64("strand.changes.max-id-gap", 1000)
    }

    pub fn changes_max_propose_attempts(&self) -> u32 {
        self.get_u64("strand.changes.max-propose-attempts", 3) as u32
    }

    pub fn changes_commit_interval_ms(&self) -> u64 {
        self.get_u64("strand.changes.commit-interval", 1000)
    }

    // ===================== Archive =====================

    /// Number of committed changes kept in memory (default: 1000)
    pub fn archive_threshold(&self) -> usize {
        self.get_u64("strand.archive.threshold", 1000) as usize
    }

    // ===================== Sync =====================

    pub fn sync_initial_delay_ms(&self) -> u64 {
        self.get_u64("strand.sync.initial-delay", 2000)
    }

    pub fn sync_poll_interval_ms(&self) -> u64 {
        self.get_u64("strand.sync.poll-interval", 1000)
    }

    pub fn sync_repeat_interval_ms(&self) -> u64 {
        self.get_u64("strand.sync.repeat-interval", 5000)
    }

    pub fn sync_retry_offline(&self) -> u32 {
        self.get_u64("strand.sync.retry-offline", 60) as u32
    }

    pub fn sync_part_size(&self) -> usize {
        self.get_u64("strand.sync.part-size", 131072) as usize
    }

    // ===================== Away =====================

    pub fn away_base_delay_ms(&self) -> u64 {
        self.get_u64("strand.away.base-delay", 2500)
    }

    pub fn away_step_delay_ms(&self) -> u64 {
        self.get_u64("strand.away.step-delay", 17000)
    }

    pub fn away_soon_timer_ms(&self) -> u64 {
        self.get_u64("strand.away.soon-timer", 10000)
    }

    pub fn away_block_time_ms(&self) -> u64 {
        self.get_u64("strand.away.block-time", 15000)
    }

    pub fn away_skip_count(&self) -> u32 {
        self.get_u64("strand.away.skip-count", 25) as u32
    }

    pub fn away_sync_wait_ms(&self) -> u64 {
        self.get_u64("strand.away.sync-wait", 3000)
    }

    // ===================== Metrics =====================

    pub fn metrics_enabled(&self) -> bool {
        self.config.get_bool("strand.metrics.enabled").unwrap_or(false)
    }

    pub fn metrics_port(&self) -> u16 {
        self.get_u64("strand.metrics.port", 9464) as u16
    }
}

/// Node state persisted between restarts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateFile {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub committed_change_id: ChangeId,
    pub stored_change_id: ChangeId,
}

impl NodeStateFile {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(NODE_STATE_FILE)
    }

    /// Load the state file; a missing or unreadable file is an operator error
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            StrandError::InvalidNodeState(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            StrandError::InvalidNodeState(format!("corrupt {}: {}", path.display(), e))
        })
    }

    /// Write the state file through a temporary file and rename
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| StrandError::BadData(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
