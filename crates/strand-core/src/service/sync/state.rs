// Stored state snapshots
// Written by maintenance, transferred by full sync and restored on the receiver

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use strand_common::{ChangeId, Result, StrandError};

use super::part;

const MANIFEST: &str = "manifest.json";
const CURRENT_DIR: &str = "current";
const INCOMING_DIR: &str = "incoming";

/// Describes a stored snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateManifest {
    /// Every change up to this id is part of the snapshot
    pub stored_change_id: ChangeId,
    pub files: Vec<String>,
}

/// Produces the files making up a snapshot of the local state
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Snapshot without any state files, only the manifest is stored
pub struct EmptySnapshot;

impl SnapshotSource for EmptySnapshot {
    fn snapshot(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(Vec::new())
    }
}

/// Durable snapshots of the local state
pub trait StateStore: Send + Sync {
    /// Change id covered by the current snapshot, `0` without one
    fn stored_change_id(&self) -> ChangeId;

    /// Files to transfer for a full sync; the manifest comes last
    fn files(&self) -> Result<Vec<String>>;

    fn read_part(&self, name: &str, offset: u64, max: usize) -> Result<(Vec<u8>, bool)>;

    /// Write a received part into the incoming snapshot
    fn write_part(&self, name: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Make the incoming snapshot current; returns its change id
    fn restore(&self) -> Result<ChangeId>;

    /// Replace the current snapshot
    fn save(&self, stored_change_id: ChangeId, files: Vec<(String, Vec<u8>)>) -> Result<()>;
}

/// [`StateStore`] on the local file system
///
/// ```text
/// <dir>/current/manifest.json
/// <dir>/current/<state files>
/// <dir>/incoming/...            snapshot being received
/// ```
#[derive(Clone, Debug)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(CURRENT_DIR))?;
        Ok(Self { dir })
    }

    fn current(&self) -> PathBuf {
        self.dir.join(CURRENT_DIR)
    }

    fn incoming(&self) -> PathBuf {
        self.dir.join(INCOMING_DIR)
    }

    fn read_manifest(dir: &Path) -> Result<StateManifest> {
        let data = std::fs::read(dir.join(MANIFEST))?;
        serde_json::from_slice(&data)
            .map_err(|e| StrandError::BadData(format!("corrupt snapshot manifest: {}", e)))
    }

    pub fn manifest(&self) -> Option<StateManifest> {
        Self::read_manifest(&self.current()).ok()
    }

    /// Swap `dir` in as the current snapshot
    fn promote(&self, dir: &Path) -> Result<()> {
        let current = self.current();
        let previous = self.dir.join("previous");
        if previous.exists() {
            std::fs::remove_dir_all(&previous)?;
        }
        if current.exists() {
            std::fs::rename(&current, &previous)?;
        }
        std::fs::rename(dir, &current)?;
        if previous.exists() {
            std::fs::remove_dir_all(&previous)?;
        }
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn stored_change_id(&self) -> ChangeId {
        self.manifest().map(|m| m.stored_change_id).unwrap_or(0)
    }

    fn files(&self) -> Result<Vec<String>> {
        let manifest = Self::read_manifest(&self.current())?;
        let mut files = manifest.files;
        files.push(MANIFEST.to_string());
        Ok(files)
    }

    fn read_part(&self, name: &str, offset: u64, max: usize) -> Result<(Vec<u8>, bool)> {
        part::read_part(&part::resolve(&self.current(), name)?, offset, max)
    }

    fn write_part(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        part::write_part(&part::resolve(&self.incoming(), name)?, offset, data)
    }

    fn restore(&self) -> Result<ChangeId> {
        let incoming = self.incoming();
        let manifest = Self::read_manifest(&incoming).map_err(|e| {
            StrandError::SyncInterrupted(format!("incoming snapshot is incomplete: {}", e))
        })?;
        for file in &manifest.files {
            if !part::resolve(&incoming, file)?.is_file() {
                return Err(StrandError::SyncInterrupted(format!(
                    "incoming snapshot is missing `{}`",
                    file
                )));
            }
        }
        self.promote(&incoming)?;
        info!(
            stored_change_id = manifest.stored_change_id,
            "Restored snapshot with {} file(s)",
            manifest.files.len()
        );
        Ok(manifest.stored_change_id)
    }

    fn save(&self, stored_change_id: ChangeId, files: Vec<(String, Vec<u8>)>) -> Result<()> {
        let staging = self.dir.join("staging");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let mut names = Vec::with_capacity(files.len());
        for (name, data) in files {
            if name == MANIFEST {
                return Err(StrandError::BadData(format!(
                    "`{}` is reserved for the snapshot manifest",
                    MANIFEST
                )));
            }
            std::fs::write(part::resolve(&staging, &name)?, data)?;
            names.push(name);
        }
        let manifest = StateManifest {
            stored_change_id,
            files: names,
        };
        let data =
            serde_json::to_vec_pretty(&manifest).map_err(|e| StrandError::BadData(e.to_string()))?;
        std::fs::write(staging.join(MANIFEST), data)?;

        self.promote(&staging)?;
        debug!(stored_change_id, "Saved snapshot");
        Ok(())
    }
}
