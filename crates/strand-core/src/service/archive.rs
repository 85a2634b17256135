//! Archive of committed changes
//!
//! The archive is an ordered, gap-free log: every id from the oldest retained
//! entry through the newest is present, either as a committed change or as a
//! recorded hole left by a skipped id. Entries beyond the retention threshold
//! are compacted into an [`ArchiveStore`] during maintenance.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use strand_api::model::ChangePackage;
use strand_common::{ChangeId, Result, StrandError};

use super::sync::part;

/// Archive configuration
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    /// Number of entries kept in memory after compaction
    pub threshold: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { threshold: 1000 }
    }
}

impl ArchiveConfig {
    pub fn from_configuration(config: &crate::model::Configuration) -> Self {
        Self {
            threshold: config.archive_threshold(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveEntry {
    Change(Arc<ChangePackage>),
    /// Id given up after the gap timeout, no change was committed for it
    Skipped(ChangeId),
}

impl ArchiveEntry {
    pub fn id(&self) -> ChangeId {
        match self {
            ArchiveEntry::Change(change) => change.id,
            ArchiveEntry::Skipped(id) => *id,
        }
    }

    pub fn change(&self) -> Option<&Arc<ChangePackage>> {
        match self {
            ArchiveEntry::Change(change) => Some(change),
            ArchiveEntry::Skipped(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Archive {
    entries: VecDeque<ArchiveEntry>,
    /// Id of the newest entry, kept across compaction and restore
    last_id: ChangeId,
    threshold: usize,
}

impl Archive {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self::starting_after(0, config)
    }

    /// Empty archive whose next accepted id is `last_id + 1`
    pub fn starting_after(last_id: ChangeId, config: &ArchiveConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            last_id,
            threshold: config.threshold,
        }
    }

    fn push(&mut self, entry: ArchiveEntry) -> Result<()> {
        let expected = self.last_id + 1;
        if entry.id() != expected {
            return Err(StrandError::ArchiveOutOfOrder {
                expected,
                got: entry.id(),
            });
        }
        self.last_id = entry.id();
        self.entries.push_back(entry);
        Ok(())
    }

    /// Append a committed change; ids must follow the newest entry
    pub fn append(&mut self, change: Arc<ChangePackage>) -> Result<()> {
        self.push(ArchiveEntry::Change(change))
    }

    /// Record a hole for an id that was skipped
    pub fn skip(&mut self, id: ChangeId) -> Result<()> {
        self.push(ArchiveEntry::Skipped(id))
    }

    /// Drop every entry and continue after `last_id`
    pub fn reset(&mut self, last_id: ChangeId) {
        self.entries.clear();
        self.last_id = last_id;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn first_id(&self) -> Option<ChangeId> {
        self.entries.front().map(ArchiveEntry::id)
    }

    /// Id of the newest entry, `0` when nothing was ever archived
    pub fn last_id(&self) -> ChangeId {
        self.last_id
    }

    fn index_of(&self, id: ChangeId) -> Option<usize> {
        let first = self.first_id()?;
        if id < first || id > self.last_id {
            return None;
        }
        Some((id - first) as usize)
    }

    pub fn entry(&self, id: ChangeId) -> Option<&ArchiveEntry> {
        self.index_of(id).and_then(|i| self.entries.get(i))
    }

    pub fn get(&self, id: ChangeId) -> Option<Arc<ChangePackage>> {
        self.entry(id).and_then(|e| e.change().cloned())
    }

    /// Committed changes with an id of at least `from_id`, in order
    pub fn range(&self, from_id: ChangeId) -> impl Iterator<Item = &Arc<ChangePackage>> + '_ {
        let start = match self.first_id() {
            Some(first) if from_id > first => (from_id - first) as usize,
            _ => 0,
        };
        self.entries
            .iter()
            .skip(start)
            .filter_map(ArchiveEntry::change)
    }

    /// True when `id` was archived but has since moved to the store
    pub fn is_compacted(&self, id: ChangeId) -> bool {
        id <= self.last_id && self.first_id().is_none_or(|first| id < first)
    }

    /// When `id` is a recorded hole, the next id holding a committed change
    ///
    /// Compacted ids are not holes: `None` is returned for them as well.
    pub fn gap_ahead(&self, id: ChangeId) -> Option<ChangeId> {
        if self.is_compacted(id) || self.get(id).is_some() {
            return None;
        }
        self.range(id + 1).next().map(|c| c.id)
    }

    pub fn needs_compaction(&self) -> bool {
        self.entries.len() > self.threshold
    }

    /// Move the oldest entries beyond the threshold into `store`
    ///
    /// Returns the number of entries removed from memory.
    pub fn compact(&mut self, store: &dyn ArchiveStore) -> Result<usize> {
        if !self.needs_compaction() {
            return Ok(0);
        }
        let n = self.entries.len() - self.threshold;
        let changes: Vec<Arc<ChangePackage>> = self
            .entries
            .iter()
            .take(n)
            .filter_map(|e| e.change().cloned())
            .collect();

        if !changes.is_empty() {
            let file = store.persist(&changes)?;
            info!(
                "Compacted {} archived change(s) into `{}`",
                changes.len(),
                file.name
            );
        }
        self.entries.drain(..n);
        Ok(n)
    }
}

/// Restartable forward cursor over an [`Archive`]
///
/// The cursor holds no borrow, so the archive may change (and even be
/// compacted) between calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchiveCursor {
    next_id: ChangeId,
}

impl ArchiveCursor {
    pub fn new(from_id: ChangeId) -> Self {
        Self { next_id: from_id }
    }

    pub fn next_id(&self) -> ChangeId {
        self.next_id
    }

    pub fn advance(&mut self, archive: &Archive) -> Option<Arc<ChangePackage>> {
        let change = archive.range(self.next_id).next()?.clone();
        self.next_id = change.id + 1;
        Some(change)
    }
}

/// A compacted range of changes on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveFile {
    pub first: ChangeId,
    pub last: ChangeId,
    pub name: String,
}

impl ArchiveFile {
    pub fn new(first: ChangeId, last: ChangeId) -> Self {
        Self {
            first,
            last,
            name: format!("{:016x}-{:016x}.json", first, last),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let (first, last) = stem.split_once('-')?;
        if first.len() != 16 || last.len() != 16 {
            return None;
        }
        let first = ChangeId::from_str_radix(first, 16).ok()?;
        let last = ChangeId::from_str_radix(last, 16).ok()?;
        (first <= last).then(|| Self::new(first, last))
    }
}

/// Durable storage for compacted archive ranges
pub trait ArchiveStore: Send + Sync {
    /// Persist an ordered, non-empty batch of changes
    fn persist(&self, changes: &[Arc<ChangePackage>]) -> Result<ArchiveFile>;

    /// All persisted files ordered by their first id
    fn files(&self) -> Result<Vec<ArchiveFile>>;

    fn read_part(&self, name: &str, offset: u64, max: usize) -> Result<(Vec<u8>, bool)>;

    fn write_part(&self, name: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Changes with an id greater than `after`, in order
    fn load(&self, after: ChangeId) -> Result<Vec<ChangePackage>>;
}

/// [`ArchiveStore`] keeping one JSON file per compacted range
#[derive(Clone, Debug)]
pub struct FileArchiveStore {
    dir: PathBuf,
}

impl FileArchiveStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArchiveStore for FileArchiveStore {
    fn persist(&self, changes: &[Arc<ChangePackage>]) -> Result<ArchiveFile> {
        let (Some(first), Some(last)) = (changes.first(), changes.last()) else {
            return Err(StrandError::InternalError(
                "cannot persist an empty archive range".to_string(),
            ));
        };
        let file = ArchiveFile::new(first.id, last.id);
        let batch: Vec<&ChangePackage> = changes.iter().map(|c| c.as_ref()).collect();
        let data = serde_json::to_vec(&batch).map_err(|e| StrandError::BadData(e.to_string()))?;

        let path = self.dir.join(&file.name);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(file)
    }

    fn files(&self) -> Result<Vec<ArchiveFile>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(file) = entry.file_name().to_str().and_then(ArchiveFile::parse) {
                files.push(file);
            }
        }
        files.sort_by_key(|f| (f.first, f.last));
        Ok(files)
    }

    fn read_part(&self, name: &str, offset: u64, max: usize) -> Result<(Vec<u8>, bool)> {
        part::read_part(&part::resolve(&self.dir, name)?, offset, max)
    }

    fn write_part(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        if ArchiveFile::parse(name).is_none() {
            return Err(StrandError::BadData(format!(
                "`{}` is not an archive file name",
                name
            )));
        }
        part::write_part(&part::resolve(&self.dir, name)?, offset, data)
    }

    fn load(&self, after: ChangeId) -> Result<Vec<ChangePackage>> {
        let mut changes = Vec::new();
        for file in self.files()?.into_iter().filter(|f| f.last > after) {
            let data = std::fs::read(self.dir.join(&file.name))?;
            let batch: Vec<ChangePackage> = serde_json::from_slice(&data).map_err(|e| {
                StrandError::BadData(format!("corrupt archive file `{}`: {}", file.name, e))
            })?;
            debug!("Loaded {} change(s) from `{}`", batch.len(), file.name);
            changes.extend(batch.into_iter().filter(|c| c.id > after));
        }
        changes.sort_by_key(|c| c.id);
        changes.dedup_by_key(|c| c.id);
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strand_api::model::ChangeScope;

    fn change(id: ChangeId) -> Arc<ChangePackage> {
        Arc::new(ChangePackage::new(
            id,
            0,
            ChangeScope::Cluster,
            vec![id.to_be_bytes().to_vec()],
        ))
    }

    fn archive(threshold: usize) -> Archive {
        Archive::new(&ArchiveConfig { threshold })
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let mut archive = archive(10);
        archive.append(change(1)).unwrap();
        archive.append(change(2)).unwrap();

        let err = archive.append(change(4)).unwrap_err();
        assert!(matches!(
            err,
            StrandError::ArchiveOutOfOrder {
                expected: 3,
                got: 4
            }
        ));
        assert!(archive.append(change(2)).is_err());
        assert_eq!(archive.last_id(), 2);
    }

    #[test]
    fn test_skip_and_gap_ahead() {
        let mut archive = Archive::starting_after(29, &ArchiveConfig { threshold: 100 });
        archive.append(change(30)).unwrap();
        archive.skip(31).unwrap();
        archive.skip(32).unwrap();
        archive.append(change(33)).unwrap();

        assert_eq!(archive.first_id(), Some(30));
        assert!(archive.get(31).is_none());
        assert_eq!(archive.gap_ahead(31), Some(33));
        assert_eq!(archive.gap_ahead(30), None);
        assert_eq!(archive.gap_ahead(34), None);

        let ids: Vec<ChangeId> = archive.range(0).map(|c| c.id).collect();
        assert_eq!(ids, vec![30, 33]);
    }

    #[test]
    fn test_cursor_is_restartable() {
        let mut archive = archive(100);
        for id in 1..=3 {
            archive.append(change(id)).unwrap();
        }

        let mut cursor = ArchiveCursor::new(2);
        assert_eq!(cursor.advance(&archive).map(|c| c.id), Some(2));
        assert_eq!(cursor.advance(&archive).map(|c| c.id), Some(3));
        assert!(cursor.advance(&archive).is_none());

        archive.append(change(4)).unwrap();
        assert_eq!(cursor.advance(&archive).map(|c| c.id), Some(4));
        assert_eq!(cursor.next_id(), 5);
    }

    #[test]
    fn test_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArchiveStore::new(dir.path()).unwrap();
        let mut archive = archive(3);
        for id in 1..=5 {
            archive.append(change(id)).unwrap();
        }
        archive.skip(6).unwrap();
        archive.append(change(7)).unwrap();

        assert!(archive.needs_compaction());
        assert_eq!(archive.compact(&store).unwrap(), 4);
        assert_eq!(archive.len(), 3);
        assert_eq!(archive.first_id(), Some(5));
        assert_eq!(archive.compact(&store).unwrap(), 0);

        // compacted ids are gone from memory but are not holes
        assert!(archive.is_compacted(2));
        assert!(!archive.is_compacted(5));
        assert!(!archive.is_compacted(8));
        assert_eq!(archive.gap_ahead(2), None);
        assert_eq!(archive.gap_ahead(6), Some(7));

        let files = store.files().unwrap();
        assert_eq!(files, vec![ArchiveFile::new(1, 4)]);

        let loaded = store.load(2).unwrap();
        let ids: Vec<ChangeId> = loaded.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(store.load(4).unwrap().is_empty());

        archive.append(change(8)).unwrap();
        assert_eq!(archive.last_id(), 8);
    }

    #[test]
    fn test_archive_file_names() {
        let file = ArchiveFile::new(1, 255);
        assert_eq!(file.name, "0000000000000001-00000000000000ff.json");
        assert_eq!(ArchiveFile::parse(&file.name), Some(file));
        assert!(ArchiveFile::parse("00000000000000ff-0000000000000001.json").is_none());
        assert!(ArchiveFile::parse("node.json").is_none());
    }

    #[test]
    fn test_store_part_transfer() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let source = FileArchiveStore::new(source_dir.path()).unwrap();
        let target = FileArchiveStore::new(target_dir.path()).unwrap();

        let file = source.persist(&[change(1), change(2), change(3)]).unwrap();
        let mut offset = 0;
        loop {
            let (data, more) = source.read_part(&file.name, offset, 16).unwrap();
            target.write_part(&file.name, offset, &data).unwrap();
            offset += data.len() as u64;
            if !more {
                break;
            }
        }

        assert_eq!(target.load(0).unwrap().len(), 3);
        assert!(target.write_part("state.json", 0, b"{}").is_err());
    }

    proptest! {
        #[test]
        fn archive_stays_contiguous(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut archive = archive(1000);
            for (i, commit) in ops.iter().enumerate() {
                let id = i as ChangeId + 1;
                if *commit {
                    archive.append(change(id)).unwrap();
                } else {
                    archive.skip(id).unwrap();
                }
            }
            prop_assert_eq!(archive.len(), ops.len());
            prop_assert_eq!(archive.last_id(), ops.len() as ChangeId);
            for id in 1..=ops.len() as ChangeId {
                prop_assert_eq!(archive.entry(id).map(ArchiveEntry::id), Some(id));
            }
            let committed: Vec<ChangeId> = archive.range(1).map(|c| c.id).collect();
            prop_assert!(committed.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
