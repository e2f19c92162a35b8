//! File-backed raft storage: a MemStorage front with append-only segment
//! files for the log and an atomically replaced snapshot file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};

use crate::consensus::segment::Segment;

const SEGMENT_CAPACITY: u64 = 10000;
const SNAPSHOT_FILE: &str = "snapshot";

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

/// Persistent storage for one raft node.
pub struct FileStorage {
    core: MemStorage,
    segments: BTreeMap<u64, Segment>,
    dir: PathBuf,
    // Last persisted snapshot: raft index + application blob.
    snapshot_index: u64,
    snapshot_data: Vec<u8>,
}

impl FileStorage {
    /// Opens the storage directory, restoring any persisted snapshot and
    /// log segments. With `bootstrap` set and no prior state, the node is
    /// seeded as the sole voter of a new cluster.
    pub fn open<P: AsRef<Path>>(dir: P, bootstrap: bool, id: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let core = MemStorage::new();
        let mut snapshot_index = 0;
        let mut snapshot_data = Vec::new();

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let raw = fs::read(&snapshot_path)?;
            let mut snapshot = Snapshot::default();
            snapshot.merge_from_bytes(&raw).map_err(store_err)?;
            snapshot_index = snapshot.get_metadata().index;
            snapshot_data = snapshot.get_data().to_vec();
            core.wl().apply_snapshot(snapshot)?;
        } else if bootstrap {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = vec![id];
            snapshot_index = 1;
            core.wl().apply_snapshot(snapshot)?;
        }

        let mut storage = FileStorage {
            core,
            segments: BTreeMap::new(),
            dir,
            snapshot_index,
            snapshot_data,
        };
        storage.load_segments()?;
        Ok(storage)
    }

    fn load_segments(&mut self) -> Result<()> {
        let mut starts: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(start) = Self::parse_segment_start(&path) {
                starts.push(start);
            }
        }
        starts.sort_unstable();

        let base = self.core.last_index()?;
        let mut pending: Vec<Entry> = Vec::new();
        for start in starts {
            let mut segment =
                Segment::open(self.segment_path(start), start).map_err(store_err)?;
            let mut index = segment.start_index();
            while index <= segment.end_index() {
                let raw = segment.read_entry(index).map_err(store_err)?;
                let mut entry = Entry::default();
                entry.merge_from_bytes(&raw).map_err(store_err)?;
                if entry.index > base {
                    pending.push(entry);
                }
                index += 1;
            }
            self.segments.insert(start, segment);
        }
        if !pending.is_empty() {
            self.core.wl().append(&pending)?;
        }
        Ok(())
    }

    fn parse_segment_start(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        name.strip_prefix("segment_")?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }

    fn segment_path(&self, start: u64) -> PathBuf {
        self.dir.join(format!("segment_{}.log", start))
    }

    /// Last persisted entry index, or 0 with no segments.
    fn persisted_end(&self) -> u64 {
        self.segments
            .values()
            .next_back()
            .filter(|s| !s.is_empty())
            .map(|s| s.end_index())
            .unwrap_or(0)
    }

    // Drops persisted entries at and after `index` (log conflict after a
    // leader change rewrote the tail).
    fn truncate_from(&mut self, index: u64) -> Result<()> {
        let obsolete: Vec<u64> = self
            .segments
            .range(index..)
            .map(|(start, _)| *start)
            .collect();
        for start in obsolete {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove().map_err(store_err)?;
            }
        }
        // Any remaining segment starts before the cut; trim its tail.
        if let Some((_, segment)) = self.segments.iter_mut().next_back() {
            if !segment.is_empty() && segment.end_index() >= index {
                segment.truncate(index - 1).map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Appends entries to memory and to the segment files, truncating any
    /// conflicting persisted tail first.
    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.core.wl().append(entries)?;

        let first = entries[0].index;
        if self.persisted_end() >= first {
            self.truncate_from(first)?;
        }
        for entry in entries {
            let raw = entry.write_to_bytes().map_err(store_err)?;
            let start = match self.segments.iter().next_back() {
                Some((&start, segment))
                    if !segment.is_empty()
                        && segment.end_index() + 1 == entry.index
                        && entry.index - start < SEGMENT_CAPACITY =>
                {
                    start
                }
                _ => entry.index,
            };
            if !self.segments.contains_key(&start) {
                let segment =
                    Segment::open(self.segment_path(start), start).map_err(store_err)?;
                self.segments.insert(start, segment);
            }
            self.segments
                .get_mut(&start)
                .unwrap()
                .append(&[raw])
                .map_err(store_err)?;
        }
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.core.wl().set_conf_state(conf_state);
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.core.wl().set_hardstate(hs);
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.core.wl().mut_hard_state().set_commit(commit);
    }

    /// The application blob and index of the last persisted snapshot.
    /// The blob is empty when no application snapshot has been taken yet.
    pub fn read_snapshot(&self) -> (u64, Vec<u8>) {
        (self.snapshot_index, self.snapshot_data.clone())
    }

    fn persist_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let raw = snapshot.write_to_bytes().map_err(store_err)?;
        let path = self.dir.join(SNAPSHOT_FILE);
        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, &path)?;
        self.snapshot_index = snapshot.get_metadata().index;
        self.snapshot_data = snapshot.get_data().to_vec();
        Ok(())
    }

    fn drop_covered_segments(&mut self, index: u64) -> Result<()> {
        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.is_empty() || s.end_index() <= index)
            .map(|(start, _)| *start)
            .collect();
        for start in covered {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove().map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Installs a snapshot received from the leader: persists it, resets
    /// the in-memory log, and discards all persisted entries (anything
    /// live will be re-replicated past the snapshot point).
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.core.wl().apply_snapshot(snapshot.clone())?;
        self.persist_snapshot(snapshot)?;
        let all: Vec<u64> = self.segments.keys().copied().collect();
        for start in all {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove().map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Saves a locally produced snapshot at `applied` with the given
    /// application blob, then compacts the log.
    pub fn save_snapshot(&mut self, data: Vec<u8>, applied: u64) -> Result<()> {
        let mut snapshot = self.core.snapshot(applied, 0)?;
        snapshot.set_data(data.into());
        let index = snapshot.get_metadata().index;
        self.persist_snapshot(&snapshot)?;
        self.core.wl().compact(index)?;
        self.drop_covered_segments(index)
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.core.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.core.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.core.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.core.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.core.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        self.core.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(data.to_vec().into());
        e
    }

    #[test]
    fn bootstrap_seeds_single_voter() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path(), true, 7).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![7]);
        assert_eq!(storage.first_index().unwrap(), 2);
        let (index, data) = storage.read_snapshot();
        assert_eq!(index, 1);
        assert!(data.is_empty());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::open(dir.path(), true, 1).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b")])
                .unwrap();
        }
        let storage = FileStorage::open(dir.path(), true, 1).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
        let got = storage
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].get_data(), b"b");
    }

    #[test]
    fn conflicting_tail_is_rewritten() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::open(dir.path(), true, 1).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            // A higher-term leader overwrites index 3 onwards.
            storage
                .append_entries(&[entry(3, 2, b"x"), entry(4, 2, b"y")])
                .unwrap();
        }
        let storage = FileStorage::open(dir.path(), true, 1).unwrap();
        let got = storage
            .entries(3, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got[0].term, 2);
        assert_eq!(got[0].get_data(), b"x");
        assert_eq!(got[1].get_data(), b"y");
    }

    #[test]
    fn snapshot_compacts_and_restores() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::open(dir.path(), true, 1).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b")])
                .unwrap();
            storage.set_commit(3);
            storage.save_snapshot(b"blob".to_vec(), 3).unwrap();
            assert_eq!(storage.first_index().unwrap(), 4);
        }
        let storage = FileStorage::open(dir.path(), false, 1).unwrap();
        let (index, data) = storage.read_snapshot();
        assert_eq!(index, 3);
        assert_eq!(data, b"blob");
    }
}
