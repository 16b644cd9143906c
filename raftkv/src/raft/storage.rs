use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Storage, StorageError};

use crate::error::Result;

const LOG_PARTITION: &str = "raft_log";
const STATE_PARTITION: &str = "raft_state";
const HARD_STATE_KEY: &[u8] = b"hard_state";
const CONF_STATE_KEY: &[u8] = b"conf_state";
const SNAPSHOT_KEY: &[u8] = b"snapshot";

fn index_key(index: u64) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}

/// Durable raft log.
///
/// Entries, hard state, conf state and the latest snapshot live in a fjall keyspace; a
/// `MemStorage` mirrors them so raft reads never touch the disk.
pub struct LogStore {
    mem_storage: MemStorage,
    keyspace: Keyspace,
    log: PartitionHandle,
    state: PartitionHandle,
    conf_state: ConfState,
    snapshot: Snapshot,
    bootstrapped: bool,
}

impl LogStore {
    /// Opens the log at `path`. With `bootstrap_id` set and nothing on disk yet, the log is
    /// initialised as a single-voter cluster made of that node.
    pub fn open<P: AsRef<Path>>(path: P, bootstrap_id: Option<u64>) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let log = keyspace.open_partition(LOG_PARTITION, PartitionCreateOptions::default())?;
        let state = keyspace.open_partition(STATE_PARTITION, PartitionCreateOptions::default())?;

        let mem_storage = MemStorage::new();
        let mut snapshot = Snapshot::default();
        let mut bootstrapped = false;

        if let Some(data) = state.get(SNAPSHOT_KEY)? {
            snapshot.merge_from_bytes(&data)?;
            mem_storage.wl().apply_snapshot(snapshot.clone())?;
        } else if let Some(id) = bootstrap_id {
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = vec![id];
            state.insert(SNAPSHOT_KEY, snapshot.write_to_bytes()?)?;
            keyspace.persist(PersistMode::SyncAll)?;
            mem_storage.wl().apply_snapshot(snapshot.clone())?;
            bootstrapped = true;
        }

        let mut conf_state = snapshot.get_metadata().get_conf_state().clone();
        if let Some(data) = state.get(CONF_STATE_KEY)? {
            conf_state = ConfState::parse_from_bytes(&data)?;
            mem_storage.wl().set_conf_state(conf_state.clone());
        }
        if let Some(data) = state.get(HARD_STATE_KEY)? {
            mem_storage
                .wl()
                .set_hardstate(HardState::parse_from_bytes(&data)?);
        }

        let snapshot_index = snapshot.get_metadata().index;
        let mut entries = Vec::new();
        for item in log.iter() {
            let (_, data) = item?;
            let entry = Entry::parse_from_bytes(&data)?;
            if entry.index > snapshot_index {
                entries.push(entry);
            }
        }
        if !entries.is_empty() {
            log::info!(
                "loaded {} raft log entries after snapshot index {}",
                entries.len(),
                snapshot_index
            );
            mem_storage.wl().append(&entries)?;
        }

        Ok(LogStore {
            mem_storage,
            keyspace,
            log,
            state,
            conf_state,
            snapshot,
            bootstrapped,
        })
    }

    /// True when this call to `open` created the bootstrap configuration.
    pub fn freshly_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.get_metadata().index
    }

    pub fn conf_state(&self) -> &ConfState {
        &self.conf_state
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        let last = match entries.last() {
            Some(entry) => entry.index,
            None => return Ok(()),
        };
        let previous_last = self.mem_storage.last_index()?;

        // First append to mem_storage, it validates continuity
        self.mem_storage.wl().append(entries)?;

        let mut batch = self.keyspace.batch();
        for entry in entries {
            batch.insert(&self.log, index_key(entry.index), entry.write_to_bytes()?);
        }
        // Drop the conflicting tail that the new entries replaced
        for index in last + 1..=previous_last {
            batch.remove(&self.log, index_key(index));
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        self.state
            .insert(CONF_STATE_KEY, conf_state.write_to_bytes()?)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        self.mem_storage.wl().set_conf_state(conf_state.clone());
        self.conf_state = conf_state;
        Ok(())
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> Result<()> {
        self.state.insert(HARD_STATE_KEY, hs.write_to_bytes()?)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        self.mem_storage.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        let mut hs = self.mem_storage.initial_state()?.hard_state;
        hs.set_commit(commit);
        self.set_hardstate(hs)
    }

    /// Installs a snapshot received from the leader. Every local entry is discarded.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;

        let raft_state = self.mem_storage.initial_state()?;
        let mut batch = self.keyspace.batch();
        batch.insert(&self.state, SNAPSHOT_KEY, snapshot.write_to_bytes()?);
        batch.insert(
            &self.state,
            CONF_STATE_KEY,
            raft_state.conf_state.write_to_bytes()?,
        );
        batch.insert(
            &self.state,
            HARD_STATE_KEY,
            raft_state.hard_state.write_to_bytes()?,
        );
        for item in self.log.iter() {
            let (key, _) = item?;
            batch.remove(&self.log, key);
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        self.conf_state = raft_state.conf_state;
        self.snapshot = snapshot.clone();
        Ok(())
    }

    /// Records `data` as the snapshot at `applied` and compacts the log up to it.
    pub fn save_snapshot(&mut self, data: Vec<u8>, applied: u64) -> Result<()> {
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = applied;
        snapshot.mut_metadata().term = self.mem_storage.term(applied)?;
        snapshot
            .mut_metadata()
            .set_conf_state(self.conf_state.clone());
        snapshot.set_data(data.into());

        let mut batch = self.keyspace.batch();
        batch.insert(&self.state, SNAPSHOT_KEY, snapshot.write_to_bytes()?);
        for item in self.log.range(..index_key(applied)) {
            let (key, _) = item?;
            batch.remove(&self.log, key);
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        self.mem_storage.wl().compact(applied)?;
        self.snapshot = snapshot;
        Ok(())
    }
}

impl Storage for LogStore {
    /// Implements the Storage trait.
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem_storage.initial_state()
    }

    /// Implements the Storage trait.
    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    /// Implements the Storage trait.
    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem_storage.term(idx)
    }

    /// Implements the Storage trait.
    fn first_index(&self) -> raft::Result<u64> {
        self.mem_storage.first_index()
    }

    /// Implements the Storage trait.
    fn last_index(&self) -> raft::Result<u64> {
        self.mem_storage.last_index()
    }

    /// Serves the latest snapshot, payload included.
    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        if self.snapshot.get_metadata().index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(self.snapshot.clone())
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
        e.data = data.to_vec().into();
        e
    }

    #[test]
    fn test_bootstrap_creates_single_voter() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), Some(7)).unwrap();

        assert!(store.freshly_bootstrapped());
        assert_eq!(store.snapshot_index(), 1);
        assert_eq!(store.conf_state().voters, vec![7]);
        assert_eq!(store.first_index().unwrap(), 2);
        assert_eq!(store.last_index().unwrap(), 1);
        assert_eq!(store.initial_state().unwrap().conf_state.voters, vec![7]);
    }

    #[test]
    fn test_follower_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), None).unwrap();

        assert!(!store.freshly_bootstrapped());
        assert_eq!(store.snapshot_index(), 0);
        assert!(store.conf_state().voters.is_empty());
        assert_eq!(store.last_index().unwrap(), 0);
    }

    #[test]
    fn test_append_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = LogStore::open(dir.path(), Some(1)).unwrap();
            store
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.commit = 3;
            store.set_hardstate(hs).unwrap();
        }

        let store = LogStore::open(dir.path(), Some(1)).unwrap();
        assert!(!store.freshly_bootstrapped());
        assert_eq!(store.last_index().unwrap(), 4);
        assert_eq!(store.initial_state().unwrap().hard_state.commit, 3);
        let entries = store
            .entries(2, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        let data: Vec<Vec<u8>> = entries.iter().map(|e| e.data.to_vec()).collect();
        assert_eq!(data, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_append_replaces_conflicting_tail() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = LogStore::open(dir.path(), Some(1)).unwrap();
            store
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            store.append_entries(&[entry(3, 2, b"x")]).unwrap();
            assert_eq!(store.last_index().unwrap(), 3);
            assert_eq!(store.term(3).unwrap(), 2);
        }

        let store = LogStore::open(dir.path(), Some(1)).unwrap();
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.term(3).unwrap(), 2);
    }

    #[test]
    fn test_save_snapshot_compacts_log() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::open(dir.path(), Some(1)).unwrap();
        store
            .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
            .unwrap();
        let mut hs = HardState::default();
        hs.term = 1;
        hs.commit = 4;
        store.set_hardstate(hs).unwrap();

        store.save_snapshot(b"[]".to_vec(), 3).unwrap();
        assert_eq!(store.snapshot_index(), 3);
        assert_eq!(store.first_index().unwrap(), 3);
        assert_eq!(store.term(3).unwrap(), 1);

        let snapshot = Storage::snapshot(&store, 0, 2).unwrap();
        assert_eq!(snapshot.get_metadata().index, 3);
        assert_eq!(snapshot.get_data(), b"[]");
        assert_eq!(snapshot.get_metadata().get_conf_state().voters, vec![1]);
    }

    #[test]
    fn test_apply_snapshot_discards_log() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::open(dir.path(), None).unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 10;
        snapshot.mut_metadata().term = 3;
        snapshot.mut_metadata().mut_conf_state().voters = vec![1, 2];
        store.apply_snapshot(&snapshot).unwrap();

        assert_eq!(store.snapshot_index(), 10);
        assert_eq!(store.first_index().unwrap(), 11);
        assert_eq!(store.conf_state().voters, vec![1, 2]);
        drop(store);

        let store = LogStore::open(dir.path(), None).unwrap();
        assert_eq!(store.snapshot_index(), 10);
        assert_eq!(store.last_index().unwrap(), 10);
        assert_eq!(store.conf_state().voters, vec![1, 2]);
    }
}
