//! Raft log storage with state-machine snapshots.
//!
//! `MemStorage` keeps the log, hard state and conf state, but its own
//! `snapshot()` only ever describes the log metadata. Leaders need to ship
//! followers the actual state machine contents once the log has been
//! compacted, so [`ReplicaStorage`] keeps the latest snapshot taken from the
//! FSM alongside the log and hands that out instead.
//!
//! A durable storage also writes every change through to a [`LogStore`]
//! before applying it in memory, so whatever raft is told was persisted
//! survives a restart.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use raft::{Error as RaftError, Result as RaftResult, StorageError};

use super::log_store::{LogStore, PersistedLog};
use crate::persist::SnapshotStore;

/// Everything a replica keeps under its data directory.
pub struct DataDir {
    pub snapshots: SnapshotStore,
    pub log: LogStore,
    /// What the log held when it was opened.
    pub persisted: PersistedLog,
}

impl DataDir {
    pub fn open(path: &Path, retain: usize) -> Result<Self> {
        let snapshots = SnapshotStore::open(path, retain)
            .with_context(|| format!("failed to open snapshot store in {}", path.display()))?;
        let (log, persisted) = LogStore::open(path)
            .with_context(|| format!("failed to open raft log in {}", path.display()))?;
        Ok(Self {
            snapshots,
            log,
            persisted,
        })
    }
}

#[derive(Clone)]
pub struct ReplicaStorage {
    mem: MemStorage,
    latest: Arc<RwLock<Snapshot>>,
    log: Option<Arc<Mutex<LogStore>>>,
}

impl ReplicaStorage {
    pub fn new(mem: MemStorage) -> Self {
        Self {
            mem,
            latest: Arc::new(RwLock::new(Snapshot::default())),
            log: None,
        }
    }

    /// A storage that persists every change to `log` first.
    pub fn durable(mem: MemStorage, log: LogStore) -> Self {
        Self {
            log: Some(Arc::new(Mutex::new(log))),
            ..Self::new(mem)
        }
    }

    /// The underlying in-memory log.
    pub fn mem(&self) -> &MemStorage {
        &self.mem
    }

    /// Replaces the snapshot handed to lagging followers.
    pub fn set_snapshot(&self, snapshot: Snapshot) {
        *self.latest.write() = snapshot;
    }

    pub fn snapshot_index(&self) -> u64 {
        self.latest.read().get_metadata().index
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(log) = &self.log {
            log.lock().append(entries).context("failed to persist entries")?;
        }
        self.mem.wl().append(entries).context("append entries failed")
    }

    pub fn set_hard_state(&self, hs: &HardState) -> Result<()> {
        if let Some(log) = &self.log {
            log.lock()
                .save_hard_state(hs)
                .context("failed to persist hard state")?;
        }
        self.mem.wl().set_hardstate(hs.clone());
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hs = self.mem.initial_state()?.hard_state;
        hs.commit = commit;
        self.set_hard_state(&hs)
    }

    pub fn set_conf_state(&self, cs: &ConfState) -> Result<()> {
        if let Some(log) = &self.log {
            log.lock()
                .save_conf_state(cs)
                .context("failed to persist conf state")?;
        }
        self.mem.wl().set_conf_state(cs.clone());
        Ok(())
    }

    /// Loads a snapshot received from the leader. The persisted log is
    /// rewritten to start after it.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .context("apply snapshot failed")?;
        self.set_snapshot(snapshot);
        self.rewrite_log()
    }

    /// Drops log entries before `to`, on disk as well.
    pub fn compact(&self, to: u64) -> Result<()> {
        self.mem.wl().compact(to).context("log compaction failed")?;
        self.rewrite_log()
    }

    fn rewrite_log(&self) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let state = self.mem.initial_state()?;
        let (first, last) = (self.mem.first_index()?, self.mem.last_index()?);
        let entries = if last >= first {
            self.mem
                .entries(first, last + 1, None, GetEntriesContext::empty(false))?
        } else {
            Vec::new()
        };
        log.lock()
            .rewrite(&state.hard_state, &state.conf_state, &entries)
            .context("failed to rewrite raft log")
    }
}

impl Storage for ReplicaStorage {
    fn initial_state(&self) -> RaftResult<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> RaftResult<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> RaftResult<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> RaftResult<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> RaftResult<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> RaftResult<Snapshot> {
        let latest = self.latest.read();
        if latest.get_metadata().index < request_index || latest.get_metadata().index == 0 {
            return Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        Ok(latest.clone())
    }
}
