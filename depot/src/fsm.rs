//! The deterministic finite state machine driven by the consensus engine.
//!
//! The FSM performs no ordering of its own. The engine calls [`Fsm::apply`]
//! once per committed entry in commit order, and calls [`Fsm::snapshot`] /
//! [`Fsm::restore`] when it compacts its log or installs a leader's snapshot.
//!
//! # Failure policy
//!
//! - A payload that does not decode at all means corruption or a codec
//!   mismatch. The FSM moves to [`FsmState::Failed`] and refuses all further
//!   work rather than risk diverging from its peers.
//! - A well-formed command with an unknown method means version skew. It is
//!   logged, reported to the proposer, and skipped; the node keeps applying.
//! - A snapshot that fails to decode is fatal as well, and leaves the
//!   container exactly as it was.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::command::{Command, DecodeError};
use crate::consensus::{CommittedEntry, StateMachine};
use crate::snapshot::{self, SnapshotError};
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FsmState {
    Ready,
    Applying,
    Restoring,
    /// Terminal. Entered only on a fatal decode or restore error.
    Failed,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("unknown command method {0:?}")]
    UnknownCommand(String),
    #[error("undecodable entry at index {index}: {source}")]
    Decode {
        index: u64,
        #[source]
        source: DecodeError,
    },
    #[error("snapshot restore failed: {0}")]
    Restore(#[source] SnapshotError),
    #[error("state machine halted after an earlier fatal error")]
    Halted,
}

impl ApplyError {
    /// Whether the node must stop applying after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ApplyError::UnknownCommand(_))
    }
}

/// Frozen copy of the container taken by [`Fsm::snapshot`].
///
/// Consumed by [`SnapshotHandle::persist`], so a handle is written at most once.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    index: u64,
    term: u64,
    contents: BTreeMap<String, String>,
}

impl SnapshotHandle {
    /// Last applied index covered by this snapshot.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Writes the snapshot in wire format.
    pub fn persist<W: Write + ?Sized>(self, sink: &mut W) -> Result<(), SnapshotError> {
        snapshot::write_to(sink, &self.contents)
    }

    /// Persists into a fresh buffer.
    pub fn into_bytes(self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::encode(&self.contents)
    }
}

/// The key-value state machine.
pub struct Fsm {
    store: Arc<KvStore>,
    state: FsmState,
    applied_index: u64,
    applied_term: u64,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        Self::with_store(Arc::new(KvStore::new()))
    }

    /// Builds an FSM around an existing container, typically one the HTTP
    /// read path already holds a handle to.
    pub fn with_store(store: Arc<KvStore>) -> Self {
        Self {
            store,
            state: FsmState::Ready,
            applied_index: 0,
            applied_term: 0,
        }
    }

    pub fn store(&self) -> Arc<KvStore> {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term
    }

    /// Applies one committed entry.
    pub fn apply(&mut self, entry: CommittedEntry<'_>) -> Result<(), ApplyError> {
        if self.state == FsmState::Failed {
            return Err(ApplyError::Halted);
        }
        self.state = FsmState::Applying;

        let command = match Command::decode(entry.data) {
            Ok(command) => command,
            Err(DecodeError::UnknownMethod(method)) => {
                warn!(index = entry.index, %method, "skipping entry with unknown command");
                self.mark_applied(entry.index, entry.term);
                self.state = FsmState::Ready;
                return Err(ApplyError::UnknownCommand(method));
            }
            Err(source) => {
                error!(
                    index = entry.index,
                    error = %source,
                    "undecodable log entry, halting state machine"
                );
                self.state = FsmState::Failed;
                return Err(ApplyError::Decode {
                    index: entry.index,
                    source,
                });
            }
        };

        match command {
            Command::Set { key, value } => {
                debug!(index = entry.index, %key, "applying SET");
                self.store.set_locked(key, value);
            }
            Command::Delete { key } => {
                debug!(index = entry.index, %key, "applying DEL");
                self.store.delete_locked(&key);
            }
        }

        self.mark_applied(entry.index, entry.term);
        self.state = FsmState::Ready;
        Ok(())
    }

    /// Moves the applied position past an entry that carried no command.
    pub fn advance(&mut self, index: u64, term: u64) {
        if self.state != FsmState::Failed {
            self.mark_applied(index, term);
        }
    }

    /// Captures the whole container at the current applied position.
    pub fn snapshot(&self) -> SnapshotHandle {
        SnapshotHandle {
            index: self.applied_index,
            term: self.applied_term,
            contents: self.store.snapshot(),
        }
    }

    /// Replaces the container with the snapshot read from `reader`.
    ///
    /// The snapshot is decoded completely before the container is touched.
    pub fn restore<R: Read + ?Sized>(
        &mut self,
        index: u64,
        term: u64,
        reader: &mut R,
    ) -> Result<(), ApplyError> {
        if self.state == FsmState::Failed {
            return Err(ApplyError::Halted);
        }
        self.state = FsmState::Restoring;

        match snapshot::read_from(reader) {
            Ok(contents) => {
                let keys = contents.len();
                self.store.replace(contents);
                self.applied_index = index;
                self.applied_term = term;
                self.state = FsmState::Ready;
                info!(index, term, keys, "restored state machine from snapshot");
                Ok(())
            }
            Err(err) => {
                error!(index, term, error = %err, "snapshot restore failed, halting state machine");
                self.state = FsmState::Failed;
                Err(ApplyError::Restore(err))
            }
        }
    }

    fn mark_applied(&mut self, index: u64, term: u64) {
        self.applied_index = index;
        self.applied_term = term;
    }
}

impl StateMachine for Fsm {
    fn apply(&mut self, entry: CommittedEntry<'_>) -> Result<(), ApplyError> {
        Fsm::apply(self, entry)
    }

    fn advance(&mut self, index: u64, term: u64) {
        Fsm::advance(self, index, term)
    }

    fn snapshot(&self) -> SnapshotHandle {
        Fsm::snapshot(self)
    }

    fn restore(&mut self, index: u64, term: u64, reader: &mut dyn Read) -> Result<(), ApplyError> {
        Fsm::restore(self, index, term, reader)
    }

    fn state(&self) -> FsmState {
        self.state
    }

    fn applied_index(&self) -> u64 {
        self.applied_index
    }
}
