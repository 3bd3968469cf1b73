//! In-memory key-value storage for the replicated state machine.
//!
//! This module provides the state container that the FSM mutates. Commands
//! from the committed log are applied here; HTTP reads are served from here.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Thread-safe key-value container owned by each node's FSM.
///
/// Reads take the lock in shared mode, so concurrent `GET` requests never
/// block one another. Mutations take it exclusively and are only issued by
/// the FSM while it applies committed entries or restores a snapshot.
///
/// # Why BTreeMap instead of HashMap?
///
/// Nodes that applied the same committed index must hold bit-identical
/// contents. A `BTreeMap` iterates in key order, so two equal containers
/// always serialize to the same snapshot bytes.
#[derive(Debug, Default)]
pub struct KvStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl KvStore {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the current value for a key.
    ///
    /// This is a local read with no consensus round: it reflects whatever this
    /// node has applied, which may lag the leader.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns a frozen copy of every key-value pair.
    ///
    /// The copy is taken while the shared lock is held, so it matches some
    /// serial point in the applied-command sequence: an apply cannot
    /// interleave with the clone.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub(crate) fn set_locked(&self, key: String, value: String) {
        self.data.write().insert(key, value);
    }

    /// Removes a key. Removing an absent key is not an error.
    pub(crate) fn delete_locked(&self, key: &str) {
        self.data.write().remove(key);
    }

    /// Swaps the whole mapping for `contents`.
    ///
    /// Restore never merges: whatever the container held before is dropped.
    pub(crate) fn replace(&self, contents: BTreeMap<String, String>) {
        *self.data.write() = contents;
    }
}
