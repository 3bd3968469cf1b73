//! Consensus engine built on raft-rs.
//!
//! [`node`] adapts `RawNode` to the [`crate::consensus::StateMachine`]
//! callbacks, [`storage`] serves state-machine snapshots to lagging
//! followers and writes through to the durable [`log_store`], and
//! [`runtime`] runs a node on its own thread behind a
//! [`RaftHandle`] that implements [`crate::consensus::ConsensusEngine`].

pub mod log_store;
pub mod node;
pub mod runtime;
pub mod storage;

pub use node::{NodeOptions, RaftNode, DEFAULT_SNAPSHOT_THRESHOLD, DEFAULT_TRAILING_LOGS};
pub use runtime::{spawn_node, RaftHandle};
pub use storage::DataDir;
