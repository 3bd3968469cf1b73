//! A replicated key-value store.
//!
//! Every node runs the same deterministic state machine ([`fsm`]) over the
//! commands its consensus engine commits, so all nodes converge on the same
//! contents. Clients talk HTTP to any node ([`http`]); writes that land on a
//! follower are relayed to the leader by the [`gateway`].

pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod gateway;
pub mod http;
pub mod membership;
pub mod persist;
pub mod replication;
pub mod snapshot;
pub mod store;

pub use error::{Error, Result};
