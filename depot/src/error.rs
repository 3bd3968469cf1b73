//! Errors surfaced to clients of the gateway and membership controller.

use std::time::Duration;

use thiserror::Error;

use crate::consensus::ConsensusError;

#[derive(Debug, Error)]
pub enum Error {
    /// The write reached a node that is not leader and could not be forwarded.
    #[error("not the leader")]
    NotLeader,

    /// The engine did not confirm the commit in time. The write's fate is
    /// unknown: it may still be applied.
    #[error("write not confirmed within {0:?}; it may or may not have been applied")]
    CommitTimeout(Duration),

    /// The state machine rejected the committed entry (for example an
    /// unknown command method).
    #[error("apply failed: {0}")]
    Apply(String),

    #[error("proposal dropped: {0}")]
    Dropped(String),

    /// The local state machine stopped after a fatal error.
    #[error("state machine halted: {0}")]
    Halted(String),

    #[error("configuration change rejected: {0}")]
    ConfigChange(String),

    /// The leader could not be reached.
    #[error("forwarding to leader failed: {0}")]
    Forward(String),

    /// The leader answered a forwarded request with a failure; status and body
    /// are passed back to the caller unchanged.
    #[error("leader answered {status}: {body}")]
    Relayed { status: u16, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("consensus engine stopped")]
    Stopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<ConsensusError> for Error {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader => Error::NotLeader,
            ConsensusError::Timeout(after) => Error::CommitTimeout(after),
            ConsensusError::Dropped(reason) => Error::Dropped(reason),
            ConsensusError::Rejected(reason) => Error::Apply(reason),
            ConsensusError::Halted(reason) => Error::Halted(reason),
            ConsensusError::ConfigChange(reason) => Error::ConfigChange(reason),
            ConsensusError::Stopped => Error::Stopped,
        }
    }
}
