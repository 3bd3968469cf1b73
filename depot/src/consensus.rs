//! The boundary between the replicated state machine and the consensus engine.
//!
//! The core never implements election or log replication itself. It talks to
//! an engine through [`ConsensusEngine`], and the engine calls back into the
//! state machine through [`StateMachine`] once per committed entry, in commit
//! order. [`crate::replication`] provides the engine used by the node binary; tests
//! substitute their own.

use std::fmt;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsm::{ApplyError, FsmState, SnapshotHandle};

/// Numeric node identifier used by the consensus engine.
pub type NodeId = u64;

/// Derives a node's numeric id from its replication address.
///
/// The id must be computable by any node, including one that has not joined
/// yet, from nothing but the address. IPv4 addresses pack exactly as
/// `ip << 16 | port`; IPv6 addresses fold the 128-bit address into the upper
/// 48 bits.
pub fn node_id_for(addr: &SocketAddr) -> NodeId {
    let host = match addr.ip() {
        IpAddr::V4(ip) => u64::from(u32::from(ip)),
        IpAddr::V6(ip) => {
            let bits = u128::from(ip);
            let folded = (bits as u64) ^ ((bits >> 64) as u64);
            (folded ^ (folded >> 48)) & 0xFFFF_FFFF_FFFF
        }
    };
    (host << 16) | u64::from(addr.port())
}

/// One row of the cluster address table.
///
/// `raft_addr` is the node's identity and replication endpoint; `api_addr`
/// is where its HTTP service listens. Forwarded requests go to `api_addr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub raft_addr: SocketAddr,
    pub api_addr: Option<SocketAddr>,
}

impl Member {
    pub fn new(raft_addr: SocketAddr, api_addr: Option<SocketAddr>) -> Self {
        Self {
            id: node_id_for(&raft_addr),
            raft_addr,
            api_addr,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid member {spec:?}: expected RAFT_ADDR or RAFT_ADDR=API_ADDR")]
pub struct MemberParseError {
    spec: String,
}

impl FromStr for Member {
    type Err = MemberParseError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || MemberParseError {
            spec: spec.to_string(),
        };
        let trimmed = spec.trim();
        let (raft, api) = match trimmed.split_once('=') {
            Some((raft, api)) => (raft.trim(), Some(api.trim())),
            None => (trimmed, None),
        };
        let raft_addr: SocketAddr = raft.parse().map_err(|_| invalid())?;
        let api_addr: Option<SocketAddr> = api
            .map(|api| api.parse().map_err(|_| invalid()))
            .transpose()?;
        Ok(Member::new(raft_addr, api_addr))
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.api_addr {
            Some(api) => write!(f, "{}={}", self.raft_addr, api),
            None => write!(f, "{}", self.raft_addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

/// A committed log entry handed to the state machine.
#[derive(Debug, Clone, Copy)]
pub struct CommittedEntry<'a> {
    pub index: u64,
    pub term: u64,
    pub data: &'a [u8],
}

/// Position of a proposal once the engine reports it committed and applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub index: u64,
    pub term: u64,
}

/// Point-in-time view of a node, published by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub applied_index: u64,
    pub fsm_state: FsmState,
    /// Ids of the current voting members.
    pub voters: Vec<NodeId>,
    /// Address table. May list peers that are not (or not yet) voters.
    pub members: Vec<Member>,
}

impl EngineStatus {
    pub fn leader(&self) -> Option<&Member> {
        let leader_id = self.leader_id?;
        self.members.iter().find(|member| member.id == leader_id)
    }
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("not the leader")]
    NotLeader,
    #[error("no commit within {0:?}; the entry may or may not be applied")]
    Timeout(Duration),
    #[error("proposal dropped before commit: {0}")]
    Dropped(String),
    #[error("state machine rejected entry: {0}")]
    Rejected(String),
    #[error("state machine halted: {0}")]
    Halted(String),
    #[error("configuration change rejected: {0}")]
    ConfigChange(String),
    #[error("consensus engine stopped")]
    Stopped,
}

/// Operations the core consumes from a consensus engine.
///
/// Every method may block; async callers go through `spawn_blocking`.
pub trait ConsensusEngine: Send + Sync + 'static {
    /// Replicates `data` and blocks until it is committed and applied locally,
    /// or `timeout` elapses. A timeout does not withdraw the proposal.
    fn propose(&self, data: Vec<u8>, timeout: Duration) -> Result<CommitResult, ConsensusError>;

    /// Adds a voter. No index/term fencing is applied: the change is made
    /// against whatever configuration is current when it commits.
    fn add_voter(&self, member: Member, timeout: Duration) -> Result<CommitResult, ConsensusError>;

    fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<CommitResult, ConsensusError>;

    fn status(&self) -> EngineStatus;

    fn role(&self) -> Role {
        self.status().role
    }

    /// Address-table entry of the leader this node currently follows.
    fn leader(&self) -> Option<Member> {
        self.status().leader().cloned()
    }

    fn members(&self) -> Vec<Member> {
        self.status().members
    }
}

/// Callbacks the engine drives.
///
/// `apply` and `restore` are never invoked concurrently on the same node.
pub trait StateMachine: Send {
    fn apply(&mut self, entry: CommittedEntry<'_>) -> Result<(), ApplyError>;

    /// Records that `index` was consumed without carrying a command
    /// (leader no-ops, configuration changes).
    fn advance(&mut self, index: u64, term: u64);

    fn snapshot(&self) -> SnapshotHandle;

    fn restore(&mut self, index: u64, term: u64, reader: &mut dyn Read) -> Result<(), ApplyError>;

    fn state(&self) -> FsmState;

    fn applied_index(&self) -> u64;
}
