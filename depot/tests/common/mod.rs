//! Shared fixtures: an in-process consensus engine and HTTP servers on
//! ephemeral ports.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use depot::consensus::{
    CommitResult, CommittedEntry, ConsensusEngine, ConsensusError, EngineStatus, Member, NodeId,
    Role,
};
use depot::fsm::Fsm;
use depot::gateway::{Gateway, GatewayConfig};
use depot::http;
use depot::store::KvStore;

/// A single-process stand-in for a consensus engine.
///
/// Proposals are "committed" immediately by applying them to the local FSM,
/// so a leader's writes are visible as soon as `propose` returns. Role,
/// leader and failure modes are set by the test.
pub struct LocalEngine {
    local: Member,
    state: Mutex<EngineState>,
}

struct EngineState {
    fsm: Fsm,
    role: Role,
    term: u64,
    last_index: u64,
    leader: Option<Member>,
    members: Vec<Member>,
    stall: bool,
    reject_proposals: Option<String>,
    reject_conf_changes: Option<String>,
}

impl LocalEngine {
    pub fn leader(local: Member) -> Arc<Self> {
        Self::build(local.clone(), Role::Leader, Some(local))
    }

    pub fn follower(local: Member, leader: Option<Member>) -> Arc<Self> {
        Self::build(local, Role::Follower, leader)
    }

    fn build(local: Member, role: Role, leader: Option<Member>) -> Arc<Self> {
        let mut members = vec![local.clone()];
        if let Some(leader) = &leader {
            if leader.id != local.id {
                members.push(leader.clone());
            }
        }
        Arc::new(Self {
            local,
            state: Mutex::new(EngineState {
                fsm: Fsm::new(),
                role,
                term: 1,
                last_index: 0,
                leader,
                members,
                stall: false,
                reject_proposals: None,
                reject_conf_changes: None,
            }),
        })
    }

    pub fn store(&self) -> Arc<KvStore> {
        self.state.lock().fsm.store()
    }

    /// Proposals wait out their timeout instead of committing.
    pub fn stall(&self) {
        self.state.lock().stall = true;
    }

    /// Proposals commit but the state machine rejects them.
    pub fn reject_proposals(&self, reason: &str) {
        self.state.lock().reject_proposals = Some(reason.to_string());
    }

    pub fn reject_conf_changes(&self, reason: &str) {
        self.state.lock().reject_conf_changes = Some(reason.to_string());
    }

    /// Feeds a raw payload through the FSM as if it had been committed.
    pub fn commit_raw(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.last_index += 1;
        let entry = CommittedEntry {
            index: state.last_index,
            term: state.term,
            data,
        };
        let _ = state.fsm.apply(entry);
    }

    fn check_leader(&self) -> Result<(), ConsensusError> {
        if self.state.lock().role == Role::Leader {
            Ok(())
        } else {
            Err(ConsensusError::NotLeader)
        }
    }

    fn next_position(state: &mut EngineState) -> CommitResult {
        state.last_index += 1;
        CommitResult {
            index: state.last_index,
            term: state.term,
        }
    }
}

impl ConsensusEngine for LocalEngine {
    fn propose(&self, data: Vec<u8>, timeout: Duration) -> Result<CommitResult, ConsensusError> {
        self.check_leader()?;
        if self.state.lock().stall {
            std::thread::sleep(timeout);
            return Err(ConsensusError::Timeout(timeout));
        }

        let mut state = self.state.lock();
        let position = Self::next_position(&mut state);
        if let Some(reason) = state.reject_proposals.clone() {
            state.fsm.advance(position.index, position.term);
            return Err(ConsensusError::Rejected(reason));
        }
        match state.fsm.apply(CommittedEntry {
            index: position.index,
            term: position.term,
            data: &data,
        }) {
            Ok(()) => Ok(position),
            Err(err) if err.is_fatal() => Err(ConsensusError::Halted(err.to_string())),
            Err(err) => Err(ConsensusError::Rejected(err.to_string())),
        }
    }

    fn add_voter(
        &self,
        member: Member,
        _timeout: Duration,
    ) -> Result<CommitResult, ConsensusError> {
        self.check_leader()?;
        let mut state = self.state.lock();
        if let Some(reason) = state.reject_conf_changes.clone() {
            return Err(ConsensusError::ConfigChange(reason));
        }
        let position = Self::next_position(&mut state);
        state.fsm.advance(position.index, position.term);
        state.members.retain(|known| known.id != member.id);
        state.members.push(member);
        Ok(position)
    }

    fn remove_server(
        &self,
        id: NodeId,
        _timeout: Duration,
    ) -> Result<CommitResult, ConsensusError> {
        self.check_leader()?;
        let mut state = self.state.lock();
        if let Some(reason) = state.reject_conf_changes.clone() {
            return Err(ConsensusError::ConfigChange(reason));
        }
        let position = Self::next_position(&mut state);
        state.fsm.advance(position.index, position.term);
        state.members.retain(|known| known.id != id);
        Ok(position)
    }

    fn status(&self) -> EngineStatus {
        let state = self.state.lock();
        EngineStatus {
            id: self.local.id,
            role: state.role,
            term: state.term,
            leader_id: state.leader.as_ref().map(|leader| leader.id),
            applied_index: state.fsm.applied_index(),
            fsm_state: state.fsm.state(),
            voters: state.members.iter().map(|member| member.id).collect(),
            members: state.members.clone(),
        }
    }
}

pub fn member(raft_port: u16, api_addr: Option<SocketAddr>) -> Member {
    Member::new(SocketAddr::from(([127, 0, 0, 1], raft_port)), api_addr)
}

/// Binds an ephemeral port for an API server that is started later.
pub async fn bind_api() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Serves `engine` behind a gateway on `listener` for the rest of the test.
pub fn serve(listener: TcpListener, engine: Arc<LocalEngine>, config: GatewayConfig) -> Gateway {
    let gateway = Gateway::new(engine.store(), engine, config);
    let server = gateway.clone();
    tokio::spawn(async move {
        let _ = http::serve(listener, server, std::future::pending()).await;
    });
    gateway
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}
