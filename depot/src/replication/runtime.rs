//! Worker thread and peer transport for a [`RaftNode`].
//!
//! - **Worker thread** owns the node. It ticks the raft clock, steps peer
//!   messages, takes proposals from [`RaftHandle`], and answers each proposer
//!   once its entry is applied.
//! - **Listener thread** accepts peer connections; one reader thread per
//!   connection decodes frames and hands them to the worker.
//! - **Sender threads**, one per peer, keep an outbound connection open.
//!
//! Frames on the wire are a 4-byte big-endian length followed by a
//! protobuf-encoded raft `Message`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, info, warn};

use super::node::{Applied, ApplyReport, NodeOptions, RaftNode};
use super::storage::DataDir;
use crate::consensus::{
    CommitResult, ConsensusEngine, ConsensusError, EngineStatus, Member, NodeId, Role, StateMachine,
};

/// Raft logical clock interval. Heartbeats go out every 3 ticks and
/// elections start after about 10.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames queued per peer before new ones are dropped. Raft retransmits, so
/// losing messages to an unreachable peer is harmless.
const PEER_QUEUE: usize = 1024;

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

type Reply = Sender<Result<CommitResult, ConsensusError>>;

enum Request {
    Propose { data: Vec<u8>, respond_to: Reply },
    AddVoter { member: Member, respond_to: Reply },
    RemoveVoter { id: NodeId, respond_to: Reply },
    Campaign { respond_to: Sender<Result<()>> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Command,
    ConfChange,
}

/// A proposal waiting for its entry to be applied.
///
/// Keyed by log index. If the entry applied at that index carries a
/// different term, the proposal was overwritten by a later leader.
struct Pending {
    position: CommitResult,
    kind: PendingKind,
    respond_to: Reply,
}

/// Client side of a running replica.
///
/// Cloneable; every clone talks to the same worker. The worker stops once
/// [`RaftHandle::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct RaftHandle {
    request_tx: Sender<Request>,
    status: Arc<RwLock<EngineStatus>>,
}

impl RaftHandle {
    fn request(
        &self,
        build: impl FnOnce(Reply) -> Request,
        timeout: Duration,
    ) -> Result<CommitResult, ConsensusError> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(build(resp_tx))
            .map_err(|_| ConsensusError::Stopped)?;
        match resp_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ConsensusError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ConsensusError::Stopped),
        }
    }

    /// Starts an election on this node right away instead of waiting for the
    /// election timeout.
    pub fn campaign(&self) -> Result<()> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(Request::Campaign {
                respond_to: resp_tx,
            })
            .context("failed to send campaign request")?;
        resp_rx.recv().context("campaign response channel closed")?
    }

    pub fn shutdown(&self) {
        let _ = self.request_tx.send(Request::Shutdown);
    }
}

impl ConsensusEngine for RaftHandle {
    fn propose(&self, data: Vec<u8>, timeout: Duration) -> Result<CommitResult, ConsensusError> {
        self.request(|respond_to| Request::Propose { data, respond_to }, timeout)
    }

    fn add_voter(&self, member: Member, timeout: Duration) -> Result<CommitResult, ConsensusError> {
        self.request(|respond_to| Request::AddVoter { member, respond_to }, timeout)
    }

    fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<CommitResult, ConsensusError> {
        self.request(|respond_to| Request::RemoveVoter { id, respond_to }, timeout)
    }

    fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }
}

/// Builds the replica, binds its raft address and starts the worker.
///
/// Fails if the address cannot be bound or the data directory cannot be
/// recovered.
pub fn spawn_node(
    options: NodeOptions,
    fsm: Box<dyn StateMachine>,
    data: Option<DataDir>,
) -> Result<RaftHandle> {
    let raft_addr = options.local.raft_addr;
    let node = RaftNode::new(options, fsm, data)?;
    let id = node.id();

    let listener = TcpListener::bind(raft_addr)
        .with_context(|| format!("failed to bind raft address {raft_addr}"))?;
    let (request_tx, request_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    spawn_network_listener(listener, network_tx)?;

    let status = Arc::new(RwLock::new(node.status()));
    let mut worker = Worker::new(node, request_rx, network_rx, Arc::clone(&status));
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                warn!(node = id, error = %err, "raft worker stopped");
            }
        })
        .context("failed to spawn raft worker")?;

    info!(node = id, %raft_addr, "raft node started");
    Ok(RaftHandle { request_tx, status })
}

struct Worker {
    node: RaftNode,
    request_rx: Receiver<Request>,
    network_rx: Receiver<Message>,
    status: Arc<RwLock<EngineStatus>>,
    outbox: Outbox,
    pending: BTreeMap<u64, Pending>,
    last_role: Role,
}

impl Worker {
    fn new(
        node: RaftNode,
        request_rx: Receiver<Request>,
        network_rx: Receiver<Message>,
        status: Arc<RwLock<EngineStatus>>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            request_rx,
            network_rx,
            status,
            outbox: Outbox::default(),
            pending: BTreeMap::new(),
            last_role,
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => self.step(msg),
                        Err(_) => return Err(anyhow!("network listener stopped")),
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready();
            self.log_role_change();
            *self.status.write() = self.node.status();
        }

        info!(node = self.node.id(), "raft worker shutting down");
        self.fail_pending(|| ConsensusError::Stopped);
        Ok(())
    }

    /// Returns `false` once shutdown was requested.
    fn handle_request(&mut self, req: Request) -> bool {
        match req {
            Request::Propose { data, respond_to } => {
                let proposed = self.node.propose(data);
                self.track(proposed, PendingKind::Command, respond_to);
            }
            Request::AddVoter { member, respond_to } => {
                let proposed = self.node.propose_add_voter(&member);
                self.track(proposed, PendingKind::ConfChange, respond_to);
            }
            Request::RemoveVoter { id, respond_to } => {
                let proposed = self.node.propose_remove_voter(id);
                self.track(proposed, PendingKind::ConfChange, respond_to);
            }
            Request::Campaign { respond_to } => {
                let _ = respond_to.send(self.node.campaign());
            }
            Request::Shutdown => return false,
        }
        true
    }

    fn track(
        &mut self,
        proposed: Result<CommitResult, ConsensusError>,
        kind: PendingKind,
        respond_to: Reply,
    ) {
        match proposed {
            Ok(position) => {
                debug!(
                    node = self.node.id(),
                    index = position.index,
                    term = position.term,
                    ?kind,
                    "proposed"
                );
                self.pending.insert(
                    position.index,
                    Pending {
                        position,
                        kind,
                        respond_to,
                    },
                );
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    fn step(&mut self, msg: Message) {
        if let Err(err) = self.node.step(msg) {
            debug!(node = self.node.id(), error = %err, "dropping raft message");
        }
    }

    fn process_ready(&mut self) {
        loop {
            match self.node.poll_ready() {
                Ok(Some(bundle)) => {
                    for msg in bundle.messages {
                        self.dispatch(msg);
                    }
                    let mut reconfigured = false;
                    for report in bundle.applied {
                        reconfigured |= matches!(report.outcome, Applied::ConfChange(Ok(())));
                        self.resolve(report);
                    }
                    if reconfigured {
                        self.outbox.retain(&self.node.peer_addrs());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.node.halt(format!("{err:#}"));
                    break;
                }
            }
        }
        if let Some(reason) = self.node.halted().map(str::to_owned) {
            self.fail_pending(|| ConsensusError::Halted(reason.clone()));
        }
    }

    fn dispatch(&mut self, msg: Message) {
        if msg.to == self.node.id() {
            self.step(msg);
            return;
        }
        let to = msg.to;
        match self.node.member(to) {
            Some(member) => self.outbox.send(member.raft_addr, &msg),
            None => warn!(node = self.node.id(), to, "no address for peer, dropping message"),
        }
    }

    /// Answers the proposer of the entry in `report`, if this node has one.
    fn resolve(&mut self, report: ApplyReport) {
        // Anything still pending below this index was skipped by a snapshot
        // install; whether it made it into that snapshot is unknown.
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() >= report.index {
                break;
            }
            let pending = entry.remove();
            let _ = pending.respond_to.send(Err(ConsensusError::Dropped(format!(
                "log replaced by a snapshot past index {}; the entry may or may not be applied",
                pending.position.index
            ))));
        }

        let Some(pending) = self.pending.remove(&report.index) else {
            return;
        };
        if pending.position.term != report.term {
            let _ = pending.respond_to.send(Err(ConsensusError::Dropped(format!(
                "entry at index {} was overwritten in term {}",
                report.index, report.term
            ))));
            return;
        }

        let result = match (pending.kind, report.outcome) {
            (PendingKind::Command, Applied::Command(Ok(()))) => Ok(pending.position),
            (PendingKind::Command, Applied::Command(Err(err))) if err.is_fatal() => {
                Err(ConsensusError::Halted(err.to_string()))
            }
            (PendingKind::Command, Applied::Command(Err(err))) => {
                Err(ConsensusError::Rejected(err.to_string()))
            }
            (PendingKind::ConfChange, Applied::ConfChange(Ok(()))) => Ok(pending.position),
            (PendingKind::ConfChange, Applied::ConfChange(Err(reason))) => {
                Err(ConsensusError::ConfigChange(reason))
            }
            (PendingKind::ConfChange, Applied::Empty) => Err(ConsensusError::ConfigChange(
                "another configuration change is still in progress".to_string(),
            )),
            (kind, outcome) => Err(ConsensusError::Dropped(format!(
                "expected a {kind:?} entry at index {}, applied {outcome:?}",
                report.index
            ))),
        };
        let _ = pending.respond_to.send(result);
    }

    fn fail_pending(&mut self, err: impl Fn() -> ConsensusError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.respond_to.send(Err(err()));
        }
    }

    fn log_role_change(&mut self) {
        let current = self.node.role();
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                term = self.node.term(),
                leader = ?self.node.leader_id(),
                "role changed"
            );
            self.last_role = current;
        }
    }
}

/// Outbound queues, one sender thread per peer address.
#[derive(Default)]
struct Outbox {
    peers: HashMap<SocketAddr, Sender<Vec<u8>>>,
}

impl Outbox {
    fn send(&mut self, addr: SocketAddr, msg: &Message) {
        if !self.peers.contains_key(&addr) {
            match spawn_peer_sender(addr) {
                Ok(queue) => {
                    self.peers.insert(addr, queue);
                }
                Err(err) => {
                    warn!(%addr, error = %err, "failed to start peer sender");
                    return;
                }
            }
        }
        let Some(queue) = self.peers.get(&addr) else {
            return;
        };
        match queue.try_send(msg.encode_to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(%addr, "peer queue full, dropping message"),
            Err(TrySendError::Disconnected(_)) => {
                self.peers.remove(&addr);
            }
        }
    }

    /// Drops the queues of peers no longer in `live`. A sender thread exits
    /// once its queue is dropped and drained.
    fn retain(&mut self, live: &HashSet<SocketAddr>) {
        self.peers.retain(|addr, _| {
            let keep = live.contains(addr);
            if !keep {
                debug!(%addr, "closing connection to removed peer");
            }
            keep
        });
    }
}

fn spawn_peer_sender(addr: SocketAddr) -> Result<Sender<Vec<u8>>> {
    let (tx, rx) = bounded::<Vec<u8>>(PEER_QUEUE);
    thread::Builder::new()
        .name(format!("raft-send-{addr}"))
        .spawn(move || {
            let mut stream: Option<TcpStream> = None;
            for frame in rx {
                if stream.is_none() {
                    match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                        Ok(connected) => {
                            let _ = connected.set_nodelay(true);
                            stream = Some(connected);
                        }
                        Err(err) => {
                            debug!(%addr, error = %err, "peer unreachable");
                            continue;
                        }
                    }
                }
                if let Some(conn) = stream.as_mut() {
                    if let Err(err) = write_frame(conn, &frame) {
                        debug!(%addr, error = %err, "peer connection lost");
                        stream = None;
                    }
                }
            }
        })
        .context("failed to spawn peer sender")?;
    Ok(tx)
}

fn spawn_network_listener(listener: TcpListener, tx: Sender<Message>) -> Result<()> {
    let addr = listener.local_addr()?;
    thread::Builder::new()
        .name(format!("raft-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "peer connection closed");
                            }
                        });
                    }
                    Err(err) => warn!(%addr, error = %err, "accept failed"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads frames until the peer hangs up.
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        let msg = Message::decode(&buf[..])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tx.send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    }
}

fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    let len = u32::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(frame)?;
    stream.flush()
}
