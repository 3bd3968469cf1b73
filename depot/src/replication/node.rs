//! A single replica: raft-rs's `RawNode` wired to a [`StateMachine`].
//!
//! [`RaftNode`] owns the raw consensus state, the log store, the state
//! machine and the cluster address table. It is driven by exactly one thread
//! (see [`super::runtime`]) through `tick`, `step`, `propose*` and
//! `poll_ready`, and performs no I/O beyond its optional data directory.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::storage::MemStorage;
use raft::{StateRole, Storage, INVALID_ID};
use slog::{o, Logger};
use tracing::{debug, error, info, warn};

use super::log_store::PersistedLog;
use super::storage::{DataDir, ReplicaStorage};
use crate::consensus::{
    CommitResult, CommittedEntry, ConsensusError, EngineStatus, Member, NodeId, Role, StateMachine,
};
use crate::fsm::ApplyError;
use crate::persist::{SnapshotRecord, SnapshotStore};

/// Applied entries between two snapshots.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 10;

/// Entries kept in the log behind a snapshot, so slightly lagging followers
/// catch up from the log instead of receiving a full snapshot.
pub const DEFAULT_TRAILING_LOGS: u64 = 10;

/// Log position (and term) of the shared bootstrap snapshot.
const BOOTSTRAP_INDEX: u64 = 1;

/// raft-rs wants an slog logger; its internals stay quiet and this crate
/// reports through `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub local: Member,
    /// Bootstrap address table. Unless `join` is set, these are also the
    /// initial voters. `local` is added if missing.
    pub peers: Vec<Member>,
    /// Start with an empty configuration and wait to be added by the leader.
    pub join: bool,
    pub snapshot_threshold: u64,
    pub trailing_logs: u64,
}

impl NodeOptions {
    pub fn new(local: Member, peers: Vec<Member>) -> Self {
        Self {
            local,
            peers,
            join: false,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            trailing_logs: DEFAULT_TRAILING_LOGS,
        }
    }
}

/// What applying one committed entry produced.
#[derive(Debug)]
pub enum Applied {
    Command(Result<(), ApplyError>),
    ConfChange(Result<(), String>),
    /// Leader no-op, or a configuration change the leader refused and
    /// replaced with an empty entry.
    Empty,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub outcome: Applied,
}

/// Output of one `poll_ready` round: messages to send and entries applied.
#[derive(Debug, Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

pub struct RaftNode {
    id: NodeId,
    raw: RawNode<ReplicaStorage>,
    storage: ReplicaStorage,
    fsm: Box<dyn StateMachine>,
    members: BTreeMap<NodeId, Member>,
    conf_state: ConfState,
    snapshots: Option<SnapshotStore>,
    snapshot_threshold: u64,
    trailing_logs: u64,
    last_snapshot_index: u64,
    /// Set after a voter is added: raft-rs only accepts a snapshot whose
    /// configuration lists the receiver, so the next one must include it.
    snapshot_due: bool,
    halted: Option<String>,
}

impl RaftNode {
    /// Builds a replica.
    ///
    /// With a data directory, the newest saved snapshot is restored first and
    /// the persisted raft log is replayed on top of it: entries up to the
    /// persisted commit index are applied again, and the term and vote are
    /// carried over. The bootstrap configuration in `options` is then
    /// ignored. A saved snapshot the state machine cannot restore is an
    /// error: the node does not come up.
    ///
    /// Each `tick()` is expected every 100ms; elections start after about
    /// 10 ticks without a heartbeat and leaders heartbeat every 3.
    pub fn new(
        options: NodeOptions,
        mut fsm: Box<dyn StateMachine>,
        data: Option<DataDir>,
    ) -> Result<Self> {
        let id = options.local.id;
        let mut members: BTreeMap<NodeId, Member> = options
            .peers
            .iter()
            .map(|member| (member.id, member.clone()))
            .collect();
        members
            .entry(id)
            .or_insert_with(|| options.local.clone());

        let (snapshots, storage, persisted) = match data {
            Some(data) => {
                let storage = ReplicaStorage::durable(MemStorage::new(), data.log);
                (Some(data.snapshots), storage, data.persisted)
            }
            None => (
                None,
                ReplicaStorage::new(MemStorage::new()),
                PersistedLog::default(),
            ),
        };
        let recovered = match &snapshots {
            Some(store) => store.latest().context("failed to read snapshot store")?,
            None => None,
        };

        let mut last_snapshot_index = 0;
        match recovered {
            Some(record) => {
                fsm.restore(record.index, record.term, &mut Cursor::new(&record.state[..]))
                    .with_context(|| {
                        format!("failed to restore snapshot at index {}", record.index)
                    })?;
                let snapshot = raft_snapshot(&record)?;
                storage
                    .mem()
                    .wl()
                    .apply_snapshot(snapshot.clone())
                    .context("failed to load snapshot into the log store")?;
                storage.set_snapshot(snapshot);
                members.extend(record.members.iter().map(|m| (m.id, m.clone())));
                last_snapshot_index = record.index;
                info!(
                    node = id,
                    index = record.index,
                    term = record.term,
                    "recovered from snapshot"
                );
            }
            None if options.join => {
                info!(node = id, "starting with an empty configuration, waiting to be added");
            }
            None => {
                // Bootstrap voters all start from the same snapshot at index 1.
                // The log then never reaches back to index 0, so a node added
                // later is sent this snapshot and learns the initial voters.
                let voters: Vec<NodeId> = options.peers.iter().map(|member| member.id).collect();
                let record = SnapshotRecord {
                    index: BOOTSTRAP_INDEX,
                    term: BOOTSTRAP_INDEX,
                    voters: if voters.is_empty() { vec![id] } else { voters },
                    members: members.values().cloned().collect(),
                    state: crate::snapshot::encode(&BTreeMap::new())
                        .context("failed to encode bootstrap state")?,
                };
                if let Some(store) = &snapshots {
                    store
                        .save(&record)
                        .context("failed to save bootstrap snapshot")?;
                }
                let snapshot = raft_snapshot(&record)?;
                storage
                    .install_snapshot(snapshot)
                    .context("failed to load bootstrap snapshot")?;
                fsm.advance(record.index, record.term);
                last_snapshot_index = record.index;
            }
        }

        let replayed = replay_log(id, &storage, &persisted, fsm.as_mut(), &mut members)?;

        let conf_state = storage
            .initial_state()
            .context("failed to read initial raft state")?
            .conf_state;

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            applied: replayed.applied,
            ..Default::default()
        };
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;

        let mut node = Self {
            id,
            raw,
            storage,
            fsm,
            members,
            conf_state,
            snapshots,
            snapshot_threshold: options.snapshot_threshold.max(1),
            trailing_logs: options.trailing_logs,
            last_snapshot_index,
            snapshot_due: false,
            halted: None,
        };
        if let Some(reason) = replayed.halted {
            node.halt(reason);
        }
        Ok(node)
    }

    pub fn tick(&mut self) {
        if self.halted.is_none() {
            self.raw.tick();
        }
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        match self.raw.raft.state {
            StateRole::Leader => Role::Leader,
            StateRole::Follower => Role::Follower,
            StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
        }
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        let leader = self.raw.raft.leader_id;
        (leader != INVALID_ID).then_some(leader)
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Why the node stopped, if a fatal apply or restore error halted it.
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.halted.is_none() {
            error!(node = self.id, %reason, "replica halted");
            self.halted = Some(reason);
        }
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn voters(&self) -> &[NodeId] {
        &self.conf_state.voters
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            id: self.id,
            role: self.role(),
            term: self.term(),
            leader_id: self.leader_id(),
            applied_index: self.fsm.applied_index(),
            fsm_state: self.fsm.state(),
            voters: self.conf_state.voters.clone(),
            members: self.members.values().cloned().collect(),
        }
    }

    /// Appends `data` to the leader's log and returns its position.
    ///
    /// The entry is only appended, not committed; `poll_ready` reports it
    /// once applied.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<CommitResult, ConsensusError> {
        self.ensure_writable()?;
        let before = self.last_index();
        self.raw
            .propose(vec![], data)
            .map_err(|err| ConsensusError::Dropped(err.to_string()))?;
        self.appended_since(before)
    }

    pub fn propose_add_voter(&mut self, member: &Member) -> Result<CommitResult, ConsensusError> {
        let context = bincode::serialize(member)
            .map_err(|err| ConsensusError::ConfigChange(err.to_string()))?;
        self.propose_conf_change(ConfChangeType::AddNode, member.id, context)
    }

    pub fn propose_remove_voter(&mut self, id: NodeId) -> Result<CommitResult, ConsensusError> {
        self.propose_conf_change(ConfChangeType::RemoveNode, id, Vec::new())
    }

    fn propose_conf_change(
        &mut self,
        change: ConfChangeType,
        node_id: NodeId,
        context: Vec<u8>,
    ) -> Result<CommitResult, ConsensusError> {
        self.ensure_writable()?;
        let mut cc = ConfChange::default();
        cc.set_change_type(change);
        cc.node_id = node_id;
        cc.context = context.into();

        let before = self.last_index();
        self.raw
            .propose_conf_change(vec![], cc)
            .map_err(|err| ConsensusError::ConfigChange(err.to_string()))?;
        self.appended_since(before)
    }

    fn ensure_writable(&self) -> Result<(), ConsensusError> {
        if let Some(reason) = &self.halted {
            return Err(ConsensusError::Halted(reason.clone()));
        }
        if self.raw.raft.state != StateRole::Leader {
            return Err(ConsensusError::NotLeader);
        }
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.raw.raft.raft_log.last_index()
    }

    fn appended_since(&self, before: u64) -> Result<CommitResult, ConsensusError> {
        let index = self.last_index();
        if index == before {
            return Err(ConsensusError::Dropped(
                "entry was not appended to the leader's log".to_string(),
            ));
        }
        Ok(CommitResult {
            index,
            term: self.term(),
        })
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        if self.halted.is_some() {
            return Ok(());
        }
        self.raw.step(msg).context("step failed")
    }

    /// Handles pending raft work, if any.
    ///
    /// Follows the raft-rs ready protocol: install an incoming snapshot,
    /// apply committed entries, persist new entries and hard state, then
    /// advance and apply whatever the light ready adds. Once the node halts
    /// no further ready is taken.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if self.halted.is_some() || !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle::default();
        bundle.messages.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
            if self.halted.is_some() {
                return Ok(Some(bundle));
            }
        }

        self.apply_entries(ready.take_committed_entries(), &mut bundle)?;
        if self.halted.is_some() {
            return Ok(Some(bundle));
        }

        self.storage.append(ready.entries())?;
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state)?;
        }
        bundle.messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }
        bundle.messages.extend(light_ready.take_messages());
        self.apply_entries(light_ready.take_committed_entries(), &mut bundle)?;
        if self.halted.is_some() {
            return Ok(Some(bundle));
        }
        self.raw.advance_apply();

        self.maybe_snapshot()?;
        Ok(Some(bundle))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>, bundle: &mut ReadyBundle) -> Result<()> {
        for entry in entries {
            if self.halted.is_some() {
                break;
            }
            let (index, term) = (entry.index, entry.term);
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => {
                    self.fsm.advance(index, term);
                    Applied::Empty
                }
                EntryType::EntryNormal => {
                    let result = self.fsm.apply(CommittedEntry {
                        index,
                        term,
                        data: &entry.data[..],
                    });
                    if let Err(err) = &result {
                        if err.is_fatal() {
                            self.halt(err.to_string());
                        }
                    }
                    Applied::Command(result)
                }
                EntryType::EntryConfChange => {
                    let result = self.apply_conf_change(&entry)?;
                    self.fsm.advance(index, term);
                    Applied::ConfChange(result)
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(node = self.id, index, "ignoring joint configuration change");
                    self.fsm.advance(index, term);
                    Applied::Empty
                }
            };
            bundle.applied.push(ApplyReport { index, term, outcome });
        }
        Ok(())
    }

    /// Applies a committed membership change. A change raft refuses is
    /// refused identically on every replica, so it is reported, not fatal.
    fn apply_conf_change(&mut self, entry: &Entry) -> Result<Result<(), String>> {
        let cc = ConfChange::decode(&entry.data[..]).context("decode conf change failed")?;
        let conf_state = match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => conf_state,
            Err(err) => {
                warn!(
                    node = self.id,
                    index = entry.index,
                    error = %err,
                    "configuration change refused"
                );
                return Ok(Err(err.to_string()));
            }
        };
        self.storage.set_conf_state(&conf_state)?;
        self.conf_state = conf_state;

        if update_members(self.id, &mut self.members, &cc) {
            self.snapshot_due = true;
        }
        Ok(Ok(()))
    }

    /// Addresses of every other node in the address table.
    pub fn peer_addrs(&self) -> HashSet<SocketAddr> {
        self.members
            .values()
            .filter(|member| member.id != self.id)
            .map(|member| member.raft_addr)
            .collect()
    }

    /// Replaces local state with a snapshot sent by the leader.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term) = {
            let meta = snapshot.get_metadata();
            (meta.index, meta.term)
        };
        let record = match SnapshotRecord::decode(&snapshot.data[..]) {
            Ok(record) => record,
            Err(err) => {
                self.halt(format!("undecodable snapshot at index {index}: {err}"));
                return Ok(());
            }
        };
        if let Err(err) = self
            .fsm
            .restore(index, term, &mut Cursor::new(&record.state[..]))
        {
            self.halt(err.to_string());
            return Ok(());
        }

        // Saved before the log is rewritten past it.
        if let Some(store) = &self.snapshots {
            store
                .save(&record)
                .with_context(|| format!("failed to save snapshot at index {index}"))?;
        }
        self.conf_state = snapshot.get_metadata().get_conf_state().clone();
        self.storage.install_snapshot(snapshot)?;
        self.members
            .extend(record.members.iter().map(|m| (m.id, m.clone())));
        self.last_snapshot_index = index;
        info!(node = self.id, index, term, "installed snapshot from leader");
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        let applied = self.fsm.applied_index();
        if !self.snapshot_due && applied < self.last_snapshot_index + self.snapshot_threshold {
            return Ok(());
        }
        self.snapshot_due = false;
        self.take_snapshot()
    }

    /// Snapshots the state machine at its applied position and compacts the
    /// log up to `trailing_logs` entries behind it.
    pub fn take_snapshot(&mut self) -> Result<()> {
        let handle = self.fsm.snapshot();
        let (index, term) = (handle.index(), handle.term());
        if index == 0 || index <= self.storage.snapshot_index() {
            return Ok(());
        }
        // Retried only after another threshold of entries.
        self.last_snapshot_index = index;

        let state = match handle.into_bytes() {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    node = self.id,
                    index,
                    error = %err,
                    "state not snapshotted; log left uncompacted"
                );
                return Ok(());
            }
        };
        let record = SnapshotRecord {
            index,
            term,
            voters: self.conf_state.voters.clone(),
            members: self.members.values().cloned().collect(),
            state,
        };
        let mut snapshot = raft_snapshot(&record)?;
        snapshot
            .mut_metadata()
            .set_conf_state(self.conf_state.clone());
        self.storage.set_snapshot(snapshot);
        if !self.save(&record) {
            return Ok(());
        }

        let compact_to = index.saturating_sub(self.trailing_logs);
        if compact_to > self.storage.first_index()? {
            self.storage.compact(compact_to)?;
        }
        debug!(node = self.id, index, term, compact_to, "snapshot taken");
        Ok(())
    }

    /// False if the record could not be written; the log must then keep
    /// everything after the previous saved snapshot.
    fn save(&self, record: &SnapshotRecord) -> bool {
        let Some(store) = &self.snapshots else {
            return true;
        };
        match store.save(record) {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    node = self.id,
                    index = record.index,
                    error = %err,
                    "failed to save snapshot"
                );
                false
            }
        }
    }
}

/// Outcome of replaying the persisted log at startup.
struct Replayed {
    applied: u64,
    halted: Option<String>,
}

/// Reloads the persisted entries and hard state after the latest snapshot
/// and applies the committed ones to `fsm`.
///
/// Configuration changes among them are applied to the conf state and the
/// address table idempotently, since a change may already be reflected in
/// the snapshot.
fn replay_log(
    id: NodeId,
    storage: &ReplicaStorage,
    persisted: &PersistedLog,
    fsm: &mut dyn StateMachine,
    members: &mut BTreeMap<NodeId, Member>,
) -> Result<Replayed> {
    let base = storage.first_index()?.saturating_sub(1);
    let entries = persisted.entries_after(base);
    if !entries.is_empty() {
        storage
            .mem()
            .wl()
            .append(&entries)
            .context("failed to reload persisted entries")?;
    }

    let initial = storage.initial_state()?;
    let mut hs = initial.hard_state;
    if let Some(saved) = &persisted.hard_state {
        if saved.term >= hs.term {
            hs.term = saved.term;
            hs.vote = saved.vote;
        }
        hs.commit = hs.commit.max(saved.commit);
    }
    hs.commit = hs.commit.min(storage.last_index()?);
    storage.mem().wl().set_hardstate(hs.clone());

    let mut conf_state = initial.conf_state;
    let mut replayed = Replayed {
        applied: base,
        halted: None,
    };
    for entry in entries.iter().take_while(|entry| entry.index <= hs.commit) {
        let (index, term) = (entry.index, entry.term);
        match entry.entry_type() {
            EntryType::EntryNormal if !entry.data.is_empty() => {
                let result = fsm.apply(CommittedEntry {
                    index,
                    term,
                    data: &entry.data[..],
                });
                match result {
                    Err(err) if err.is_fatal() => {
                        replayed.halted = Some(err.to_string());
                        break;
                    }
                    Err(err) => debug!(node = id, index, error = %err, "replayed entry rejected"),
                    Ok(()) => {}
                }
            }
            EntryType::EntryConfChange => {
                let cc = ConfChange::decode(&entry.data[..])
                    .with_context(|| format!("decode conf change at index {index} failed"))?;
                replay_conf_change(&mut conf_state, &cc);
                update_members(id, members, &cc);
                fsm.advance(index, term);
            }
            _ => fsm.advance(index, term),
        }
        replayed.applied = index;
    }
    storage.mem().wl().set_conf_state(conf_state);

    if let Some(saved) = &persisted.hard_state {
        info!(
            node = id,
            term = saved.term,
            vote = saved.vote,
            applied = replayed.applied,
            "replayed persisted raft log"
        );
    }
    Ok(replayed)
}

/// Applies `cc` to `conf_state` unless it is already reflected there.
fn replay_conf_change(conf_state: &mut ConfState, cc: &ConfChange) {
    let node = cc.node_id;
    match cc.change_type() {
        ConfChangeType::AddNode => {
            conf_state.learners.retain(|&id| id != node);
            if !conf_state.voters.contains(&node) {
                conf_state.voters.push(node);
            }
        }
        ConfChangeType::AddLearnerNode => {
            if !conf_state.voters.contains(&node) && !conf_state.learners.contains(&node) {
                conf_state.learners.push(node);
            }
        }
        ConfChangeType::RemoveNode => {
            // raft refuses to remove the last voter.
            if conf_state.voters != [node] {
                conf_state.voters.retain(|&id| id != node);
                conf_state.learners.retain(|&id| id != node);
            }
        }
    }
}

/// Records an applied membership change in the address table. Returns true
/// when a node was added with its addresses.
fn update_members(local: NodeId, members: &mut BTreeMap<NodeId, Member>, cc: &ConfChange) -> bool {
    match cc.change_type() {
        ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
            match bincode::deserialize::<Member>(&cc.context[..]) {
                Ok(member) => {
                    info!(node = local, added = %member, "voter added");
                    members.insert(member.id, member);
                    true
                }
                Err(err) => {
                    warn!(
                        node = local,
                        added = cc.node_id,
                        error = %err,
                        "voter added without an address"
                    );
                    false
                }
            }
        }
        ConfChangeType::RemoveNode => {
            info!(node = local, removed = cc.node_id, "voter removed");
            members.remove(&cc.node_id);
            false
        }
    }
}

/// Wraps a record as a raft snapshot carrying the record's voters.
fn raft_snapshot(record: &SnapshotRecord) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    snapshot.data = record.encode().context("encode snapshot record failed")?.into();
    let meta = snapshot.mut_metadata();
    meta.index = record.index;
    meta.term = record.term;
    meta.set_conf_state(ConfState::from((record.voters.clone(), vec![])));
    Ok(snapshot)
}
