//! Dispatcher / Event Loop (spec §4.6) and the Embedding API (spec §6).
//!
//! Grounded on `redisless/src/server.rs`'s `_init_configuration`/`start_server` loop (bind,
//! `set_nonblocking`, a worker pool, a `crossbeam-channel` control bus) and
//! `redisless/src/cluster/mod.rs`'s periodic-tick skeleton, generalized from a single Redis
//! server into the multi-group Raft loop this spec describes. Everything here runs cooperatively
//! on one thread: the listener's accept loop, inbound socket polling, the task queue drain, and
//! the periodic ticker. `rayon` is reserved for the one place actual parallel I/O helps —
//! dialing several newly configured peers at once when a group is first added — rather than for
//! the loop itself, which must stay single-threaded per the spec's concurrency model.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;
use log::{info, warn};
use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;
use raft::message::{
    AppendRequest, AppendResponse, EntryKind, Message, MessageDestination, Rpc, SendableMessage,
    VoteRequest, VoteResponse,
};

use journal::JournalBackend;

use crate::config::{EngineConfig, GroupSpec};
use crate::error::SubmitError;
use crate::group::{GroupConfig, MemberInfo, NodeId, RaftGroup};
use crate::multi::Multi;
use crate::registry::{ConnState, PeerAddr, Registry};
use crate::rendezvous::{CommitOutcome, Rendezvous};
use crate::tasks::{SubmitResult, Task, TaskQueue};
use crate::wire::{Body, Envelope, GroupIdentity};

/// The state-machine callback (spec §6 collaborator): invoked on the loop thread, in strict
/// index order, exactly once per committed `Normal` entry.
pub type ApplyCallback = Box<dyn FnMut(GroupIdentity, u32, Bytes) + Send>;

/// The multi-group Raft loop and the embedding API around it (spec §6 `Evts`).
pub struct Engine<B: JournalBackend> {
    listener: Option<TcpListener>,
    registry: Registry,
    multi: Multi<B, ChaChaRng>,
    tasks: TaskQueue,
    rendezvous: Arc<Rendezvous>,
    shutdown: mpb::MPB<()>,
    config: EngineConfig,
    last_tick: Instant,
    backend_factory: Box<dyn Fn() -> B + Send>,
    apply: ApplyCallback,
}

impl<B: JournalBackend + Send + 'static> Engine<B> {
    /// `make(self_port) → Evts` (spec §6), generalized with the backend factory and
    /// state-machine callback a Rust embedding needs at construction instead of through global
    /// callback tables (Design Notes §9).
    pub fn make(
        config: EngineConfig,
        backend_factory: impl Fn() -> B + Send + 'static,
        apply: ApplyCallback,
    ) -> Self {
        let listener = match TcpListener::bind(("0.0.0.0", config.self_port)) {
            Ok(listener) => {
                let _ = listener.set_nonblocking(true);
                Some(listener)
            }
            Err(err) => {
                warn!("failed to bind Raft listener on port {}: {}", config.self_port, err);
                None
            }
        };

        Self {
            listener,
            registry: Registry::new(),
            multi: Multi::new(),
            tasks: TaskQueue::new(),
            rendezvous: Arc::new(Rendezvous::new()),
            shutdown: mpb::MPB::new(),
            config,
            last_tick: Instant::now(),
            backend_factory: Box::new(backend_factory),
            apply,
        }
    }

    /// `free(Evts)` (spec §6): wakes every still-blocked submitter and releases the listener.
    pub fn free(mut self) {
        self.rendezvous.wake_all_shutting_down();
        let _ = self.shutdown.tx().send(());
        self.listener = None;
    }

    /// A `Sender` foreign threads use to enqueue tasks directly (spec §4.8). `add_group`,
    /// `remove_group` and `submit` are convenience wrappers around this for the common case.
    pub fn task_sender(&self) -> Sender<Task> {
        self.tasks.sender()
    }

    /// A broadcast receiver woken exactly once when the engine shuts down, independent of any
    /// particular pending submission (spec workspace note: the one place `mpb`'s fan-out, rather
    /// than point-to-point channels, is the right tool).
    pub fn shutdown_receiver(&mut self) -> crossbeam_channel::Receiver<()> {
        self.shutdown.rx()
    }

    /// `add_group(Evts, Group)` (spec §6): registers a new group. If it has exactly one
    /// configured node, the loop thread transitions it to Leader on the next `once` (spec §4.8).
    pub fn add_group(&self, spec: GroupSpec) {
        let nodes: Vec<(NodeId, MemberInfo)> = spec.nodes.iter().map(|d| (*d).into()).collect();
        let group_config = GroupConfig {
            identity: spec.identity,
            local_node_id: spec.local_node_id,
            members: nodes,
            promotion_lag: spec.promotion_lag,
            raft: spec.raft_config(),
        };
        let _ = self.tasks.sender().send(Task::AddGroup(group_config));
    }

    /// `remove_group(Evts, identity)` (spec §6).
    pub fn remove_group(&self, identity: GroupIdentity) {
        let _ = self.tasks.sender().send(Task::RemoveGroup(identity));
    }

    /// `submit(Evts, identity, entry) → commit_result` (spec §6): blocks until the entry
    /// commits, `timeout` elapses (`None` means indefinitely), or the engine shuts down.
    pub fn submit(
        &self,
        identity: GroupIdentity,
        data: Bytes,
        timeout: Option<Duration>,
    ) -> Result<CommitOutcome, SubmitError> {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        self.tasks
            .sender()
            .send(Task::SubmitEntry {
                identity,
                kind: EntryKind::Normal,
                id: 0,
                data,
                result: result_tx,
            })
            .map_err(|_| SubmitError::ShuttingDown)?;

        match result_rx.recv().map_err(|_| SubmitError::ShuttingDown)? {
            SubmitResult::NotLeader => Err(SubmitError::NotLeader),
            SubmitResult::UnknownGroup => Err(SubmitError::UnknownGroup),
            SubmitResult::Pending(handle) => handle.wait(timeout).ok_or(SubmitError::Timeout),
        }
    }

    /// `once(Evts)` (spec §6): runs one loop iteration — drains the task queue, services socket
    /// I/O, and, if the tick interval has elapsed, drives every group's periodic tick.
    pub fn once(&mut self) {
        self.drain_tasks();
        self.accept_connections();
        self.poll_connections();

        if self.last_tick.elapsed() >= self.config.tick_interval {
            self.last_tick = Instant::now();
            self.tick_groups();
            self.registry.retry_disconnected();
        }
    }

    fn drain_tasks(&mut self) {
        for task in self.tasks.drain() {
            match task {
                Task::AddGroup(group_config) => self.handle_add_group(group_config),
                Task::RemoveGroup(identity) => {
                    self.multi.remove(&identity);
                }
                Task::SubmitEntry {
                    identity,
                    kind,
                    id,
                    data,
                    result,
                } => self.handle_submit(identity, kind, id, data, result),
            }
        }
    }

    fn handle_add_group(&mut self, group_config: GroupConfig) {
        let identity = group_config.identity;
        let local_node_id = group_config.local_node_id;
        let single_node = group_config.members.len() == 1;
        let election_timeout_ticks = group_config.raft.election_timeout_ticks;
        let peers: Vec<(NodeId, MemberInfo)> = group_config
            .members
            .iter()
            .cloned()
            .filter(|(id, _)| *id != local_node_id)
            .collect();

        let backend = (self.backend_factory)();
        let seed = seed_for(identity, local_node_id);
        let mut group = RaftGroup::new(group_config, backend, ChaChaRng::seed_from_u64(seed));

        for (_, info) in &peers {
            self.registry.find_or_create(PeerAddr::new(info.host, info.raft_port));
        }

        if single_node {
            // A single-node cluster has no peers to wait on; drive it past its own election
            // timeout immediately instead of waiting for the next periodic tick (spec §4.8).
            for _ in 0..=election_timeout_ticks {
                let messages = durable_or_abort(identity, group.timer_tick());
                let lookup = member_lookup(&group);
                route(&mut self.registry, &lookup, identity, messages);
            }
        }

        info!("group {} registered ({} members)", identity, peers.len() + 1);
        self.multi.insert(group);
        self.apply_and_wake(identity);
    }

    fn handle_submit(
        &mut self,
        identity: GroupIdentity,
        kind: EntryKind,
        id: u32,
        data: Bytes,
        result: Sender<SubmitResult>,
    ) {
        let group = match self.multi.get_mut(&identity) {
            Some(group) => group,
            None => {
                let _ = result.send(SubmitResult::UnknownGroup);
                return;
            }
        };

        let submitted = append_or_abort(identity, group.submit(kind, id, data));
        match submitted {
            Some((idx, messages)) => {
                let handle = self.rendezvous.register(identity, idx.id);
                let lookup = member_lookup(group);
                route(&mut self.registry, &lookup, identity, messages);
                let _ = result.send(SubmitResult::Pending(handle));
                self.apply_and_wake(identity);
            }
            None => {
                let _ = result.send(SubmitResult::NotLeader);
            }
        }
    }

    fn accept_connections(&mut self) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };
        loop {
            match listener.accept() {
                Ok((stream, SocketAddr::V4(addr))) => {
                    let _ = stream.set_nonblocking(true);
                    self.registry
                        .insert_accepted(PeerAddr::new(*addr.ip(), addr.port()), stream);
                }
                Ok((_, SocketAddr::V6(_))) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept error: {}", err);
                    break;
                }
            }
        }
    }

    fn poll_connections(&mut self) {
        let mut inbound = Vec::new();
        for (addr, conn) in self.registry.iter_mut() {
            for payload in conn.poll_bytes() {
                inbound.push((*addr, payload));
            }
        }
        for (addr, payload) in inbound {
            match Envelope::decode(&payload) {
                Ok(envelope) => self.handle_envelope(addr, envelope),
                Err(err) => warn!("dropping malformed envelope from {:?}: {}", addr, err),
            }
        }
    }

    fn handle_envelope(&mut self, from_addr: PeerAddr, envelope: Envelope) {
        let identity = envelope.identity;
        if !self.multi.contains(&identity) {
            verbose!("dropping frame for unknown group {}", identity);
            return;
        }
        let from_node_id = envelope.node_id;

        match envelope.body {
            Body::Handshake { raft_port } => self.handle_handshake(identity, from_addr, from_node_id, raft_port),
            Body::HandshakeResponse { success, leader } => {
                self.handle_handshake_response(from_addr, success, leader)
            }
            Body::Leave => self.handle_leave(identity, from_addr, from_node_id),
            Body::LeaveResponse => self.handle_leave_response(identity),
            body @ (Body::RequestVote { .. }
            | Body::RequestVoteResponse { .. }
            | Body::AppendEntries { .. }
            | Body::AppendEntriesResponse { .. }) => {
                if let Some(message) = to_raft_message(body) {
                    if let Some(group) = self.multi.get_mut(&identity) {
                        let messages = durable_or_abort(identity, group.receive(message, from_node_id));
                        let lookup = member_lookup(group);
                        route(&mut self.registry, &lookup, identity, messages);
                    }
                    self.apply_and_wake(identity);
                }
            }
        }
    }

    fn handle_handshake(&mut self, identity: GroupIdentity, from_addr: PeerAddr, from_node_id: NodeId, raft_port: u16) {
        let is_leader = self.multi.get_mut(&identity).map(|g| g.is_leader()).unwrap_or(false);
        if !is_leader {
            let leader = self.multi.get_mut(&identity).and_then(|group| {
                group
                    .leader()
                    .and_then(|leader_id| group.member(leader_id).copied())
                    .map(|info| (info.host, info.raft_port))
            });
            self.reply(from_addr, identity, from_node_id, Body::HandshakeResponse { success: false, leader });
            return;
        }

        let known = self
            .multi
            .get_mut(&identity)
            .map(|group| group.member(from_node_id).is_some())
            .unwrap_or(false);
        if !known {
            let info = MemberInfo {
                host: from_addr.host,
                raft_port,
                voting: false,
            };
            if let Some(group) = self.multi.get_mut(&identity) {
                if let Some((_idx, messages)) = append_or_abort(identity, group.add_nonvoting(from_node_id, info)) {
                    let lookup = member_lookup(group);
                    route(&mut self.registry, &lookup, identity, messages);
                }
            }
            self.apply_and_wake(identity);
        }

        self.reply(from_addr, identity, from_node_id, Body::HandshakeResponse { success: true, leader: None });
    }

    fn handle_handshake_response(&mut self, from_addr: PeerAddr, success: bool, leader: Option<(Ipv4Addr, u16)>) {
        if success {
            if let Some(conn) = self.registry.get_mut(&from_addr) {
                conn.state = ConnState::Connected;
            }
        } else if let Some((host, port)) = leader {
            self.registry.find_or_create(PeerAddr::new(host, port));
        }
    }

    fn handle_leave(&mut self, identity: GroupIdentity, from_addr: PeerAddr, from_node_id: NodeId) {
        let is_leader = self.multi.get_mut(&identity).map(|g| g.is_leader()).unwrap_or(false);
        if !is_leader {
            return;
        }
        if let Some(group) = self.multi.get_mut(&identity) {
            if let Some((_idx, messages)) = append_or_abort(identity, group.remove_node(from_node_id)) {
                let lookup = member_lookup(group);
                route(&mut self.registry, &lookup, identity, messages);
            }
        }
        self.apply_and_wake(identity);
        self.reply(from_addr, identity, from_node_id, Body::LeaveResponse);
    }

    fn handle_leave_response(&mut self, identity: GroupIdentity) {
        info!("group {} acknowledged our departure, shutting down", identity);
        self.rendezvous.wake_all_shutting_down();
        let _ = self.shutdown.tx().send(());
    }

    fn tick_groups(&mut self) {
        let identities: Vec<GroupIdentity> = self.multi.iter_mut().map(|(id, _)| *id).collect();
        for identity in identities {
            let tick_result = match self.multi.get_mut(&identity) {
                Some(group) => group.timer_tick(),
                None => continue,
            };
            let messages = durable_or_abort(identity, tick_result);
            if let Some(group) = self.multi.get_mut(&identity) {
                let lookup = member_lookup(group);
                route(&mut self.registry, &lookup, identity, messages);
            }
            self.apply_and_wake(identity);
            self.promote_caught_up_members(identity);
        }
    }

    fn promote_caught_up_members(&mut self, identity: GroupIdentity) {
        let candidate = self
            .multi
            .get_mut(&identity)
            .and_then(|group| group.member_ready_for_promotion());
        if let Some((node_id, _info)) = candidate {
            if let Some(group) = self.multi.get_mut(&identity) {
                let submitted = append_or_abort(identity, group.submit(EntryKind::AddVoter, node_id, Bytes::new()));
                if let Some((_idx, messages)) = submitted {
                    let lookup = member_lookup(group);
                    route(&mut self.registry, &lookup, identity, messages);
                }
            }
            self.apply_and_wake(identity);
        }
    }

    /// Drains newly committed entries for `identity`, invoking the state-machine callback for
    /// each `Normal` entry (membership entries are already applied inside `apply_committed`),
    /// then wakes the Commit Rendezvous — in that order, per the invariant that a submitter only
    /// observes a commit after its apply has run (spec §5, §4.9).
    fn apply_and_wake(&mut self, identity: GroupIdentity) {
        let old_commit_idx = match self.multi.get_mut(&identity) {
            Some(group) => group.last_committed_log_index(),
            None => return,
        };

        let normal_entries = match self.multi.get_mut(&identity) {
            Some(group) => group.apply_committed(),
            None => return,
        };
        for entry in normal_entries {
            (self.apply)(identity, entry.id, entry.data);
        }

        let new_commit_idx = match self.multi.get_mut(&identity) {
            Some(group) => group.last_committed_log_index(),
            None => return,
        };
        if new_commit_idx > old_commit_idx {
            self.rendezvous
                .wake_range(identity, old_commit_idx.id + 1, new_commit_idx.id);
        }
    }

    fn reply(&mut self, to: PeerAddr, identity: GroupIdentity, to_node_id: NodeId, body: Body) {
        let local_node_id = self
            .multi
            .get_mut(&identity)
            .map(|group| group.local_node_id())
            .unwrap_or(to_node_id);
        let envelope = Envelope {
            node_id: local_node_id,
            identity,
            body,
        };
        let conn = self.registry.find_or_create(to);
        conn.send(&envelope.encode());
    }
}

/// A snapshot of a group's routing-relevant membership, decoupled from the borrow of `Multi` so
/// [`route`] can run while the caller still holds a separate mutable borrow elsewhere.
struct MemberLookup {
    local_node_id: NodeId,
    members: Vec<(NodeId, MemberInfo)>,
}

/// Unwraps a fallible Raft Group operation, aborting the process on a durability error (spec §7:
/// durability errors are fatal to the group, recovered only by restart).
fn durable_or_abort<T, E: std::fmt::Display>(
    identity: GroupIdentity,
    result: Result<T, journal::JournalError<E>>,
) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            log::error!("fatal durability error in group {}: {}", identity, err);
            std::process::abort();
        }
    }
}

/// Unwraps a fallible entry submission, treating [`raft::node::AppendError::Cancelled`] as "not
/// leader, skip" and aborting the process on a durability error, same as [`durable_or_abort`].
fn append_or_abort<T, E: std::fmt::Display>(
    identity: GroupIdentity,
    result: Result<T, raft::node::AppendError<journal::JournalError<E>>>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(raft::node::AppendError::Cancelled { .. }) => None,
        Err(raft::node::AppendError::LogErr(err)) => {
            log::error!("fatal durability error in group {}: {}", identity, err);
            std::process::abort();
        }
    }
}

fn member_lookup<B: JournalBackend>(group: &RaftGroup<B, ChaChaRng>) -> MemberLookup {
    MemberLookup {
        local_node_id: group.local_node_id(),
        members: group.members().map(|(id, info)| (*id, *info)).collect(),
    }
}

fn route(registry: &mut Registry, lookup: &MemberLookup, identity: GroupIdentity, messages: Vec<SendableMessage<NodeId>>) {
    for sendable in messages {
        let body = to_wire_body(&sendable.message);
        let targets: Vec<NodeId> = match sendable.dest {
            MessageDestination::Broadcast => lookup
                .members
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| *id != lookup.local_node_id)
                .collect(),
            MessageDestination::To(node_id) => vec![node_id],
        };
        for node_id in targets {
            let info = match lookup.members.iter().find(|(id, _)| *id == node_id) {
                Some((_, info)) => *info,
                None => continue,
            };
            let envelope = Envelope {
                node_id: lookup.local_node_id,
                identity,
                body: body.clone(),
            };
            let conn = registry.find_or_create(PeerAddr::new(info.host, info.raft_port));
            conn.send(&envelope.encode());
        }
    }
}

fn to_wire_body(message: &Message) -> Body {
    match &message.rpc {
        Some(Rpc::VoteRequest(req)) => Body::RequestVote {
            term: message.term,
            last_log_idx: req.last_log_idx,
            last_log_term: req.last_log_term,
        },
        Some(Rpc::VoteResponse(resp)) => Body::RequestVoteResponse {
            term: message.term,
            vote_granted: resp.vote_granted,
        },
        Some(Rpc::AppendRequest(req)) => Body::AppendEntries {
            term: message.term,
            prev_log_idx: req.prev_log_idx,
            prev_log_term: req.prev_log_term,
            leader_commit: req.leader_commit,
            entries: req.entries.clone(),
        },
        Some(Rpc::AppendResponse(resp)) => Body::AppendEntriesResponse {
            term: message.term,
            success: resp.success,
            match_idx: resp.match_idx,
            last_log_idx: resp.last_log_idx,
        },
        None => Body::LeaveResponse, // Message::rpc is never None on an outbound path in practice.
    }
}

fn to_raft_message(body: Body) -> Option<Message> {
    match body {
        Body::RequestVote {
            term,
            last_log_idx,
            last_log_term,
        } => Some(Message {
            term,
            rpc: Some(Rpc::VoteRequest(VoteRequest {
                last_log_idx,
                last_log_term,
            })),
        }),
        Body::RequestVoteResponse { term, vote_granted } => Some(Message {
            term,
            rpc: Some(Rpc::VoteResponse(VoteResponse { vote_granted })),
        }),
        Body::AppendEntries {
            term,
            prev_log_idx,
            prev_log_term,
            leader_commit,
            entries,
        } => Some(Message {
            term,
            rpc: Some(Rpc::AppendRequest(AppendRequest {
                prev_log_idx,
                prev_log_term,
                leader_commit,
                entries,
            })),
        }),
        Body::AppendEntriesResponse {
            term,
            success,
            match_idx,
            last_log_idx,
        } => Some(Message {
            term,
            rpc: Some(Rpc::AppendResponse(AppendResponse {
                success,
                match_idx,
                last_log_idx,
            })),
        }),
        _ => None,
    }
}

/// A small deterministic hash of (identity, node_id) used to seed each group's independent RNG.
/// Not cryptographic; Raft only needs peers' election timeouts to be decorrelated.
fn seed_for(identity: GroupIdentity, node_id: NodeId) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in identity.0.iter().chain(node_id.to_le_bytes().iter()) {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
