//! Raft Group (spec §4.4): one independent consensus instance, wrapping the sans-io `raft` crate
//! with the capabilities the spec names — durability, membership, and promotion — that the
//! teacher's simpler `raft` crate has no notion of at all.
//!
//! Durability ordering (spec §4.3/§7) is enforced here: after every call into the wrapped
//! [`Node`], this type compares the current term/vote against what was last persisted and writes
//! through to the journal before returning any message for the caller to send. Log entry
//! durability is separately inherent in [`JournalLog`] being the node's `Log` implementation.

use std::collections::{BTreeSet, HashMap};
use std::convert::TryInto;
use std::net::Ipv4Addr;

use bytes::Bytes;
use rand_core::RngCore;

use raft::log::Log;
use raft::message::{EntryKind, LogEntry, LogIndex, Message, SendableMessage, TermId};
use raft::node::{AppendError, Config as RaftConfig, Node};

use journal::log::JournalLog;
use journal::{JournalBackend, JournalError};

use crate::wire::GroupIdentity;

/// Node identifiers are the `u32` the wire protocol carries (spec §4.7).
pub type NodeId = u32;

/// A group member's network location and voting status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemberInfo {
    pub host: Ipv4Addr,
    pub raft_port: u16,
    pub voting: bool,
}

/// Configuration needed to construct one [`RaftGroup`].
pub struct GroupConfig {
    pub identity: GroupIdentity,
    pub local_node_id: NodeId,
    pub members: Vec<(NodeId, MemberInfo)>,
    /// Once a non-voting member's match index is within this many entries of the log tail, the
    /// leader promotes it with an `AddVoter` entry (spec §9, "Promotion on catch-up").
    pub promotion_lag: u64,
    pub raft: RaftConfig,
}

/// One independent Raft consensus instance and its membership table.
pub struct RaftGroup<B: JournalBackend, R: RngCore> {
    identity: GroupIdentity,
    node: Node<JournalLog<B>, R, NodeId>,
    members: HashMap<NodeId, MemberInfo>,
    promotion_lag: u64,
    persisted_term: TermId,
    persisted_vote: Option<NodeId>,
}

impl<B: JournalBackend, R: RngCore> RaftGroup<B, R> {
    /// Constructs a group, recovering durable term/vote/log state from `backend` if present.
    pub fn new(config: GroupConfig, backend: B, random: R) -> Self {
        let log = JournalLog::recover(backend);
        let persisted_term = log.recover_term();
        let persisted_vote = log.recover_voted_for().map(|id| id as NodeId);

        let peers: BTreeSet<NodeId> = config
            .members
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| *id != config.local_node_id)
            .collect();

        let mut node = Node::new(config.local_node_id, peers, log, random, config.raft);
        node.recover_persisted_state(persisted_term, persisted_vote);

        Self {
            identity: config.identity,
            node,
            members: config.members.into_iter().collect(),
            promotion_lag: config.promotion_lag,
            persisted_term,
            persisted_vote,
        }
    }

    /// This group's identity.
    pub fn identity(&self) -> GroupIdentity {
        self.identity
    }

    pub fn local_node_id(&self) -> NodeId {
        *self.node.node_id()
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.node.leader().0.copied()
    }

    pub fn last_committed_log_index(&self) -> LogIndex {
        self.node.last_committed_log_index()
    }

    pub fn member(&self, node_id: NodeId) -> Option<&MemberInfo> {
        self.members.get(&node_id)
    }

    pub fn members(&self) -> impl Iterator<Item = (&NodeId, &MemberInfo)> {
        self.members.iter()
    }

    /// Drives the election/heartbeat timers forward by one tick (spec §4.6).
    #[must_use = "messages returned here must be sent"]
    pub fn timer_tick(&mut self) -> Result<Vec<SendableMessage<NodeId>>, JournalError<B::Error>> {
        let messages: Vec<_> = self.node.timer_tick().collect();
        self.persist_transition()?;
        Ok(messages)
    }

    /// Delivers a Raft RPC received from `from` (spec §4.7 REQUESTVOTE/APPENDENTRIES routing).
    #[must_use = "messages returned here must be sent"]
    pub fn receive(
        &mut self,
        message: Message,
        from: NodeId,
    ) -> Result<Vec<SendableMessage<NodeId>>, JournalError<B::Error>> {
        let messages: Vec<_> = self.node.receive(message, from).collect();
        self.persist_transition()?;
        Ok(messages)
    }

    /// Submits an entry for replication (spec §4.4 `recv_entry`). Fails with
    /// [`AppendError::Cancelled`] if this node is not (or stops being) the leader.
    #[must_use = "messages returned here must be sent"]
    pub fn submit(
        &mut self,
        kind: EntryKind,
        id: u32,
        data: Bytes,
    ) -> Result<(LogIndex, Vec<SendableMessage<NodeId>>), AppendError<JournalError<B::Error>>> {
        let (idx, messages) = self.node.append_entry(kind, id, data)?;
        let messages: Vec<_> = messages.collect();
        self.persist_transition().map_err(AppendError::LogErr)?;
        Ok((idx, messages))
    }

    /// Submits an `AddNonvoting` entry for a newly handshaking peer (spec §4.7 HANDSHAKE,
    /// supplemented feature "Handshake-driven automatic peer discovery").
    #[must_use = "messages returned here must be sent"]
    pub fn add_nonvoting(
        &mut self,
        node_id: NodeId,
        info: MemberInfo,
    ) -> Result<(LogIndex, Vec<SendableMessage<NodeId>>), AppendError<JournalError<B::Error>>> {
        let payload = encode_config_change(node_id, &info);
        self.submit(EntryKind::AddNonvoting, node_id, payload)
    }

    /// Submits a `RemoveNode` entry (spec §4.7 LEAVE handling).
    #[must_use = "messages returned here must be sent"]
    pub fn remove_node(
        &mut self,
        node_id: NodeId,
    ) -> Result<(LogIndex, Vec<SendableMessage<NodeId>>), AppendError<JournalError<B::Error>>> {
        let info = self.members.get(&node_id).copied().unwrap_or(MemberInfo {
            host: Ipv4Addr::UNSPECIFIED,
            raft_port: 0,
            voting: false,
        });
        let payload = encode_config_change(node_id, &info);
        self.submit(EntryKind::RemoveNode, node_id, payload)
    }

    /// Drains newly committed entries, applying membership changes internally and returning only
    /// the `Normal` entries meant for the host's state machine (spec §4.4 apply loop).
    pub fn apply_committed(&mut self) -> Vec<LogEntry> {
        let committed: Vec<_> = self.node.take_committed().collect();
        let mut normal = Vec::with_capacity(committed.len());
        for entry in committed {
            match entry.kind {
                EntryKind::Normal => normal.push(entry),
                EntryKind::AddNonvoting | EntryKind::AddVoter | EntryKind::RemoveNode => {
                    self.apply_membership_change(&entry)
                }
            }
        }
        normal
    }

    /// Returns the non-voting member, if any, whose replication has caught up within
    /// [`promotion_lag`](GroupConfig::promotion_lag) entries of the log tail and should be
    /// promoted to voting status via [`submit`](Self::submit) with [`EntryKind::AddVoter`].
    pub fn member_ready_for_promotion(&self) -> Option<(NodeId, MemberInfo)> {
        if !self.is_leader() {
            return None;
        }
        let last_index = self.node.log().last_index();
        self.members.iter().find_map(|(&id, info)| {
            if info.voting {
                return None;
            }
            let repl = self.node.replication_state(&id)?;
            if last_index.id.saturating_sub(repl.match_idx.id) <= self.promotion_lag {
                Some((id, *info))
            } else {
                None
            }
        })
    }

    fn apply_membership_change(&mut self, entry: &LogEntry) {
        let (node_id, info) = match decode_config_change(&entry.data) {
            Some(decoded) => decoded,
            None => {
                log::warn!("dropping malformed config-change entry in group {}", self.identity);
                return;
            }
        };
        match entry.kind {
            EntryKind::AddNonvoting => {
                self.members.insert(node_id, MemberInfo { voting: false, ..info });
                self.node.add_nonvoting_peer(node_id);
            }
            EntryKind::AddVoter => {
                self.members
                    .entry(node_id)
                    .and_modify(|existing| existing.voting = true)
                    .or_insert(MemberInfo { voting: true, ..info });
                self.node.promote_peer(node_id);
            }
            EntryKind::RemoveNode => {
                self.members.remove(&node_id);
                self.node.remove_peer(&node_id);
            }
            EntryKind::Normal => unreachable!("apply_membership_change only sees config changes"),
        }
    }

    fn persist_transition(&mut self) -> Result<(), JournalError<B::Error>> {
        let current_term = self.node.current_term();
        let voted_for = self.node.voted_for().copied();
        if current_term != self.persisted_term {
            self.node.log_mut().persist_term(current_term)?;
            self.persisted_term = current_term;
        }
        if voted_for != self.persisted_vote {
            self.node
                .log_mut()
                .persist_vote(voted_for.map(|id| id as u64))?;
            self.persisted_vote = voted_for;
        }
        Ok(())
    }
}

/// Encodes the {raft_port, node_id, host} config-change payload (spec §3 "Config-Change
/// Payload"; `http_port` is an application-layer concern the core has no notion of and is left
/// to the host to fold into the payload bytes it submits, if needed).
fn encode_config_change(node_id: NodeId, info: &MemberInfo) -> Bytes {
    let mut buf = Vec::with_capacity(4 + 2 + 4);
    buf.extend_from_slice(&node_id.to_le_bytes());
    buf.extend_from_slice(&info.raft_port.to_le_bytes());
    buf.extend_from_slice(&u32::from(info.host).to_le_bytes());
    Bytes::from(buf)
}

fn decode_config_change(data: &[u8]) -> Option<(NodeId, MemberInfo)> {
    if data.len() < 10 {
        return None;
    }
    let node_id = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let raft_port = u16::from_le_bytes(data[4..6].try_into().ok()?);
    let host = Ipv4Addr::from(u32::from_le_bytes(data[6..10].try_into().ok()?));
    Some((
        node_id,
        MemberInfo {
            host,
            raft_port,
            voting: false,
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;

    use journal::memory::MemoryBackend;

    use super::*;

    fn raft_config() -> RaftConfig {
        RaftConfig {
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 1,
            replication_chunk_size: usize::max_value(),
        }
    }

    fn single_node_group() -> RaftGroup<MemoryBackend, ChaChaRng> {
        let config = GroupConfig {
            identity: GroupIdentity::new("g1"),
            local_node_id: 1,
            members: vec![(
                1,
                MemberInfo {
                    host: Ipv4Addr::LOCALHOST,
                    raft_port: 7001,
                    voting: true,
                },
            )],
            promotion_lag: 2,
            raft: raft_config(),
        };
        RaftGroup::new(config, MemoryBackend::new(), ChaChaRng::seed_from_u64(1))
    }

    #[test]
    fn single_node_cluster_elects_itself_leader() {
        let mut group = single_node_group();
        for _ in 0..raft_config().election_timeout_ticks + 1 {
            group.timer_tick().unwrap();
        }
        assert!(group.is_leader());
    }

    #[test]
    fn submitted_entry_commits_and_applies_on_single_node() {
        let mut group = single_node_group();
        for _ in 0..raft_config().election_timeout_ticks + 1 {
            group.timer_tick().unwrap();
        }
        assert!(group.is_leader());

        let (idx, _messages) = group
            .submit(EntryKind::Normal, 0, Bytes::from_static(b"hello"))
            .unwrap_or_else(|_| panic!("leader should accept submission"));
        assert_eq!(idx, LogIndex { id: 1 });

        let applied = group.apply_committed();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].data.as_ref(), b"hello");
    }

    #[test]
    fn config_change_payload_round_trips() {
        let info = MemberInfo {
            host: Ipv4Addr::new(10, 0, 0, 5),
            raft_port: 7005,
            voting: false,
        };
        let encoded = encode_config_change(9, &info);
        let (node_id, decoded) = decode_config_change(&encoded).unwrap();
        assert_eq!(node_id, 9);
        assert_eq!(decoded.host, info.host);
        assert_eq!(decoded.raft_port, info.raft_port);
    }
}
