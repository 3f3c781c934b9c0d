//! The peer-to-peer wire message (spec §4.7): one frame payload decodes to one [`Envelope`].
//!
//! Per Design Notes §9 this is a tagged variant decoded from a type byte, never the C source's
//! fixed-size union with padding: each variant's encoding is exactly as long as it needs to be.

use std::convert::TryInto;
use std::net::Ipv4Addr;

use bytes::Bytes;
use raft::message::{EntryKind, LogEntry, LogIndex, TermId};

use crate::error::WireError;

/// Size in bytes of a [`GroupIdentity`].
pub const GROUP_IDENTITY_LEN: usize = 64;

/// Size in bytes of a NUL-padded ASCII IPv4 host field.
pub const HOST_FIELD_LEN: usize = 16;

/// Fixed-width opaque identifier distinguishing concurrent Raft groups sharing one endpoint.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct GroupIdentity(pub [u8; GROUP_IDENTITY_LEN]);

impl GroupIdentity {
    /// Builds a `GroupIdentity` by NUL-padding (or truncating) `name` to
    /// [`GROUP_IDENTITY_LEN`] bytes.
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; GROUP_IDENTITY_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(GROUP_IDENTITY_LEN);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }
}

impl std::fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl std::fmt::Debug for GroupIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupIdentity({})", self)
    }
}

fn encode_host(host: Ipv4Addr) -> [u8; HOST_FIELD_LEN] {
    let mut buf = [0u8; HOST_FIELD_LEN];
    let text = host.to_string();
    let bytes = text.as_bytes();
    let len = bytes.len().min(HOST_FIELD_LEN);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn decode_host(buf: &[u8]) -> Result<Ipv4Addr, WireError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::Truncated)
}

/// The message type tag occupying the first byte of every wire envelope.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    HandshakeResponse = 2,
    Leave = 3,
    LeaveResponse = 4,
    RequestVote = 5,
    RequestVoteResponse = 6,
    AppendEntries = 7,
    AppendEntriesResponse = 8,
}

impl MessageType {
    fn from_u8(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            1 => MessageType::Handshake,
            2 => MessageType::HandshakeResponse,
            3 => MessageType::Leave,
            4 => MessageType::LeaveResponse,
            5 => MessageType::RequestVote,
            6 => MessageType::RequestVoteResponse,
            7 => MessageType::AppendEntries,
            8 => MessageType::AppendEntriesResponse,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

/// The body of an [`Envelope`], tagged by [`MessageType`].
#[derive(Clone, PartialEq, Debug)]
pub enum Body {
    /// Sent by a node on every newly established connection, identifying itself.
    Handshake { raft_port: u16 },
    /// Reply to [`Body::Handshake`]. If `success` is false and this node knows the current
    /// leader, `leader` names it so the sender can redirect.
    HandshakeResponse {
        success: bool,
        leader: Option<(Ipv4Addr, u16)>,
    },
    /// Asks the leader to remove the sender from the group.
    Leave,
    /// Reply to [`Body::Leave`]; receiving it tells the leaving node to shut down.
    LeaveResponse,
    RequestVote {
        term: TermId,
        last_log_idx: LogIndex,
        last_log_term: TermId,
    },
    RequestVoteResponse { term: TermId, vote_granted: bool },
    AppendEntries {
        term: TermId,
        prev_log_idx: LogIndex,
        prev_log_term: TermId,
        leader_commit: LogIndex,
        entries: Vec<LogEntry>,
    },
    AppendEntriesResponse {
        term: TermId,
        success: bool,
        match_idx: LogIndex,
        last_log_idx: LogIndex,
    },
}

impl Body {
    fn message_type(&self) -> MessageType {
        match self {
            Body::Handshake { .. } => MessageType::Handshake,
            Body::HandshakeResponse { .. } => MessageType::HandshakeResponse,
            Body::Leave => MessageType::Leave,
            Body::LeaveResponse => MessageType::LeaveResponse,
            Body::RequestVote { .. } => MessageType::RequestVote,
            Body::RequestVoteResponse { .. } => MessageType::RequestVoteResponse,
            Body::AppendEntries { .. } => MessageType::AppendEntries,
            Body::AppendEntriesResponse { .. } => MessageType::AppendEntriesResponse,
        }
    }
}

/// One decoded frame payload: sender, target group, and message body (spec §4.7).
#[derive(Clone, PartialEq, Debug)]
pub struct Envelope {
    pub node_id: u32,
    pub identity: GroupIdentity,
    pub body: Body,
}

impl Envelope {
    /// Encodes this envelope as a single frame payload (not including the framer's length
    /// prefix; see [`crate::framer::encode_frame`]).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.body.message_type() as u8);
        buf.extend_from_slice(&self.node_id.to_le_bytes());
        buf.extend_from_slice(&self.identity.0);
        encode_body(&self.body, &mut buf);
        buf
    }

    /// Decodes an envelope from one complete frame payload.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(buf);
        let tag = MessageType::from_u8(cursor.take_u8()?)?;
        let node_id = cursor.take_u32()?;
        let identity = GroupIdentity(cursor.take_array::<GROUP_IDENTITY_LEN>()?);
        let body = decode_body(tag, &mut cursor)?;
        Ok(Envelope {
            node_id,
            identity,
            body,
        })
    }
}

fn encode_body(body: &Body, buf: &mut Vec<u8>) {
    match body {
        Body::Handshake { raft_port } => {
            buf.extend_from_slice(&u32::from(*raft_port).to_le_bytes());
        }
        Body::HandshakeResponse { success, leader } => {
            buf.push(*success as u8);
            let (host, port) = leader.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
            buf.extend_from_slice(&encode_host(host));
            buf.extend_from_slice(&u32::from(port).to_le_bytes());
        }
        Body::Leave | Body::LeaveResponse => {}
        Body::RequestVote {
            term,
            last_log_idx,
            last_log_term,
        } => {
            buf.extend_from_slice(&term.id.to_le_bytes());
            buf.extend_from_slice(&last_log_idx.id.to_le_bytes());
            buf.extend_from_slice(&last_log_term.id.to_le_bytes());
        }
        Body::RequestVoteResponse { term, vote_granted } => {
            buf.extend_from_slice(&term.id.to_le_bytes());
            buf.push(*vote_granted as u8);
        }
        Body::AppendEntries {
            term,
            prev_log_idx,
            prev_log_term,
            leader_commit,
            entries,
        } => {
            buf.extend_from_slice(&term.id.to_le_bytes());
            buf.extend_from_slice(&prev_log_idx.id.to_le_bytes());
            buf.extend_from_slice(&prev_log_term.id.to_le_bytes());
            buf.extend_from_slice(&leader_commit.id.to_le_bytes());
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for entry in entries {
                buf.extend_from_slice(&entry.term.id.to_le_bytes());
                buf.push(entry.kind as u8);
                buf.extend_from_slice(&entry.id.to_le_bytes());
                buf.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
                buf.extend_from_slice(&entry.data);
            }
        }
        Body::AppendEntriesResponse {
            term,
            success,
            match_idx,
            last_log_idx,
        } => {
            buf.extend_from_slice(&term.id.to_le_bytes());
            buf.push(*success as u8);
            buf.extend_from_slice(&match_idx.id.to_le_bytes());
            buf.extend_from_slice(&last_log_idx.id.to_le_bytes());
        }
    }
}

fn decode_body(tag: MessageType, cursor: &mut Cursor<'_>) -> Result<Body, WireError> {
    Ok(match tag {
        MessageType::Handshake => Body::Handshake {
            raft_port: take_port(cursor)?,
        },
        MessageType::HandshakeResponse => {
            let success = cursor.take_u8()? != 0;
            let host_bytes = cursor.take_array::<HOST_FIELD_LEN>()?;
            let port = take_port(cursor)?;
            let leader = if success {
                None
            } else {
                let host = decode_host(&host_bytes)?;
                if host == Ipv4Addr::UNSPECIFIED && port == 0 {
                    None
                } else {
                    Some((host, port))
                }
            };
            Body::HandshakeResponse { success, leader }
        }
        MessageType::Leave => Body::Leave,
        MessageType::LeaveResponse => Body::LeaveResponse,
        MessageType::RequestVote => Body::RequestVote {
            term: TermId { id: cursor.take_u64()? },
            last_log_idx: LogIndex { id: cursor.take_u64()? },
            last_log_term: TermId { id: cursor.take_u64()? },
        },
        MessageType::RequestVoteResponse => Body::RequestVoteResponse {
            term: TermId { id: cursor.take_u64()? },
            vote_granted: cursor.take_u8()? != 0,
        },
        MessageType::AppendEntries => {
            let term = TermId { id: cursor.take_u64()? };
            let prev_log_idx = LogIndex { id: cursor.take_u64()? };
            let prev_log_term = TermId { id: cursor.take_u64()? };
            let leader_commit = LogIndex { id: cursor.take_u64()? };
            let n_entries = cursor.take_u32()?;
            let mut entries = Vec::with_capacity(n_entries as usize);
            for _ in 0..n_entries {
                let entry_term = TermId { id: cursor.take_u64()? };
                let kind = decode_entry_kind(cursor.take_u8()?)?;
                let id = cursor.take_u32()?;
                let data_len = cursor.take_u32()? as usize;
                let data = Bytes::copy_from_slice(cursor.take_slice(data_len)?);
                entries.push(LogEntry {
                    term: entry_term,
                    kind,
                    id,
                    data,
                });
            }
            Body::AppendEntries {
                term,
                prev_log_idx,
                prev_log_term,
                leader_commit,
                entries,
            }
        }
        MessageType::AppendEntriesResponse => Body::AppendEntriesResponse {
            term: TermId { id: cursor.take_u64()? },
            success: cursor.take_u8()? != 0,
            match_idx: LogIndex { id: cursor.take_u64()? },
            last_log_idx: LogIndex { id: cursor.take_u64()? },
        },
    })
}

/// Reads a port field: 4 bytes on the wire (spec §6, "ports are 32-bit integers"), truncated
/// back to the 16-bit TCP port range the application layer actually uses.
fn take_port(cursor: &mut Cursor<'_>) -> Result<u16, WireError> {
    let wide = cursor.take_u32()?;
    wide.try_into().map_err(|_| WireError::InvalidPort(wide))
}

fn decode_entry_kind(tag: u8) -> Result<EntryKind, WireError> {
    Ok(match tag {
        0 => EntryKind::Normal,
        1 => EntryKind::AddNonvoting,
        2 => EntryKind::AddVoter,
        3 => EntryKind::RemoveNode,
        _ => return Err(WireError::Truncated),
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        self.take_slice(N)?.try_into().map_err(|_| WireError::Truncated)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take_slice(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?))
    }

    fn take_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array::<8>()?))
    }
}
