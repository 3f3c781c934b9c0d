//! Hand-rolled error types for the engine crate, matching the rest of the workspace's avoidance
//! of `thiserror`/`anyhow`.

use std::fmt;

/// An error decoding a framed byte stream into message payloads.
#[derive(Debug)]
pub enum FramerError {
    /// The declared frame length was smaller than the length prefix itself, or larger than the
    /// configured maximum. Fatal to the connection.
    MalformedLength(u64),
}

impl fmt::Display for FramerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramerError::MalformedLength(len) => {
                write!(f, "malformed frame length {}", len)
            }
        }
    }
}

impl std::error::Error for FramerError {}

/// An error decoding a wire envelope from a framed payload.
#[derive(Debug)]
pub enum WireError {
    /// The payload ended before a fixed-size field could be read.
    Truncated,
    /// The type byte did not name a known message type.
    UnknownMessageType(u8),
    /// A 32-bit wire port field carried a value outside the 16-bit TCP port range.
    InvalidPort(u32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "wire payload truncated"),
            WireError::UnknownMessageType(ty) => write!(f, "unknown message type byte {}", ty),
            WireError::InvalidPort(port) => write!(f, "port {} out of 16-bit range", port),
        }
    }
}

impl std::error::Error for WireError {}

/// An error submitting an entry to a Raft group.
#[derive(Debug)]
pub enum SubmitError {
    /// This node is not the leader of the group. The submitter should redirect.
    NotLeader,
    /// No group is registered under the given identity.
    UnknownGroup,
    /// The wait for commit timed out. The entry may still commit; the outcome is uncertain.
    Timeout,
    /// The engine is shutting down.
    ShuttingDown,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::NotLeader => write!(f, "not leader"),
            SubmitError::UnknownGroup => write!(f, "unknown group"),
            SubmitError::Timeout => write!(f, "submission timed out"),
            SubmitError::ShuttingDown => write!(f, "engine is shutting down"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// An error fatal to one Raft group: its durable invariants can no longer be guaranteed.
///
/// Per the durability error policy, this is not recovered; the host process is expected to abort
/// and restart, relying on the journal's recovery path.
#[derive(Debug)]
pub struct DurabilityError(pub String);

impl fmt::Display for DurabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal durability error: {}", self.0)
    }
}

impl std::error::Error for DurabilityError {}
