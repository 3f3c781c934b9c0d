//! Configuration value types the host fills in at construction (Design Notes §9: replace the
//! source's global callback-table singleton with an explicit configuration value).
//!
//! Process-level CLI/env parsing remains out of scope (spec §1); this module is the in-process
//! value types a host's own config loader produces.

use std::net::Ipv4Addr;
use std::time::Duration;

use raft::node::Config as RaftConfig;

use crate::group::MemberInfo;
use crate::wire::GroupIdentity;

/// One node in a group's static membership list at construction time (spec §3 Node Descriptor).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeDescriptor {
    pub node_id: u32,
    pub host: Ipv4Addr,
    pub raft_port: u16,
}

impl From<NodeDescriptor> for (u32, MemberInfo) {
    fn from(descriptor: NodeDescriptor) -> Self {
        (
            descriptor.node_id,
            MemberInfo {
                host: descriptor.host,
                raft_port: descriptor.raft_port,
                voting: true,
            },
        )
    }
}

/// Parameters for one group to be added via [`crate::tasks::Task::AddGroup`].
#[derive(Clone)]
pub struct GroupSpec {
    pub identity: GroupIdentity,
    pub local_node_id: u32,
    pub nodes: Vec<NodeDescriptor>,
    pub promotion_lag: u64,
    pub election_timeout_ticks: u32,
    pub heartbeat_interval_ticks: u32,
    pub replication_chunk_size: usize,
}

impl GroupSpec {
    pub(crate) fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_ticks: self.election_timeout_ticks,
            heartbeat_interval_ticks: self.heartbeat_interval_ticks,
            replication_chunk_size: self.replication_chunk_size,
        }
    }
}

/// Top-level engine configuration (spec §6 `make(self_port)`).
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// The local Raft listener port.
    pub self_port: u16,
    /// How often [`crate::dispatcher::Engine::once`] drives the periodic tick (spec §4.6, "P ≈
    /// 100 ms").
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            self_port: 7000,
            tick_interval: Duration::from_millis(100),
        }
    }
}
