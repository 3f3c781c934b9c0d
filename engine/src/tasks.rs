//! Task Queue (spec §4.8): the single-threaded ingress foreign threads use to reach the loop
//! thread. Matches the dependency every other crate in this workspace already leans on:
//! `crossbeam-channel`.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use raft::message::EntryKind;

use crate::group::GroupConfig;
use crate::rendezvous::WakeHandle;
use crate::wire::GroupIdentity;

/// A unit of work a foreign thread wants the loop thread to perform.
pub enum Task {
    /// Registers a new group. If it has exactly one configured node, the loop immediately
    /// transitions it to Leader (spec §4.8); otherwise connections to its peers are opened.
    AddGroup(GroupConfig),
    /// Deregisters a group.
    RemoveGroup(GroupIdentity),
    /// Submits an entry to a group's leader.
    SubmitEntry {
        identity: GroupIdentity,
        kind: EntryKind,
        id: u32,
        data: Bytes,
        result: Sender<SubmitResult>,
    },
}

/// What [`Task::SubmitEntry`] reports back: either the wake handle to block on, or an immediate
/// failure that never reaches the rendezvous (spec §7 "Submission errors").
pub enum SubmitResult {
    Pending(WakeHandle),
    NotLeader,
    UnknownGroup,
}

/// The loop-thread side of the task queue.
pub struct TaskQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Returns a `Sender` foreign threads use to enqueue tasks.
    pub fn sender(&self) -> Sender<Task> {
        self.sender.clone()
    }

    /// Drains every task currently queued without blocking, for the loop thread to process
    /// between I/O events.
    pub fn drain(&self) -> Vec<Task> {
        self.receiver.try_iter().collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
