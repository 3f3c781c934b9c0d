//! Commit Rendezvous (spec §4.9): lets a submitter thread block until its entry's log index
//! commits, without ever touching Raft state directly.
//!
//! Grounded on the channel-per-waiter primitive Design Notes §9 recommends in place of the
//! source's fd-based wait tree, built from the same `crossbeam-channel` the rest of the workspace
//! already depends on. `mpb` is reserved for the one broadcast case (process shutdown, §4.7
//! LEAVE_RESPONSE) rather than used here, where point-to-point one-shot channels are the better
//! fit for a keyed wait per (group, index).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::wire::GroupIdentity;

/// The outcome a waiting submitter observes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitOutcome {
    /// The entry committed at its assigned index.
    Committed,
    /// The process is shutting down; the entry's fate is unknown to the caller.
    ShuttingDown,
}

/// A handle a submitter thread uses to wait for its entry to commit.
pub struct WakeHandle {
    receiver: Receiver<CommitOutcome>,
}

impl WakeHandle {
    /// Blocks until [`Rendezvous::wake`] fires for this handle's key or `timeout` elapses.
    /// `None` means wait indefinitely (spec §5: "negative = infinite").
    pub fn wait(&self, timeout: Option<Duration>) -> Option<CommitOutcome> {
        match timeout {
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(outcome) => Some(outcome),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => self.receiver.recv().ok(),
        }
    }
}

type Key = (GroupIdentity, u64);

/// A keyed multi-waiter structure over (group identity, log index).
#[derive(Default)]
pub struct Rendezvous {
    waiters: Mutex<HashMap<Key, Vec<Sender<CommitOutcome>>>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a suspension slot for `(identity, index)`, returning the handle the submitter
    /// thread blocks on.
    pub fn register(&self, identity: GroupIdentity, index: u64) -> WakeHandle {
        let (tx, rx) = bounded(1);
        self.waiters
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .entry((identity, index))
            .or_insert_with(Vec::new)
            .push(tx);
        WakeHandle { receiver: rx }
    }

    /// Fires every waiter registered at `(identity, index)`; a no-op if none are registered
    /// (spec §4.9: "spurious wakes for unregistered indices are no-ops").
    pub fn wake(&self, identity: GroupIdentity, index: u64) {
        self.wake_with((identity, index), CommitOutcome::Committed);
    }

    /// Wakes every waiter for every index up to and including `new_commit_idx` for `identity`,
    /// starting at `first_idx` (spec §4.7: response handling "wake Commit Rendezvous for all
    /// indices in [response.first_idx, new commit_idx]").
    pub fn wake_range(&self, identity: GroupIdentity, first_idx: u64, new_commit_idx: u64) {
        for index in first_idx..=new_commit_idx {
            self.wake(identity, index);
        }
    }

    /// Wakes every registered waiter with [`CommitOutcome::ShuttingDown`], used on process
    /// shutdown so no submitter blocks forever.
    pub fn wake_all_shutting_down(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|poison| poison.into_inner());
        for (_, senders) in waiters.drain() {
            for sender in senders {
                let _ = sender.send(CommitOutcome::ShuttingDown);
            }
        }
    }

    fn wake_with(&self, key: Key, outcome: CommitOutcome) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(senders) = waiters.remove(&key) {
            for sender in senders {
                let _ = sender.send(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_delivers_to_a_registered_waiter() {
        let rendezvous = Rendezvous::new();
        let identity = GroupIdentity::new("g1");
        let handle = rendezvous.register(identity, 3);
        rendezvous.wake(identity, 3);
        assert_eq!(
            handle.wait(Some(Duration::from_secs(1))),
            Some(CommitOutcome::Committed)
        );
    }

    #[test]
    fn wake_for_unregistered_index_is_a_no_op() {
        let rendezvous = Rendezvous::new();
        rendezvous.wake(GroupIdentity::new("g1"), 99);
    }

    #[test]
    fn wait_times_out_without_a_wake() {
        let rendezvous = Rendezvous::new();
        let handle = rendezvous.register(GroupIdentity::new("g1"), 1);
        assert_eq!(handle.wait(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn wake_range_covers_every_pending_index() {
        let rendezvous = Rendezvous::new();
        let identity = GroupIdentity::new("g1");
        let handles: Vec<_> = (1..=3).map(|idx| rendezvous.register(identity, idx)).collect();
        rendezvous.wake_range(identity, 1, 3);
        for handle in handles {
            assert_eq!(handle.wait(Some(Duration::from_secs(1))), Some(CommitOutcome::Committed));
        }
    }

    #[test]
    fn shutdown_wakes_every_pending_waiter() {
        let rendezvous = Rendezvous::new();
        let handle = rendezvous.register(GroupIdentity::new("g1"), 5);
        rendezvous.wake_all_shutting_down();
        assert_eq!(
            handle.wait(Some(Duration::from_secs(1))),
            Some(CommitOutcome::ShuttingDown)
        );
    }
}
