//! Group Registry (spec §4.5): group_identity → Raft Group, single-writer, no internal locking.

use std::collections::HashMap;

use rand_core::RngCore;

use journal::JournalBackend;

use crate::group::RaftGroup;
use crate::wire::GroupIdentity;

/// Owns every locally registered [`RaftGroup`], keyed by its identity.
///
/// Only ever touched from the loop thread (spec §4.5, §5): insertion happens draining the Task
/// Queue, lookup happens on every inbound message, iteration happens on every periodic tick.
#[derive(Default)]
pub struct Multi<B: JournalBackend, R: RngCore> {
    groups: HashMap<GroupIdentity, RaftGroup<B, R>>,
}

impl<B: JournalBackend, R: RngCore> Multi<B, R> {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Registers `group`, replacing anything previously registered under the same identity.
    pub fn insert(&mut self, group: RaftGroup<B, R>) {
        self.groups.insert(group.identity(), group);
    }

    pub fn remove(&mut self, identity: &GroupIdentity) -> Option<RaftGroup<B, R>> {
        self.groups.remove(identity)
    }

    pub fn get_mut(&mut self, identity: &GroupIdentity) -> Option<&mut RaftGroup<B, R>> {
        self.groups.get_mut(identity)
    }

    pub fn contains(&self, identity: &GroupIdentity) -> bool {
        self.groups.contains_key(identity)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&GroupIdentity, &mut RaftGroup<B, R>)> {
        self.groups.iter_mut()
    }
}
