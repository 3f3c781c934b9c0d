//! Transactional durability for Raft group state.
//!
//! A [`JournalBackend`] persists the three named scalars a Raft group must recover after a
//! crash ("term", "voted_for", "commit_idx") and the log entries backing replication, under
//! `begin`/`commit`/`abort` transactional semantics. [`Journal`] is a thin convenience wrapper
//! offering the persist/recover operations a Raft group actually needs; [`log::JournalLog`]
//! adapts a backend into a [`raft::log::Log`] implementation so that log durability falls out of
//! the already-synchronous `Log::append`/`Log::cancel_from` contract.
//!
//! The in-memory reference backend is [`memory::MemoryBackend`]. A host embedding this runtime
//! on top of a real on-disk store implements [`JournalBackend`] directly; nothing else in this
//! crate or in `engine` needs to change.

use core::fmt;

use raft::message::{LogEntry, LogIndex, TermId};

pub mod log;
pub mod memory;

/// Identifies the three durable named scalars a Raft group relies on for crash recovery.
pub const KEY_TERM: &str = "term";
pub const KEY_VOTED_FOR: &str = "voted_for";
pub const KEY_COMMIT_IDX: &str = "commit_idx";

/// A handle to an open transaction against a [`JournalBackend`].
pub type TxnId = u64;

/// Transactional persistence of Raft log entries and named durable scalars.
///
/// Every operation that observably changes durable state happens inside a transaction opened
/// with [`begin`](Self::begin) and closed with [`commit`](Self::commit) or
/// [`abort`](Self::abort). A backend must not make `set_state`/`append_entry`/`append_batch`
/// writes visible to `get_state`/`get_entry` until the owning transaction commits.
pub trait JournalBackend {
    /// The error type returned by fallible operations on this backend.
    type Error: fmt::Display + fmt::Debug;

    /// Opens a new transaction.
    fn begin(&mut self) -> Result<TxnId, Self::Error>;

    /// Makes every write staged under `txn` durable and visible.
    fn commit(&mut self, txn: TxnId) -> Result<(), Self::Error>;

    /// Discards every write staged under `txn`.
    fn abort(&mut self, txn: TxnId) -> Result<(), Self::Error>;

    /// Durably associates `key` with `value` once `txn` commits. Used for `"term"`,
    /// `"voted_for"` and `"commit_idx"`.
    fn set_state(&mut self, txn: TxnId, key: &str, value: u64) -> Result<(), Self::Error>;

    /// Returns the last committed value associated with `key`, if any.
    fn get_state(&self, key: &str) -> Option<u64>;

    /// Durably writes `entry` at `index` once `txn` commits.
    fn append_entry(&mut self, txn: TxnId, index: u64, entry: LogEntry) -> Result<(), Self::Error>;

    /// Durably writes consecutive `entries` starting at `start_index` once `txn` commits.
    fn append_batch(
        &mut self,
        txn: TxnId,
        start_index: u64,
        entries: Vec<LogEntry>,
    ) -> Result<(), Self::Error> {
        for (offset, entry) in entries.into_iter().enumerate() {
            self.append_entry(txn, start_index + offset as u64, entry)?;
        }
        Ok(())
    }

    /// Returns the committed entry at `index`, if any.
    fn get_entry(&self, index: u64) -> Option<LogEntry>;

    /// Hook for discarding the oldest durable log entry, reserved for future compaction. Inert
    /// in every backend shipped here.
    fn pop_head(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Hook for discarding the newest durable log entry, reserved for future leader-overwrite
    /// cleanup. Inert in every backend shipped here.
    fn pop_tail(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// An error durably persisting Raft state. Per the durability error policy, this is always fatal
/// to the owning Raft group: the acknowledged-entries-are-durable invariant cannot be broken, so
/// the caller should abort the process rather than continue operating the group.
#[derive(Debug)]
pub enum JournalError<E> {
    /// The backend reported an error committing or staging a write.
    Backend(E),
    /// A log operation referenced an index outside the log's current range.
    InvalidRange,
}

impl<E: fmt::Display> fmt::Display for JournalError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::Backend(err) => write!(f, "journal backend error: {}", err),
            JournalError::InvalidRange => write!(f, "log index out of range"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for JournalError<E> {}

/// Durable persistence for the term/vote/commit-index scalars of one Raft group.
pub struct Journal<B> {
    backend: B,
}

impl<B: JournalBackend> Journal<B> {
    /// Wraps `backend` in a `Journal`.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns a reference to the underlying backend, e.g. to feed [`log::JournalLog`] the same
    /// storage.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns a mutable reference to the underlying backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Persists `term` durably. Must return only after the write is durable; the caller must not
    /// emit any message derived from this term change until this returns `Ok`.
    pub fn persist_term(&mut self, term: TermId) -> Result<(), JournalError<B::Error>> {
        persist_scalar(&mut self.backend, KEY_TERM, term.id)
    }

    /// Persists `voted_for` durably, or clears it when `None`.
    pub fn persist_vote(&mut self, voted_for: Option<u64>) -> Result<(), JournalError<B::Error>> {
        // no_vote is represented as 0, since node ids are assigned starting from 1.
        persist_scalar(&mut self.backend, KEY_VOTED_FOR, voted_for.unwrap_or(0))
    }

    /// Persists `commit_idx`. May be called opportunistically; on crash, recovery re-derives
    /// `commit_idx` from the log and replays `apply` forward from the last persisted value.
    pub fn persist_commit_idx(&mut self, idx: LogIndex) -> Result<(), JournalError<B::Error>> {
        persist_scalar(&mut self.backend, KEY_COMMIT_IDX, idx.id)
    }

    /// Returns the durably recorded term, or the zero term if none was ever persisted.
    pub fn recover_term(&self) -> TermId {
        recover_term(&self.backend)
    }

    /// Returns the durably recorded vote, if any.
    pub fn recover_voted_for(&self) -> Option<u64> {
        recover_voted_for(&self.backend)
    }

    /// Returns the durably recorded commit index, or zero if none was ever persisted.
    pub fn recover_commit_idx(&self) -> LogIndex {
        recover_commit_idx(&self.backend)
    }
}

/// Shared with [`log::JournalLog`], which persists the same scalars through the backend it
/// already owns for log entries.
pub(crate) fn persist_scalar<B: JournalBackend>(
    backend: &mut B,
    key: &str,
    value: u64,
) -> Result<(), JournalError<B::Error>> {
    let txn = backend.begin().map_err(JournalError::Backend)?;
    backend
        .set_state(txn, key, value)
        .map_err(JournalError::Backend)?;
    backend.commit(txn).map_err(JournalError::Backend)
}

pub(crate) fn recover_term<B: JournalBackend>(backend: &B) -> TermId {
    TermId {
        id: backend.get_state(KEY_TERM).unwrap_or(0),
    }
}

pub(crate) fn recover_voted_for<B: JournalBackend>(backend: &B) -> Option<u64> {
    match backend.get_state(KEY_VOTED_FOR) {
        Some(0) | None => None,
        Some(node_id) => Some(node_id),
    }
}

pub(crate) fn recover_commit_idx<B: JournalBackend>(backend: &B) -> LogIndex {
    LogIndex {
        id: backend.get_state(KEY_COMMIT_IDX).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn persists_and_recovers_scalars() {
        let mut journal = Journal::new(MemoryBackend::new());
        assert_eq!(journal.recover_term(), TermId::default());
        assert_eq!(journal.recover_voted_for(), None);

        journal.persist_term(TermId { id: 4 }).unwrap();
        journal.persist_vote(Some(7)).unwrap();
        journal.persist_commit_idx(LogIndex { id: 2 }).unwrap();

        assert_eq!(journal.recover_term(), TermId { id: 4 });
        assert_eq!(journal.recover_voted_for(), Some(7));
        assert_eq!(journal.recover_commit_idx(), LogIndex { id: 2 });

        journal.persist_vote(None).unwrap();
        assert_eq!(journal.recover_voted_for(), None);
    }
}
