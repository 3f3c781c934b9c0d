//! Adapts a [`JournalBackend`] into a [`raft::log::Log`] implementation.

use raft::log::memory::InMemoryLog;
use raft::log::Log;
use raft::message::{LogEntry, LogIndex, TermId};

use crate::{JournalBackend, JournalError};

/// A [`Log`] backed by a [`JournalBackend`].
///
/// Every mutating call durably persists before it returns, using an in-memory
/// [`InMemoryLog`] as the fast-path index and read cache. This gives log durability for free
/// from the already-synchronous [`Log::append`]/[`Log::cancel_from`] contract: since `Node`
/// only emits a `SendableMessage` acknowledging an entry after the corresponding `Log` call
/// returns `Ok`, a durable write-through implementation of `Log` is sufficient to guarantee the
/// entry survives a crash before any such acknowledgement is sent.
pub struct JournalLog<B> {
    backend: B,
    memory: InMemoryLog,
}

impl<B: JournalBackend> JournalLog<B> {
    /// Wraps `backend`, recovering the in-memory index from any entries the backend already
    /// holds starting at index 1.
    pub fn recover(backend: B) -> Self {
        let mut memory = InMemoryLog::new_unbounded();
        let mut index = 1;
        while let Some(entry) = backend.get_entry(index) {
            memory
                .append(entry)
                .expect("recovered entries must append cleanly to an empty in-memory log");
            index += 1;
        }
        Self { backend, memory }
    }

    /// Returns a reference to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns a mutable reference to the underlying backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Persists `term` durably, using the same backend that holds this log's entries so a group
    /// needs only one durable store.
    pub fn persist_term(&mut self, term: TermId) -> Result<(), JournalError<B::Error>> {
        crate::persist_scalar(&mut self.backend, crate::KEY_TERM, term.id)
    }

    /// Persists `voted_for` durably, or clears it when `None`.
    pub fn persist_vote(&mut self, voted_for: Option<u64>) -> Result<(), JournalError<B::Error>> {
        crate::persist_scalar(&mut self.backend, crate::KEY_VOTED_FOR, voted_for.unwrap_or(0))
    }

    /// Persists `commit_idx`. May be called opportunistically; on crash, recovery re-derives
    /// `commit_idx` from the log and replays `apply` forward from the last persisted value.
    pub fn persist_commit_idx(&mut self, idx: LogIndex) -> Result<(), JournalError<B::Error>> {
        crate::persist_scalar(&mut self.backend, crate::KEY_COMMIT_IDX, idx.id)
    }

    /// Returns the durably recorded term, or the zero term if none was ever persisted.
    pub fn recover_term(&self) -> TermId {
        crate::recover_term(&self.backend)
    }

    /// Returns the durably recorded vote, if any.
    pub fn recover_voted_for(&self) -> Option<u64> {
        crate::recover_voted_for(&self.backend)
    }

    /// Returns the durably recorded commit index, or zero if none was ever persisted.
    pub fn recover_commit_idx(&self) -> LogIndex {
        crate::recover_commit_idx(&self.backend)
    }
}

impl<B: JournalBackend> Log for JournalLog<B> {
    type Error = JournalError<B::Error>;

    fn append(&mut self, entry: LogEntry) -> Result<(), Self::Error> {
        let index = self.memory.last_index() + 1;
        let txn = self.backend.begin().map_err(JournalError::Backend)?;
        self.backend
            .append_entry(txn, index.id, entry.clone())
            .map_err(JournalError::Backend)?;
        self.backend.commit(txn).map_err(JournalError::Backend)?;
        // The in-memory index can't fail to append what the backend just accepted; an unbounded
        // InMemoryLog only rejects on data_capacity, which JournalLog never sets.
        self.memory
            .append(entry)
            .unwrap_or_else(|_| panic!("unbounded in-memory index rejected append"));
        Ok(())
    }

    fn cancel_from(&mut self, from_index: LogIndex) -> Result<usize, Self::Error> {
        // Superseded entries are left in the backend; a later append_entry at the same index
        // overwrites them on commit, and pop_tail is available for a host that wants to reclaim
        // the space eagerly.
        self.memory
            .cancel_from(from_index)
            .map_err(|_| JournalError::InvalidRange)
    }

    fn entry_len(&self, entry: &LogEntry) -> usize {
        self.memory.entry_len(entry)
    }

    fn get(&mut self, index: LogIndex) -> Option<LogEntry> {
        self.memory.get(index)
    }

    fn get_term(&mut self, index: LogIndex) -> Option<TermId> {
        self.memory.get_term(index)
    }

    fn last_taken_index(&self) -> LogIndex {
        self.memory.last_taken_index()
    }

    fn last_index(&self) -> LogIndex {
        self.memory.last_index()
    }

    fn last_term(&self) -> TermId {
        self.memory.last_term()
    }

    fn prev_index(&self) -> LogIndex {
        self.memory.prev_index()
    }

    fn prev_term(&self) -> TermId {
        self.memory.prev_term()
    }

    fn take_next(&mut self) -> Option<LogEntry> {
        self.memory.take_next()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use raft::message::EntryKind;

    use super::*;
    use crate::memory::MemoryBackend;

    fn entry(term: u64, id: u32) -> LogEntry {
        LogEntry {
            term: TermId { id: term },
            kind: EntryKind::Normal,
            id,
            data: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn append_persists_to_backend() {
        let mut log = JournalLog::recover(MemoryBackend::new());
        log.append(entry(1, 0)).unwrap();
        log.append(entry(1, 1)).unwrap();

        assert_eq!(log.last_index(), LogIndex { id: 2 });
        assert_eq!(log.backend().get_entry(1), Some(entry(1, 0)));
        assert_eq!(log.backend().get_entry(2), Some(entry(1, 1)));
    }

    #[test]
    fn recover_rebuilds_index_from_backend() {
        let mut seed = JournalLog::recover(MemoryBackend::new());
        seed.append(entry(2, 0)).unwrap();
        seed.append(entry(2, 1)).unwrap();
        let backend = seed.backend;

        let mut recovered = JournalLog::recover(backend);
        assert_eq!(recovered.last_index(), LogIndex { id: 2 });
        assert_eq!(recovered.get(LogIndex { id: 1 }), Some(entry(2, 0)));
        assert_eq!(recovered.get(LogIndex { id: 2 }), Some(entry(2, 1)));
    }

    #[test]
    fn scalar_persistence_shares_the_log_backend() {
        let mut log = JournalLog::recover(MemoryBackend::new());
        assert_eq!(log.recover_term(), TermId::default());
        log.persist_term(TermId { id: 5 }).unwrap();
        log.persist_vote(Some(2)).unwrap();
        assert_eq!(log.recover_term(), TermId { id: 5 });
        assert_eq!(log.recover_voted_for(), Some(2));
    }

    #[test]
    fn cancel_from_rejects_out_of_range_index() {
        let mut log = JournalLog::recover(MemoryBackend::new());
        log.append(entry(1, 0)).unwrap();
        assert!(matches!(
            log.cancel_from(LogIndex { id: 5 }),
            Err(JournalError::InvalidRange)
        ));
    }
}
