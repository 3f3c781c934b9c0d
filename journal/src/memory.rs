//! An in-memory [`JournalBackend`], useful for tests and for hosts that accept losing state on
//! crash.

use std::collections::HashMap;
use std::fmt;

use raft::message::LogEntry;

use crate::{JournalBackend, TxnId};

#[derive(Debug)]
enum StagedOp {
    SetState(String, u64),
    AppendEntry(u64, LogEntry),
}

#[derive(Default)]
struct Staged {
    ops: Vec<StagedOp>,
}

/// An error reported by [`MemoryBackend`]. The only failure mode is misuse of the transaction
/// API (committing or aborting a transaction id twice, or one that was never opened).
#[derive(Debug, Eq, PartialEq)]
pub struct UnknownTxn(pub TxnId);

impl fmt::Display for UnknownTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown or already-closed transaction {}", self.0)
    }
}

impl std::error::Error for UnknownTxn {}

/// A [`JournalBackend`] that keeps all durable state in process memory.
///
/// This exists as a reference implementation and for tests; restarting the process loses every
/// persisted scalar and log entry, which defeats the purpose of a journal in production.
pub struct MemoryBackend {
    next_txn: TxnId,
    staged: HashMap<TxnId, Staged>,
    state: HashMap<String, u64>,
    entries: HashMap<u64, LogEntry>,
}

impl MemoryBackend {
    /// Constructs an empty `MemoryBackend`.
    pub fn new() -> Self {
        Self {
            next_txn: 1,
            staged: HashMap::new(),
            state: HashMap::new(),
            entries: HashMap::new(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalBackend for MemoryBackend {
    type Error = UnknownTxn;

    fn begin(&mut self) -> Result<TxnId, Self::Error> {
        let txn = self.next_txn;
        self.next_txn += 1;
        self.staged.insert(txn, Staged::default());
        Ok(txn)
    }

    fn commit(&mut self, txn: TxnId) -> Result<(), Self::Error> {
        let staged = self.staged.remove(&txn).ok_or(UnknownTxn(txn))?;
        for op in staged.ops {
            match op {
                StagedOp::SetState(key, value) => {
                    self.state.insert(key, value);
                }
                StagedOp::AppendEntry(index, entry) => {
                    self.entries.insert(index, entry);
                }
            }
        }
        Ok(())
    }

    fn abort(&mut self, txn: TxnId) -> Result<(), Self::Error> {
        self.staged.remove(&txn).ok_or(UnknownTxn(txn))?;
        Ok(())
    }

    fn set_state(&mut self, txn: TxnId, key: &str, value: u64) -> Result<(), Self::Error> {
        let staged = self.staged.get_mut(&txn).ok_or(UnknownTxn(txn))?;
        staged.ops.push(StagedOp::SetState(key.to_string(), value));
        Ok(())
    }

    fn get_state(&self, key: &str) -> Option<u64> {
        self.state.get(key).copied()
    }

    fn append_entry(&mut self, txn: TxnId, index: u64, entry: LogEntry) -> Result<(), Self::Error> {
        let staged = self.staged.get_mut(&txn).ok_or(UnknownTxn(txn))?;
        staged.ops.push(StagedOp::AppendEntry(index, entry));
        Ok(())
    }

    fn get_entry(&self, index: u64) -> Option<LogEntry> {
        self.entries.get(&index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use raft::message::{EntryKind, TermId};

    use super::*;

    fn entry(term: u64) -> LogEntry {
        LogEntry {
            term: TermId { id: term },
            kind: EntryKind::Normal,
            id: 0,
            data: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let mut backend = MemoryBackend::new();
        let txn = backend.begin().unwrap();
        backend.set_state(txn, "term", 3).unwrap();
        backend.append_entry(txn, 1, entry(3)).unwrap();
        assert_eq!(backend.get_state("term"), None);
        assert_eq!(backend.get_entry(1), None);

        backend.commit(txn).unwrap();
        assert_eq!(backend.get_state("term"), Some(3));
        assert_eq!(backend.get_entry(1), Some(entry(3)));
    }

    #[test]
    fn abort_discards_staged_writes() {
        let mut backend = MemoryBackend::new();
        let txn = backend.begin().unwrap();
        backend.set_state(txn, "term", 9).unwrap();
        backend.abort(txn).unwrap();
        assert_eq!(backend.get_state("term"), None);
        assert_eq!(backend.commit(txn), Err(UnknownTxn(txn)));
    }
}
