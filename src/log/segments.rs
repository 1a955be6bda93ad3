//! Read access to flushed segment data.
//!
//! The segment writer is an external collaborator: it consumes closed
//! mem-tables from the WAL and writes segment files. The log facade only
//! needs to read entries back once their mem-tables have been purged, so
//! the contract is a lookup capability the host wires in. The in-memory
//! implementation backs tests and hosts that keep flushed entries resident.

use crate::types::{LogIndex, Term, WriterId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Lookup over entries the segment writer has flushed.
pub trait SegmentStore: Send + Sync {
    /// Entry payload at `(writer, index)`, if flushed.
    fn fetch(&self, writer: WriterId, index: LogIndex) -> Option<(Term, Arc<Vec<u8>>)>;

    /// Term only, when the payload is not needed.
    fn term(&self, writer: WriterId, index: LogIndex) -> Option<Term> {
        self.fetch(writer, index).map(|(term, _)| term)
    }

    /// Highest flushed index for the writer.
    fn last_index(&self, writer: WriterId) -> Option<LogIndex>;
}

/// Segment store keeping flushed entries in memory.
#[derive(Default)]
pub struct InMemorySegmentStore {
    inner: RwLock<HashMap<WriterId, BTreeMap<LogIndex, (Term, Arc<Vec<u8>>)>>>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flushed entry. Called by the host's segment writer.
    pub fn insert(&self, writer: WriterId, index: LogIndex, term: Term, data: Arc<Vec<u8>>) {
        self.inner
            .write()
            .entry(writer)
            .or_default()
            .insert(index, (term, data));
    }

    /// Drop a writer's entries at or below `index` after compaction.
    pub fn release(&self, writer: WriterId, index: LogIndex) {
        let mut inner = self.inner.write();
        if let Some(entries) = inner.get_mut(&writer) {
            *entries = entries.split_off(&(index + 1));
            if entries.is_empty() {
                inner.remove(&writer);
            }
        }
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn fetch(&self, writer: WriterId, index: LogIndex) -> Option<(Term, Arc<Vec<u8>>)> {
        self.inner.read().get(&writer)?.get(&index).cloned()
    }

    fn last_index(&self, writer: WriterId) -> Option<LogIndex> {
        self.inner
            .read()
            .get(&writer)?
            .keys()
            .next_back()
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_fetch_release() {
        let store = InMemorySegmentStore::new();
        store.insert(1, 1, 1, Arc::new(vec![1]));
        store.insert(1, 2, 1, Arc::new(vec![2]));
        store.insert(1, 3, 2, Arc::new(vec![3]));

        assert_eq!(store.term(1, 2), Some(1));
        assert_eq!(store.last_index(1), Some(3));

        store.release(1, 2);
        assert!(store.fetch(1, 2).is_none());
        assert_eq!(store.last_index(1), Some(3));
    }
}
