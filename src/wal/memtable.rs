//! In-memory tables over recently written WAL entries.
//!
//! The WAL sink inserts every accepted record into a per-writer table so
//! readers can resolve recent entries before the segment writer has flushed
//! them. Two process-wide indexes exist: *open* tables receive inserts for
//! the current WAL file; at rollover the whole open index is promoted to
//! the *closed* index in one atomic swap, tagged with a monotonic sequence
//! so multiple closed tables of one writer stay ordered.
//!
//! Only the WAL sink mutates; all other parties read.

use crate::types::{LogIndex, Term, WriterId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A single entry held in a mem-table.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub term: Term,
    pub data: Arc<Vec<u8>>,
}

/// Per-writer ordered container of recent entries.
#[derive(Debug, Clone, Default)]
pub struct MemTable {
    entries: BTreeMap<LogIndex, TableEntry>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn first_index(&self) -> Option<LogIndex> {
        self.entries.keys().next().copied()
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        self.entries.keys().next_back().copied()
    }

    /// Insert an entry, overwriting any previous entry at the index.
    pub fn insert(&mut self, index: LogIndex, term: Term, data: Arc<Vec<u8>>) {
        self.entries.insert(index, TableEntry { term, data });
    }

    /// Truncating insert: all entries at and after `index` are replaced by
    /// this one.
    pub fn insert_truncate(&mut self, index: LogIndex, term: Term, data: Arc<Vec<u8>>) {
        self.entries.split_off(&index);
        self.entries.insert(index, TableEntry { term, data });
    }

    pub fn get(&self, index: LogIndex) -> Option<&TableEntry> {
        self.entries.get(&index)
    }

    pub fn term(&self, index: LogIndex) -> Option<Term> {
        self.entries.get(&index).map(|e| e.term)
    }

    /// Entries in `[from, to]`, ascending.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<(LogIndex, TableEntry)> {
        self.entries
            .range(from..=to)
            .map(|(idx, e)| (*idx, e.clone()))
            .collect()
    }
}

/// A promoted table, ordered among its writer's closed tables by `seq`.
#[derive(Debug, Clone)]
pub struct ClosedTable {
    pub seq: u64,
    pub table: MemTable,
}

#[derive(Default)]
struct RegistryInner {
    open: HashMap<WriterId, MemTable>,
    closed: HashMap<WriterId, Vec<ClosedTable>>,
    next_seq: u64,
}

/// Process-wide open/closed mem-table indexes.
///
/// Shared by the WAL sink (sole writer), the per-node log facades and the
/// segment writer (readers). Rollover and recovery swap whole maps under
/// one write lock so readers never observe a mix of generations for the
/// same writer.
#[derive(Default)]
pub struct MemTableRegistry {
    inner: RwLock<RegistryInner>,
}

impl MemTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into the writer's open table. Sink only.
    pub fn insert(&self, writer: WriterId, index: LogIndex, term: Term, data: Arc<Vec<u8>>) {
        let mut inner = self.inner.write();
        inner
            .open
            .entry(writer)
            .or_default()
            .insert(index, term, data);
    }

    /// Truncating insert into the writer's open table. Sink only.
    ///
    /// Closed tables keep their (now superseded) tail; readers resolve the
    /// open table first, so the truncating entry shadows them.
    pub fn insert_truncate(&self, writer: WriterId, index: LogIndex, term: Term, data: Arc<Vec<u8>>) {
        let mut inner = self.inner.write();
        inner
            .open
            .entry(writer)
            .or_default()
            .insert_truncate(index, term, data);
    }

    /// Resolve an entry for a writer: open table first, then closed tables
    /// newest to oldest.
    pub fn lookup(&self, writer: WriterId, index: LogIndex) -> Option<TableEntry> {
        let inner = self.inner.read();
        if let Some(entry) = inner.open.get(&writer).and_then(|t| t.get(index)) {
            return Some(entry.clone());
        }
        let closed = inner.closed.get(&writer)?;
        closed
            .iter()
            .rev()
            .find_map(|c| c.table.get(index).cloned())
    }

    /// Term of the entry at `index`, if any table holds it.
    pub fn term(&self, writer: WriterId, index: LogIndex) -> Option<Term> {
        self.lookup(writer, index).map(|e| e.term)
    }

    /// Highest index any table holds for the writer.
    pub fn last_index(&self, writer: WriterId) -> Option<LogIndex> {
        let inner = self.inner.read();
        let open = inner.open.get(&writer).and_then(|t| t.last_index());
        let closed = inner
            .closed
            .get(&writer)
            .and_then(|v| v.iter().filter_map(|c| c.table.last_index()).max());
        open.into_iter().chain(closed).max()
    }

    /// Atomically promote every open table to the closed index, tagging
    /// each with the next sequence number. Returns the promoted set for the
    /// segment-writer notification. Sink only.
    pub fn roll(&self) -> Vec<(WriterId, ClosedTable)> {
        let mut inner = self.inner.write();
        let open = std::mem::take(&mut inner.open);
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut promoted = Vec::with_capacity(open.len());
        for (writer, table) in open {
            if table.is_empty() {
                continue;
            }
            let closed = ClosedTable { seq, table };
            promoted.push((writer, closed.clone()));
            inner.closed.entry(writer).or_default().push(closed);
        }
        promoted
    }

    /// Replace the closed index with recovered tables and clear any stale
    /// open entries. Used once at the end of WAL recovery. Sink only.
    pub fn install_recovered(&self, tables: Vec<(WriterId, MemTable)>) -> Vec<(WriterId, ClosedTable)> {
        let mut inner = self.inner.write();
        inner.open.clear();
        inner.closed.clear();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut installed = Vec::with_capacity(tables.len());
        for (writer, table) in tables {
            if table.is_empty() {
                continue;
            }
            let closed = ClosedTable { seq, table };
            installed.push((writer, closed.clone()));
            inner.closed.entry(writer).or_default().push(closed);
        }
        installed
    }

    /// Drop a writer's closed tables up to and including `seq`. Called by
    /// the host once the segment writer has flushed them.
    pub fn purge_closed(&self, writer: WriterId, seq: u64) {
        let mut inner = self.inner.write();
        if let Some(tables) = inner.closed.get_mut(&writer) {
            tables.retain(|c| c.seq > seq);
            if tables.is_empty() {
                inner.closed.remove(&writer);
            }
        }
    }

    /// Snapshot of (writer, open len, closed tables) sizes, for assertions
    /// and introspection.
    pub fn table_counts(&self, writer: WriterId) -> (usize, usize) {
        let inner = self.inner.read();
        let open = inner.open.get(&writer).map(|t| t.len()).unwrap_or(0);
        let closed = inner.closed.get(&writer).map(|v| v.len()).unwrap_or(0);
        (open, closed)
    }
}
