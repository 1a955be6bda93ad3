//! In-memory log backend.
//!
//! Writes are durable the moment they land, so appends return an immediate
//! `Written` outcome and `last_written` never trails the tail. Backs node
//! tests and single-process embedding; the durable twin is [`super::WalLog`].

use super::{AppendOutcome, LogMeta, NodeLog, SnapshotData};
use crate::error::{CohortError, Result};
use crate::types::{LogEntry, LogIndex, Term};
use std::collections::VecDeque;

/// Log entirely resident in memory.
#[derive(Debug, Default)]
pub struct MemLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry.
    first_index: LogIndex,
    snapshot: Option<SnapshotData>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    meta: LogMeta,
    release_cursor: LogIndex,
}

impl MemLog {
    pub fn new() -> Self {
        Self { first_index: 1, ..Self::default() }
    }

    fn last_entry(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset)
    }

    /// Drop all entries at and after `index`.
    fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.first_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.first_index) as usize;
        self.entries.truncate(keep);
    }
}

impl NodeLog for MemLog {
    fn append(&mut self, entry: &LogEntry, truncate: bool) -> Result<AppendOutcome> {
        if truncate {
            self.truncate_from(entry.index);
        }
        let expected = self.last_index_term().0 + 1;
        if entry.index != expected {
            return Err(CohortError::Log(format!(
                "Expected index {}, got {}",
                expected, entry.index
            )));
        }
        self.entries.push_back(entry.clone());
        Ok(AppendOutcome::Written { from: entry.index, to: entry.index, term: entry.term })
    }

    fn fetch(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let start = from.max(self.first_index);
        let mut out = Vec::new();
        let mut index = start;
        while index <= to {
            match self.get(index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        Ok(out)
    }

    fn fetch_term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index && self.snapshot_index > 0 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    fn last_index_term(&self) -> (LogIndex, Term) {
        match self.last_entry() {
            Some(entry) => (entry.index, entry.term),
            None => (self.snapshot_index, self.snapshot_term),
        }
    }

    fn last_written(&self) -> (LogIndex, Term) {
        self.last_index_term()
    }

    fn write_snapshot(&mut self, snapshot: SnapshotData) -> Result<()> {
        self.snapshot_index = snapshot.meta.last_index;
        self.snapshot_term = snapshot.meta.last_term;

        // Discard covered entries.
        while self
            .entries
            .front()
            .is_some_and(|e| e.index <= self.snapshot_index)
        {
            self.entries.pop_front();
        }
        self.first_index = self.snapshot_index + 1;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<SnapshotData>> {
        Ok(self.snapshot.clone())
    }

    fn snapshot_index_term(&self) -> (LogIndex, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    fn update_release_cursor(&mut self, index: LogIndex) -> Result<()> {
        self.release_cursor = self.release_cursor.max(index);
        Ok(())
    }

    fn handle_written(&mut self, _from: LogIndex, _to: LogIndex, _term: Term) {}

    fn handle_resend(&mut self, _from: LogIndex) -> Result<()> {
        Ok(())
    }

    fn write_meta(&mut self, meta: LogMeta) -> Result<()> {
        self.meta = meta;
        Ok(())
    }

    fn read_meta(&self) -> Result<LogMeta> {
        Ok(self.meta)
    }

    fn sync_meta(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::SnapshotMeta;
    use crate::types::Command;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, Command::Noop)
    }

    #[test]
    fn test_empty_log() {
        let log = MemLog::new();
        assert_eq!(log.last_index_term(), (0, 0));
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.fetch_term(0), Some(0));
        assert_eq!(log.fetch_term(1), None);
    }

    #[test]
    fn test_append_and_fetch() {
        let mut log = MemLog::new();
        log.append(&entry(1, 1), false).unwrap();
        log.append(&entry(2, 1), false).unwrap();
        log.append(&entry(3, 2), false).unwrap();

        assert_eq!(log.last_index_term(), (3, 2));
        let fetched = log.fetch(2, 3).unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].index, 2);
    }

    #[test]
    fn test_rejects_gap() {
        let mut log = MemLog::new();
        log.append(&entry(1, 1), false).unwrap();
        assert!(log.append(&entry(3, 1), false).is_err());
    }

    #[test]
    fn test_truncating_append() {
        let mut log = MemLog::new();
        log.append(&entry(1, 1), false).unwrap();
        log.append(&entry(2, 1), false).unwrap();
        log.append(&entry(3, 1), false).unwrap();

        log.append(&entry(2, 2), true).unwrap();
        assert_eq!(log.last_index_term(), (2, 2));
        assert_eq!(log.fetch_term(3), None);
    }

    #[test]
    fn test_snapshot_compacts() {
        let mut log = MemLog::new();
        for i in 1..=5 {
            log.append(&entry(i, 1), false).unwrap();
        }
        log.write_snapshot(SnapshotData {
            meta: SnapshotMeta { last_index: 3, last_term: 1, members: vec![1] },
            machine_state: Vec::new(),
        })
        .unwrap();

        assert_eq!(log.snapshot_index_term(), (3, 1));
        assert_eq!(log.fetch_term(3), Some(1));
        assert!(log.fetch(1, 2).unwrap().is_empty());
        assert_eq!(log.fetch(4, 5).unwrap().len(), 2);
        assert_eq!(log.last_index_term(), (5, 1));
    }
}
