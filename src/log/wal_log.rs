//! WAL-backed log facade.
//!
//! Writes go through the shared WAL sink; durability is acknowledged
//! asynchronously by `Written` notices which advance the `last_written`
//! watermark. Reads resolve in order: the pending cache (appended but not
//! yet acknowledged), the mem-table registry, the segment store, and the
//! snapshot boundary.

use super::meta::MetaFile;
use super::snapshot::SnapshotFile;
use super::{AppendOutcome, LogMeta, NodeLog, SegmentStore, SnapshotData};
use crate::error::{CohortError, Result};
use crate::types::{LogEntry, LogIndex, Term, WriterId};
use crate::wal::memtable::MemTableRegistry;
use crate::wal::{WalHandle, WalNotice};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Per-node log over the shared WAL.
pub struct WalLog {
    writer: WriterId,
    wal: WalHandle,
    registry: Arc<MemTableRegistry>,
    segments: Arc<dyn SegmentStore>,
    notice_tx: UnboundedSender<WalNotice>,

    meta: MetaFile,
    snapshot: SnapshotFile,

    last_index: LogIndex,
    last_term: Term,
    last_written_index: LogIndex,
    last_written_term: Term,

    /// Entries appended but not yet acknowledged; source for resends.
    pending: BTreeMap<LogIndex, LogEntry>,
    /// Force the next append to be a truncating write (resets WAL
    /// sequencing after a snapshot install moved the tail).
    needs_truncate: bool,
    release_cursor: LogIndex,
    closed: bool,
}

impl WalLog {
    /// Open a node's log state under `data_dir`, resolving the current tail
    /// from the snapshot, the mem-table registry and the segment store.
    ///
    /// `notice_tx` receives this writer's WAL notices; the host feeds them
    /// back into the node as `Written`/`ResendWrite` messages.
    pub fn open(
        writer: WriterId,
        data_dir: &Path,
        wal: WalHandle,
        registry: Arc<MemTableRegistry>,
        segments: Arc<dyn SegmentStore>,
        notice_tx: UnboundedSender<WalNotice>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let meta = MetaFile::open(&data_dir.join("meta"))?;
        let snapshot = SnapshotFile::open(&data_dir.join("snapshot"))?;

        let (snap_index, snap_term) = snapshot.index_term();
        let table_last = registry.last_index(writer);
        let segment_last = segments.last_index(writer);
        let last_index = [Some(snap_index), table_last, segment_last]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0);

        let mut log = Self {
            writer,
            wal,
            registry,
            segments,
            notice_tx,
            meta,
            snapshot,
            last_index,
            last_term: snap_term,
            last_written_index: last_index,
            last_written_term: snap_term,
            pending: BTreeMap::new(),
            needs_truncate: false,
            release_cursor: snap_index,
            closed: false,
        };
        let last_term = log.resolve_term(last_index).unwrap_or(snap_term);
        log.last_term = last_term;
        log.last_written_term = last_term;
        Ok(log)
    }

    /// Term lookup through the read chain without the `NodeLog` boundary
    /// checks.
    fn resolve_term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(entry) = self.pending.get(&index) {
            return Some(entry.term);
        }
        if let Some(term) = self.registry.term(self.writer, index) {
            return Some(term);
        }
        if let Some(term) = self.segments.term(self.writer, index) {
            return Some(term);
        }
        let (snap_index, snap_term) = self.snapshot.index_term();
        (index == snap_index && snap_index > 0).then_some(snap_term)
    }

    fn resolve_entry(&self, index: LogIndex) -> Option<LogEntry> {
        if let Some(entry) = self.pending.get(&index) {
            return Some(entry.clone());
        }
        if let Some(table_entry) = self.registry.lookup(self.writer, index) {
            return LogEntry::decode(index, table_entry.term, &table_entry.data).ok();
        }
        let (term, data) = self.segments.fetch(self.writer, index)?;
        LogEntry::decode(index, term, &data).ok()
    }

    fn send_to_wal(&self, entry: &LogEntry, truncate: bool) -> Result<()> {
        let data = Arc::new(entry.encode_command()?);
        if truncate {
            self.wal.truncate_write(
                self.writer,
                entry.index,
                entry.term,
                data,
                self.notice_tx.clone(),
            )
        } else {
            self.wal
                .append(self.writer, entry.index, entry.term, data, self.notice_tx.clone())
        }
    }
}

impl NodeLog for WalLog {
    fn append(&mut self, entry: &LogEntry, truncate: bool) -> Result<AppendOutcome> {
        if self.closed {
            return Err(CohortError::WalDown);
        }
        let truncate = truncate || self.needs_truncate;
        if !truncate && entry.index != self.last_index + 1 {
            return Err(CohortError::Log(format!(
                "Expected index {}, got {}",
                self.last_index + 1,
                entry.index
            )));
        }

        self.send_to_wal(entry, truncate)?;
        self.needs_truncate = false;

        if truncate {
            self.pending.split_off(&entry.index);
            // A truncated tail can never be acknowledged ahead of the
            // replacement write.
            if self.last_written_index >= entry.index {
                self.last_written_index = entry.index.saturating_sub(1);
                self.last_written_term = self.resolve_term(self.last_written_index).unwrap_or(0);
            }
        }
        self.pending.insert(entry.index, entry.clone());
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(AppendOutcome::Queued)
    }

    fn fetch(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let (snap_index, _) = self.snapshot.index_term();
        let start = from.max(snap_index + 1);
        let mut out = Vec::new();
        let mut index = start;
        while index <= to.min(self.last_index) {
            match self.resolve_entry(index) {
                Some(entry) => out.push(entry),
                None => {
                    return Err(CohortError::EntryNotFound(index));
                }
            }
            index += 1;
        }
        Ok(out)
    }

    fn fetch_term(&self, index: LogIndex) -> Option<Term> {
        if index > self.last_index {
            return None;
        }
        self.resolve_term(index)
    }

    fn last_index_term(&self) -> (LogIndex, Term) {
        (self.last_index, self.last_term)
    }

    fn last_written(&self) -> (LogIndex, Term) {
        (self.last_written_index, self.last_written_term)
    }

    fn write_snapshot(&mut self, snapshot: SnapshotData) -> Result<()> {
        let (index, term) = (snapshot.meta.last_index, snapshot.meta.last_term);
        self.snapshot.write(&snapshot)?;

        self.pending = self.pending.split_off(&(index + 1));
        self.release_cursor = self.release_cursor.max(index);
        if index > self.last_index {
            // Install beyond our tail: the log restarts after the snapshot.
            self.last_index = index;
            self.last_term = term;
            self.last_written_index = index;
            self.last_written_term = term;
            self.pending.clear();
            self.needs_truncate = true;
        }
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<SnapshotData>> {
        self.snapshot.read()
    }

    fn snapshot_index_term(&self) -> (LogIndex, Term) {
        self.snapshot.index_term()
    }

    fn update_release_cursor(&mut self, index: LogIndex) -> Result<()> {
        self.release_cursor = self.release_cursor.max(index);
        Ok(())
    }

    fn handle_written(&mut self, from: LogIndex, to: LogIndex, term: Term) {
        let to = to.min(self.last_index);
        if to < from {
            return;
        }
        match self.resolve_term(to) {
            Some(current) if current == term => {
                if to > self.last_written_index {
                    self.last_written_index = to;
                    self.last_written_term = term;
                }
                self.pending = self.pending.split_off(&(to + 1));
                debug!(writer = self.writer, to, term, "Advanced written watermark");
            }
            _ => {
                // Acknowledgement for a tail that has since been replaced;
                // the replacement write will carry its own notice.
                debug!(writer = self.writer, to, term, "Ignoring stale written notice");
            }
        }
    }

    fn handle_resend(&mut self, from: LogIndex) -> Result<()> {
        let to_resend: Vec<LogEntry> = self.pending.range(from..).map(|(_, e)| e.clone()).collect();
        if to_resend.is_empty() {
            warn!(writer = self.writer, from, "Resend requested but nothing pending");
            return Ok(());
        }
        debug!(
            writer = self.writer,
            from,
            count = to_resend.len(),
            "Resending unacknowledged entries"
        );
        // The first record truncates, resetting the sink's sequencing.
        let mut truncate = true;
        for entry in &to_resend {
            self.send_to_wal(entry, truncate)?;
            truncate = false;
        }
        Ok(())
    }

    fn write_meta(&mut self, meta: LogMeta) -> Result<()> {
        self.meta.write(meta)
    }

    fn read_meta(&self) -> Result<LogMeta> {
        Ok(self.meta.read())
    }

    fn sync_meta(&mut self) -> Result<()> {
        self.meta.sync()
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemorySegmentStore;
    use crate::types::Command;
    use crate::wal;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc::unbounded_channel;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, Command::Noop)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<MemTableRegistry>,
        segments: Arc<InMemorySegmentStore>,
        wal: WalHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let registry = Arc::new(MemTableRegistry::new());
            let segments = Arc::new(InMemorySegmentStore::new());
            let (seg_tx, _seg_rx) = unbounded_channel();
            let config = crate::config::WalSettings {
                dir: dir.path().join("wal"),
                ..Default::default()
            };
            let wal = wal::spawn(config, registry.clone(), seg_tx).unwrap();
            Self { _dir: dir, registry, segments, wal }
        }

        fn open_log(
            &self,
            writer: WriterId,
            data_dir: &Path,
        ) -> (WalLog, tokio::sync::mpsc::UnboundedReceiver<WalNotice>) {
            let (notice_tx, notice_rx) = unbounded_channel();
            let segments: Arc<dyn SegmentStore> = self.segments.clone();
            let log = WalLog::open(
                writer,
                data_dir,
                self.wal.clone(),
                self.registry.clone(),
                segments,
                notice_tx,
            )
            .unwrap();
            (log, notice_rx)
        }
    }

    fn await_written(rx: &mut tokio::sync::mpsc::UnboundedReceiver<WalNotice>) -> WalNotice {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(notice) = rx.try_recv() {
                return notice;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for WAL notice");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_append_acknowledge_fetch() {
        let fixture = Fixture::new();
        let data_dir = fixture._dir.path().join("node-1");
        let (mut log, mut notice_rx) = fixture.open_log(1, &data_dir);

        log.append(&entry(1, 1), false).unwrap();
        log.append(&entry(2, 1), false).unwrap();
        assert_eq!(log.last_index_term(), (2, 1));
        assert_eq!(log.last_written(), (0, 0));

        loop {
            match await_written(&mut notice_rx) {
                WalNotice::Written { from, to, term } => {
                    log.handle_written(from, to, term);
                    if log.last_written().0 == 2 {
                        break;
                    }
                }
                other => panic!("unexpected notice {:?}", other),
            }
        }
        assert_eq!(log.last_written(), (2, 1));

        let entries = log.fetch(1, 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.fetch_term(2), Some(1));
    }

    #[test]
    fn test_tail_survives_restart() {
        let fixture = Fixture::new();
        let data_dir = fixture._dir.path().join("node-1");
        {
            let (mut log, mut notice_rx) = fixture.open_log(1, &data_dir);
            log.append(&entry(1, 2), false).unwrap();
            match await_written(&mut notice_rx) {
                WalNotice::Written { from, to, term } => log.handle_written(from, to, term),
                other => panic!("unexpected notice {:?}", other),
            }
            log.write_meta(LogMeta { current_term: 2, voted_for: Some(1) }).unwrap();
            log.sync_meta().unwrap();
        }

        let (log, _notice_rx) = fixture.open_log(1, &data_dir);
        assert_eq!(log.last_index_term(), (1, 2));
        assert_eq!(
            log.read_meta().unwrap(),
            LogMeta { current_term: 2, voted_for: Some(1) }
        );
    }

    #[test]
    fn test_truncating_append_moves_tail_back() {
        let fixture = Fixture::new();
        let data_dir = fixture._dir.path().join("node-1");
        let (mut log, _notice_rx) = fixture.open_log(1, &data_dir);

        log.append(&entry(1, 1), false).unwrap();
        log.append(&entry(2, 1), false).unwrap();
        log.append(&entry(3, 1), false).unwrap();
        log.append(&entry(2, 2), true).unwrap();

        assert_eq!(log.last_index_term(), (2, 2));
        assert_eq!(log.fetch_term(2), Some(2));
        assert_eq!(log.fetch_term(3), None);
    }

    #[test]
    fn test_snapshot_bounds_reads() {
        let fixture = Fixture::new();
        let data_dir = fixture._dir.path().join("node-1");
        let (mut log, _notice_rx) = fixture.open_log(1, &data_dir);

        log.append(&entry(1, 1), false).unwrap();
        log.append(&entry(2, 1), false).unwrap();
        log.write_snapshot(SnapshotData {
            meta: crate::log::SnapshotMeta { last_index: 2, last_term: 1, members: vec![1] },
            machine_state: vec![1],
        })
        .unwrap();

        assert_eq!(log.snapshot_index_term(), (2, 1));
        assert_eq!(log.fetch_term(2), Some(1));
        assert!(log.fetch(1, 2).unwrap().is_empty());
        assert_eq!(log.next_index(), 3);
    }
}
