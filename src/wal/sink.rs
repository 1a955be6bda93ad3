//! The WAL sink actor.
//!
//! A single sink serialises append requests from every co-located node into
//! one on-disk file, batching fsyncs for throughput. The sink runs on a
//! dedicated OS thread (fsync blocks) and drains a tokio mailbox in two
//! phases: block for the first message, then drain without blocking until
//! the mailbox empties or the batch reaches `max_batch_size`. Completing a
//! batch fsyncs once and notifies each contributing writer.
//!
//! `max_batch_size` adapts: reaching the cap doubles it (bounded by
//! [`MAX_MAX_BATCH`]), draining before the cap halves it (floored at
//! [`MIN_MAX_BATCH`]).

use crate::error::{CohortError, Result};
use crate::metrics::{BatchRing, WAL_OUT_OF_SEQ_DROPS, WAL_ROLLOVERS};
use crate::types::{LogIndex, Term, WriterId};
use crate::wal::memtable::MemTableRegistry;
use crate::wal::record::{self, WriterKey, MAX_WRITER_REF};
use crate::wal::{SegmentNotice, WalConfig, WalNotice, WalRequest};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Ceiling for the adaptive batch size.
pub const MAX_MAX_BATCH: usize = 2048;
/// Floor for the adaptive batch size.
pub const MIN_MAX_BATCH: usize = 16;

/// Per-writer sequencing state for the out-of-sequence policy.
#[derive(Debug, Clone, Copy)]
struct SeqState {
    last_index: LogIndex,
    out_of_seq: bool,
}

/// Accumulated acknowledgement for one writer within a batch.
struct BatchWriter {
    from: LogIndex,
    to: LogIndex,
    term: Term,
    notify: UnboundedSender<WalNotice>,
}

/// One in-flight fsync batch.
#[derive(Default)]
struct Batch {
    buf: Vec<u8>,
    writers: HashMap<WriterId, BatchWriter>,
    count: usize,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn note(
        &mut self,
        writer: WriterId,
        index: LogIndex,
        term: Term,
        notify: &UnboundedSender<WalNotice>,
    ) {
        let entry = self.writers.entry(writer).or_insert_with(|| BatchWriter {
            from: index,
            to: index,
            term,
            notify: notify.clone(),
        });
        entry.from = entry.from.min(index);
        if index >= entry.to {
            entry.to = index;
            entry.term = term;
        }
        self.count += 1;
    }
}

pub(crate) struct WalSink {
    config: WalConfig,
    registry: Arc<MemTableRegistry>,
    segment_writer: UnboundedSender<SegmentNotice>,
    ring: BatchRing,

    file: File,
    file_path: PathBuf,
    file_seq: u64,
    file_size: u64,
    writer_refs: HashMap<WriterId, u16>,

    writer_seq: HashMap<WriterId, SeqState>,
    max_batch_size: usize,
}

impl WalSink {
    /// Recover existing WAL files and open a fresh one.
    ///
    /// Runs on the caller before the sink thread starts so startup failures
    /// surface synchronously. Recovery replays every `*.wal` file in name
    /// order into fresh mem-tables, swaps them into the closed index, hands
    /// them to the segment writer, then opens a new file.
    pub(crate) fn open(
        config: WalConfig,
        registry: Arc<MemTableRegistry>,
        segment_writer: UnboundedSender<SegmentNotice>,
        ring: BatchRing,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let existing = list_wal_files(&config.dir)?;
        let mut writer_seq = HashMap::new();
        let next_seq = existing.iter().map(|(seq, _)| seq + 1).max().unwrap_or(0);

        if !existing.is_empty() {
            let mut tables: HashMap<WriterId, crate::wal::memtable::MemTable> = HashMap::new();
            for (_, path) in &existing {
                replay_file(path, &mut tables)?;
            }
            for (&writer, table) in &tables {
                if let Some(last) = table.last_index() {
                    writer_seq.insert(writer, SeqState { last_index: last, out_of_seq: false });
                }
            }
            let recovered = registry.install_recovered(tables.into_iter().collect());
            info!(
                files = existing.len(),
                writers = recovered.len(),
                "Recovered WAL"
            );
            let _ = self_notice(&segment_writer, SegmentNotice::Recovered {
                wal_files: existing.iter().map(|(_, p)| p.clone()).collect(),
                tables: recovered,
            });
        }

        let (file, file_path) = open_wal_file(&config.dir, next_seq)?;
        info!(path = %file_path.display(), "Opened WAL");

        Ok(Self {
            config,
            registry,
            segment_writer,
            ring,
            file,
            file_path,
            file_seq: next_seq,
            file_size: 0,
            writer_refs: HashMap::new(),
            writer_seq,
            max_batch_size: MIN_MAX_BATCH,
        })
    }

    /// The sink loop. Exits when every handle has been dropped or on a
    /// fatal storage error.
    pub(crate) fn run(mut self, mut rx: UnboundedReceiver<WalRequest>) {
        loop {
            // wait phase
            let Some(msg) = rx.blocking_recv() else {
                info!("WAL sink shutting down");
                return;
            };

            let mut batch = Batch::default();
            let mut disconnected = false;
            if let Err(e) = self.handle_request(msg, &mut batch) {
                error!(error = %e, "WAL write failed");
                return;
            }

            // batched phase
            while batch.count < self.max_batch_size {
                match rx.try_recv() {
                    Ok(msg) => {
                        if let Err(e) = self.handle_request(msg, &mut batch) {
                            error!(error = %e, "WAL write failed");
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }

            let hit_cap = batch.count >= self.max_batch_size;
            if let Err(e) = self.complete_batch(batch) {
                error!(error = %e, "WAL fsync failed");
                return;
            }

            self.max_batch_size = if hit_cap {
                (self.max_batch_size * 2).min(MAX_MAX_BATCH)
            } else {
                (self.max_batch_size / 2).max(MIN_MAX_BATCH)
            };

            if disconnected {
                info!("WAL sink shutting down");
                return;
            }
        }
    }

    fn handle_request(&mut self, msg: WalRequest, batch: &mut Batch) -> Result<()> {
        match msg {
            WalRequest::Append { writer, index, term, entry, truncate, notify } => {
                self.handle_append(writer, index, term, entry, truncate, notify, batch)
            }
            WalRequest::ForceRollOver => {
                self.flush_batch(batch)?;
                self.roll_over()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append(
        &mut self,
        writer: WriterId,
        index: LogIndex,
        term: Term,
        entry: Arc<Vec<u8>>,
        truncate: bool,
        notify: UnboundedSender<WalNotice>,
        batch: &mut Batch,
    ) -> Result<()> {
        if !truncate && !self.accept_sequenced(writer, index, &notify) {
            return Ok(());
        }

        // Writer reference for the current file; an introduction record
        // carries the serialized id. Exhausted reference space forces a
        // rollover, which resets the cache.
        if !self.writer_refs.contains_key(&writer) && self.writer_refs.len() > MAX_WRITER_REF as usize
        {
            self.flush_batch(batch)?;
            self.roll_over()?;
        }

        let writer_id_bytes;
        let key = match self.writer_refs.get(&writer) {
            Some(&writer_ref) => WriterKey::Reference(writer_ref),
            None => {
                let writer_ref = self.writer_refs.len() as u16;
                writer_id_bytes = bincode::serialize(&writer)?;
                WriterKey::Introduce { writer_ref, writer_id: &writer_id_bytes }
            }
        };

        let record_len = record::encoded_len(&key, entry.len()) as u64;
        if self.file_size + batch.buf.len() as u64 + record_len > self.config.max_wal_size_bytes
            && (self.file_size > 0 || !batch.is_empty())
        {
            // Complete what the old file holds, then write the deferred
            // record into the new file.
            self.flush_batch(batch)?;
            self.roll_over()?;
            return self.handle_append(writer, index, term, entry, truncate, notify, batch);
        }

        if let WriterKey::Introduce { writer_ref, .. } = &key {
            self.writer_refs.insert(writer, *writer_ref);
        }

        record::encode_record(
            &mut batch.buf,
            truncate,
            key,
            index,
            term,
            &entry,
            self.config.compute_checksums,
        )?;

        if truncate {
            self.registry.insert_truncate(writer, index, term, entry);
        } else {
            self.registry.insert(writer, index, term, entry);
        }
        self.writer_seq
            .insert(writer, SeqState { last_index: index, out_of_seq: false });
        batch.note(writer, index, term, &notify);
        Ok(())
    }

    /// Out-of-sequence policy for non-truncating appends. Returns whether
    /// the append is accepted.
    fn accept_sequenced(
        &mut self,
        writer: WriterId,
        index: LogIndex,
        notify: &UnboundedSender<WalNotice>,
    ) -> bool {
        let Some(state) = self.writer_seq.get_mut(&writer) else {
            return true;
        };
        if index <= state.last_index + 1 {
            return true;
        }
        if state.out_of_seq {
            debug!(writer, index, "Dropping out-of-sequence append");
            return false;
        }
        state.out_of_seq = true;
        ::metrics::counter!(WAL_OUT_OF_SEQ_DROPS).increment(1);
        warn!(
            writer,
            index,
            expected = state.last_index + 1,
            "Out-of-sequence append, requesting resend"
        );
        let _ = notify.send(WalNotice::ResendWrite { from: state.last_index + 1 });
        false
    }

    /// Write, fsync and acknowledge a batch.
    fn complete_batch(&mut self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.count;
        self.write_out(&batch.buf)?;
        for (writer, ack) in batch.writers {
            debug!(writer, from = ack.from, to = ack.to, "Batch written");
            let _ = ack.notify.send(WalNotice::Written {
                from: ack.from,
                to: ack.to,
                term: ack.term,
            });
        }
        self.ring.record(count);
        Ok(())
    }

    /// Complete whatever the batch holds so far. Used before a rollover so
    /// the old file's records are durable and acknowledged before it closes.
    fn flush_batch(&mut self, batch: &mut Batch) -> Result<()> {
        let pending = std::mem::take(batch);
        self.complete_batch(pending)
    }

    fn write_out(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        self.file.sync_data()?;
        self.file_size += buf.len() as u64;
        Ok(())
    }

    /// Close the current file, promote open mem-tables to closed, notify
    /// the segment writer, and open the next file.
    ///
    /// Callers complete the pending batch first, so the file is already
    /// durable when it closes.
    fn roll_over(&mut self) -> Result<()> {
        let closed_path = self.file_path.clone();
        let tables = self.registry.roll();

        ::metrics::counter!(WAL_ROLLOVERS).increment(1);
        info!(
            path = %closed_path.display(),
            size = self.file_size,
            writers = tables.len(),
            "Rolling over WAL"
        );
        let _ = self_notice(&self.segment_writer, SegmentNotice::Closed {
            wal_file: closed_path,
            tables,
        });

        self.file_seq += 1;
        let (file, path) = open_wal_file(&self.config.dir, self.file_seq)?;
        self.file = file;
        self.file_path = path;
        self.file_size = 0;
        self.writer_refs.clear();
        Ok(())
    }
}

fn self_notice(
    tx: &UnboundedSender<SegmentNotice>,
    notice: SegmentNotice,
) -> std::result::Result<(), ()> {
    tx.send(notice).map_err(|_| {
        warn!("Segment writer is gone, dropping notice");
    })
}

/// WAL files in the directory, sorted by name (equivalently by sequence).
fn list_wal_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".wal") else {
            continue;
        };
        let Ok(seq) = stem.parse::<u64>() else {
            warn!(name, "Ignoring unparseable WAL filename");
            continue;
        };
        files.push((seq, path));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn open_wal_file(dir: &Path, seq: u64) -> Result<(File, PathBuf)> {
    let path = dir.join(format!("{:08}.wal", seq));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok((file, path))
}

/// Replay one WAL file into recovery tables, validating checksums.
fn replay_file(
    path: &Path,
    tables: &mut HashMap<WriterId, crate::wal::memtable::MemTable>,
) -> Result<()> {
    let buf = std::fs::read(path)?;
    let mut refs: HashMap<u16, WriterId> = HashMap::new();
    let mut pos = 0;

    while pos < buf.len() {
        let Some((record, consumed)) = record::decode_record(&buf[pos..]).map_err(|e| {
            error!(path = %path.display(), offset = pos, error = %e, "WAL recovery failed");
            e
        })?
        else {
            // Torn tail from a crash mid-write; nothing past it was
            // acknowledged.
            warn!(
                path = %path.display(),
                offset = pos,
                "Torn record at WAL tail, stopping replay of this file"
            );
            break;
        };

        let writer = match &record.writer_id {
            Some(id_bytes) => {
                let writer: WriterId = bincode::deserialize(id_bytes)?;
                refs.insert(record.writer_ref, writer);
                writer
            }
            None => *refs.get(&record.writer_ref).ok_or_else(|| {
                CohortError::WalCorrupt(format!(
                    "record at offset {} references unknown writer {}",
                    pos, record.writer_ref
                ))
            })?,
        };

        let table = tables.entry(writer).or_default();
        let data = Arc::new(record.entry);
        if record.truncate {
            table.insert_truncate(record.index, record.term, data);
        } else {
            table.insert(record.index, record.term, data);
        }
        pos += consumed;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalNotice, WalRequest};
    use tempfile::tempdir;
    use tokio::sync::mpsc::unbounded_channel;

    fn test_config(dir: &Path, max_size: u64) -> WalConfig {
        WalConfig {
            dir: dir.to_path_buf(),
            max_wal_size_bytes: max_size,
            compute_checksums: true,
        }
    }

    fn open_sink(dir: &Path, max_size: u64) -> (WalSink, UnboundedReceiver<SegmentNotice>, Arc<MemTableRegistry>, BatchRing) {
        let registry = Arc::new(MemTableRegistry::new());
        let (seg_tx, seg_rx) = unbounded_channel();
        let ring = BatchRing::new();
        let sink = WalSink::open(test_config(dir, max_size), registry.clone(), seg_tx, ring.clone())
            .unwrap();
        (sink, seg_rx, registry, ring)
    }

    fn append_req(
        writer: WriterId,
        index: LogIndex,
        term: Term,
        notify: &UnboundedSender<WalNotice>,
    ) -> WalRequest {
        WalRequest::Append {
            writer,
            index,
            term,
            entry: Arc::new(vec![index as u8]),
            truncate: false,
            notify: notify.clone(),
        }
    }

    /// Four writers, one append each, queued within one mailbox drain:
    /// a single fsync batch acknowledges all four.
    #[test]
    fn test_single_batch_for_one_drain() {
        let dir = tempdir().unwrap();
        let (sink, _seg_rx, _registry, ring) = open_sink(dir.path(), u64::MAX);

        let (tx, rx) = unbounded_channel();
        let mut notice_rxs = Vec::new();
        for writer in 1..=4u64 {
            let (notify_tx, notify_rx) = unbounded_channel();
            tx.send(append_req(writer, 1, 1, &notify_tx)).unwrap();
            notice_rxs.push(notify_rx);
        }
        drop(tx);
        sink.run(rx);

        assert_eq!(ring.total_batches(), 1, "expected exactly one fsync batch");
        for mut notice_rx in notice_rxs {
            let notice = notice_rx.try_recv().unwrap();
            assert_eq!(notice, WalNotice::Written { from: 1, to: 1, term: 1 });
        }
    }

    /// A writer contributing several records to a batch gets one Written
    /// spanning its min and max indexes, with the term of the max.
    #[test]
    fn test_batched_ack_spans_writer_range() {
        let dir = tempdir().unwrap();
        let (sink, _seg_rx, _registry, _ring) = open_sink(dir.path(), u64::MAX);

        let (tx, rx) = unbounded_channel();
        let (notify_tx, mut notify_rx) = unbounded_channel();
        tx.send(append_req(7, 1, 1, &notify_tx)).unwrap();
        tx.send(append_req(7, 2, 1, &notify_tx)).unwrap();
        tx.send(append_req(7, 3, 2, &notify_tx)).unwrap();
        drop(tx);
        sink.run(rx);

        let notice = notify_rx.try_recv().unwrap();
        assert_eq!(notice, WalNotice::Written { from: 1, to: 3, term: 2 });
        assert!(notify_rx.try_recv().is_err());
    }

    /// Reaching the cap doubles max_batch_size; draining before it halves
    /// back toward the floor.
    #[test]
    fn test_adaptive_batch_sizing() {
        let dir = tempdir().unwrap();
        let (sink, _seg_rx, _registry, ring) = open_sink(dir.path(), u64::MAX);

        let (tx, rx) = unbounded_channel();
        let (notify_tx, _notify_rx) = unbounded_channel();
        for index in 1..=(MIN_MAX_BATCH as u64 + 8) {
            tx.send(append_req(1, index, 1, &notify_tx)).unwrap();
        }
        drop(tx);
        sink.run(rx);

        // First batch cut at the 16-record cap (doubling it to 32), second
        // batch drains the remaining 8.
        assert_eq!(ring.snapshot(), vec![MIN_MAX_BATCH, 8]);
    }

    /// A skipping append gets one ResendWrite; further out-of-sequence
    /// appends drop silently until a truncating write resets the writer.
    #[test]
    fn test_out_of_sequence_policy() {
        let dir = tempdir().unwrap();
        let (sink, _seg_rx, registry, _ring) = open_sink(dir.path(), u64::MAX);

        let (tx, rx) = unbounded_channel();
        let (notify_tx, mut notify_rx) = unbounded_channel();
        tx.send(append_req(1, 1, 1, &notify_tx)).unwrap();
        tx.send(append_req(1, 5, 1, &notify_tx)).unwrap(); // gap
        tx.send(append_req(1, 6, 1, &notify_tx)).unwrap(); // silent drop
        tx.send(WalRequest::Append {
            writer: 1,
            index: 2,
            term: 2,
            entry: Arc::new(vec![2]),
            truncate: true,
            notify: notify_tx.clone(),
        })
        .unwrap();
        tx.send(append_req(1, 3, 2, &notify_tx)).unwrap();
        drop(tx);
        sink.run(rx);

        let mut resends = 0;
        let mut written_to = 0;
        while let Ok(notice) = notify_rx.try_recv() {
            match notice {
                WalNotice::ResendWrite { from } => {
                    assert_eq!(from, 2);
                    resends += 1;
                }
                WalNotice::Written { to, .. } => written_to = written_to.max(to),
            }
        }
        assert_eq!(resends, 1, "exactly one resend for the gap");
        assert_eq!(written_to, 3);
        assert!(registry.lookup(1, 5).is_none(), "gap write must not be durable");
        assert!(registry.lookup(1, 6).is_none());
        assert_eq!(registry.lookup(1, 2).unwrap().term, 2);
    }

    /// Hitting the size limit rolls to a new file; open tables are promoted
    /// to closed, the segment writer is notified, and reads still resolve.
    #[test]
    fn test_rollover_promotes_tables() {
        let dir = tempdir().unwrap();
        let (sink, mut seg_rx, registry, _ring) = open_sink(dir.path(), 96);

        let (tx, rx) = unbounded_channel();
        let (notify_tx, _notify_rx) = unbounded_channel();
        for index in 1..=6u64 {
            tx.send(append_req(1, index, 1, &notify_tx)).unwrap();
        }
        drop(tx);
        sink.run(rx);

        let mut closed_files = 0;
        while let Ok(notice) = seg_rx.try_recv() {
            if let SegmentNotice::Closed { tables, .. } = notice {
                closed_files += 1;
                assert!(!tables.is_empty());
            }
        }
        assert!(closed_files >= 1, "expected at least one rollover");
        // All entries still resolve, through open or closed tables.
        for index in 1..=6u64 {
            assert!(registry.lookup(1, index).is_some(), "index {} lost", index);
        }
        let wal_files = list_wal_files(dir.path()).unwrap();
        assert!(wal_files.len() >= 2);
    }

    /// After a restart with no new writes, recovery rebuilds the same table
    /// contents that existed before.
    #[test]
    fn test_recovery_equivalence() {
        let dir = tempdir().unwrap();
        {
            let (sink, _seg_rx, registry, _ring) = open_sink(dir.path(), u64::MAX);
            let (tx, rx) = unbounded_channel();
            let (notify_tx, _notify_rx) = unbounded_channel();
            for index in 1..=5u64 {
                tx.send(append_req(1, index, 1, &notify_tx)).unwrap();
            }
            tx.send(append_req(2, 1, 3, &notify_tx)).unwrap();
            drop(tx);
            sink.run(rx);
            assert_eq!(registry.last_index(1), Some(5));
        }

        let (_sink, mut seg_rx, registry, _ring) = open_sink(dir.path(), u64::MAX);
        assert_eq!(registry.last_index(1), Some(5));
        assert_eq!(registry.last_index(2), Some(1));
        assert_eq!(registry.lookup(2, 1).unwrap().term, 3);
        match seg_rx.try_recv().unwrap() {
            SegmentNotice::Recovered { wal_files, tables } => {
                assert_eq!(wal_files.len(), 1);
                assert_eq!(tables.len(), 2);
            }
            other => panic!("expected Recovered, got {:?}", other),
        }
    }

    /// A truncating write recovered from disk shadows the tail it replaced.
    #[test]
    fn test_recovery_applies_truncation() {
        let dir = tempdir().unwrap();
        {
            let (sink, _seg_rx, _registry, _ring) = open_sink(dir.path(), u64::MAX);
            let (tx, rx) = unbounded_channel();
            let (notify_tx, _notify_rx) = unbounded_channel();
            for index in 1..=4u64 {
                tx.send(append_req(1, index, 1, &notify_tx)).unwrap();
            }
            tx.send(WalRequest::Append {
                writer: 1,
                index: 2,
                term: 2,
                entry: Arc::new(vec![9]),
                truncate: true,
                notify: notify_tx.clone(),
            })
            .unwrap();
            drop(tx);
            sink.run(rx);
        }

        let (_sink, _seg_rx, registry, _ring) = open_sink(dir.path(), u64::MAX);
        assert_eq!(registry.last_index(1), Some(2));
        assert_eq!(registry.lookup(1, 2).unwrap().term, 2);
        assert!(registry.lookup(1, 3).is_none());
    }

    /// Corrupt records fail recovery outright.
    #[test]
    fn test_recovery_checksum_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let (sink, _seg_rx, _registry, _ring) = open_sink(dir.path(), u64::MAX);
            let (tx, rx) = unbounded_channel();
            let (notify_tx, _notify_rx) = unbounded_channel();
            tx.send(append_req(1, 1, 1, &notify_tx)).unwrap();
            tx.send(append_req(1, 2, 1, &notify_tx)).unwrap();
            drop(tx);
            sink.run(rx);
        }

        // Flip a byte in the middle of the file.
        let path = list_wal_files(dir.path()).unwrap()[0].1.clone();
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let registry = Arc::new(MemTableRegistry::new());
        let (seg_tx, _seg_rx) = unbounded_channel();
        let result = WalSink::open(
            test_config(dir.path(), u64::MAX),
            registry,
            seg_tx,
            BatchRing::new(),
        );
        assert!(result.is_err());
    }

    /// force_roll_over closes the file even below the size limit.
    #[test]
    fn test_force_roll_over() {
        let dir = tempdir().unwrap();
        let (sink, mut seg_rx, _registry, _ring) = open_sink(dir.path(), u64::MAX);

        let (tx, rx) = unbounded_channel();
        let (notify_tx, _notify_rx) = unbounded_channel();
        tx.send(append_req(1, 1, 1, &notify_tx)).unwrap();
        tx.send(WalRequest::ForceRollOver).unwrap();
        drop(tx);
        sink.run(rx);

        match seg_rx.try_recv().unwrap() {
            SegmentNotice::Closed { tables, .. } => assert_eq!(tables.len(), 1),
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(list_wal_files(dir.path()).unwrap().len(), 2);
    }
}
