//! WAL integration tests.
//!
//! Exercise the public WAL surface: the sink thread, asynchronous Written
//! acknowledgements, rollover table promotion, recovery, and the WAL-backed
//! log facade on top.

use cohort::config::WalSettings;
use cohort::log::{InMemorySegmentStore, NodeLog, SegmentStore, WalLog};
use cohort::types::{Command, LogEntry, LogIndex, ReplyMode, Term, WriterId};
use cohort::wal::memtable::MemTableRegistry;
use cohort::wal::{self, SegmentNotice, WalHandle, WalNotice};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

// =============================================================================
// Harness
// =============================================================================

struct WalEnv {
    _dir: TempDir,
    registry: Arc<MemTableRegistry>,
    segments: Arc<InMemorySegmentStore>,
    wal: WalHandle,
    seg_rx: UnboundedReceiver<SegmentNotice>,
}

/// Capture sink tracing in test output; `RUST_LOG` controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl WalEnv {
    fn new(max_wal_size_bytes: u64) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MemTableRegistry::new());
        let segments = Arc::new(InMemorySegmentStore::new());
        let (seg_tx, seg_rx) = unbounded_channel();
        let config = WalSettings {
            dir: dir.path().join("wal"),
            max_wal_size_bytes,
            compute_checksums: true,
        };
        let wal = wal::spawn(config, registry.clone(), seg_tx).unwrap();
        Self { _dir: dir, registry, segments, wal, seg_rx }
    }

    fn reopen(self) -> Self {
        let WalEnv { _dir, registry: _, segments, .. } = self;
        let registry = Arc::new(MemTableRegistry::new());
        let (seg_tx, seg_rx) = unbounded_channel();
        let config = WalSettings {
            dir: _dir.path().join("wal"),
            ..Default::default()
        };
        let wal = wal::spawn(config, registry.clone(), seg_tx).unwrap();
        Self { _dir, registry, segments, wal, seg_rx }
    }

    fn open_log(&self, writer: WriterId, dir: &Path) -> (WalLog, UnboundedReceiver<WalNotice>) {
        let (notice_tx, notice_rx) = unbounded_channel();
        let segments: Arc<dyn SegmentStore> = self.segments.clone();
        let log = WalLog::open(
            writer,
            dir,
            self.wal.clone(),
            self.registry.clone(),
            segments,
            notice_tx,
        )
        .unwrap();
        (log, notice_rx)
    }
}

fn recv_notice(rx: &mut UnboundedReceiver<WalNotice>) -> WalNotice {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(notice) = rx.try_recv() {
            return notice;
        }
        assert!(Instant::now() < deadline, "timed out waiting for WAL notice");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Pump Written notices into the log until the watermark reaches `target`.
fn drain_until_written(log: &mut WalLog, rx: &mut UnboundedReceiver<WalNotice>, target: LogIndex) {
    while log.last_written().0 < target {
        match recv_notice(rx) {
            WalNotice::Written { from, to, term } => log.handle_written(from, to, term),
            WalNotice::ResendWrite { from } => log.handle_resend(from).unwrap(),
        }
    }
}

fn user_entry(index: LogIndex, term: Term, payload: &[u8]) -> LogEntry {
    LogEntry::new(
        index,
        term,
        Command::user(0, payload.to_vec(), ReplyMode::AfterLogAppend),
    )
}

// =============================================================================
// Batching and acknowledgement
// =============================================================================

/// Appends from several writers are acknowledged per writer with correct
/// (from, to, term) ranges.
#[test]
fn test_multi_writer_acknowledgement() {
    let env = WalEnv::new(u64::MAX);
    let data_root = env._dir.path().to_path_buf();

    let mut logs = Vec::new();
    for writer in 1..=4u64 {
        let (mut log, rx) = env.open_log(writer, &data_root.join(format!("node-{}", writer)));
        log.append(&user_entry(1, 1, b"a"), false).unwrap();
        log.append(&user_entry(2, 1, b"b"), false).unwrap();
        logs.push((log, rx));
    }

    for (log, rx) in &mut logs {
        drain_until_written(log, rx, 2);
        assert_eq!(log.last_written(), (2, 1));
    }

    // Batches completed; the ring saw every record.
    assert!(env.wal.batch_ring().total_batches() >= 1);
}

// =============================================================================
// S5: rollover mid-write
// =============================================================================

/// Crossing the size limit rolls to a new file; reads of affected writers
/// still resolve through the closed tables.
#[test]
fn test_rollover_keeps_reads_resolving() {
    let mut env = WalEnv::new(256);
    let data_root = env._dir.path().to_path_buf();
    let (mut log, mut rx) = env.open_log(1, &data_root.join("node-1"));

    for index in 1..=16u64 {
        log.append(&user_entry(index, 1, &[index as u8; 24]), false).unwrap();
    }
    drain_until_written(&mut log, &mut rx, 16);

    // At least one rollover happened and handed tables to the segment
    // writer.
    let mut saw_closed = false;
    while let Ok(notice) = env.seg_rx.try_recv() {
        if let SegmentNotice::Closed { wal_file, tables } = notice {
            saw_closed = true;
            assert!(wal_file.exists());
            assert!(!tables.is_empty());
        }
    }
    assert!(saw_closed, "expected a rollover below the size limit");

    // Every entry is still readable through the facade.
    let entries = log.fetch(1, 16).unwrap();
    assert_eq!(entries.len(), 16);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.index, i as u64 + 1);
    }
}

/// force_roll_over closes the current file on demand.
#[test]
fn test_force_roll_over_promotes_tables() {
    let mut env = WalEnv::new(u64::MAX);
    let data_root = env._dir.path().to_path_buf();
    let (mut log, mut rx) = env.open_log(1, &data_root.join("node-1"));

    log.append(&user_entry(1, 1, b"x"), false).unwrap();
    drain_until_written(&mut log, &mut rx, 1);
    env.wal.force_roll_over().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match env.seg_rx.try_recv() {
            Ok(SegmentNotice::Closed { tables, .. }) => {
                assert_eq!(tables.len(), 1);
                break;
            }
            Ok(_) => {}
            Err(_) => {
                assert!(Instant::now() < deadline, "no rollover notice");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    // The entry now lives in a closed table and still resolves.
    assert_eq!(env.registry.table_counts(1).0, 0);
    assert_eq!(log.fetch_term(1), Some(1));
}

// =============================================================================
// Recovery
// =============================================================================

/// Restarting the WAL with no new writes reproduces the same readable
/// state.
#[test]
fn test_recovery_round_trip() {
    let env = WalEnv::new(u64::MAX);
    let data_root = env._dir.path().to_path_buf();
    {
        let (mut log, mut rx) = env.open_log(1, &data_root.join("node-1"));
        for index in 1..=8u64 {
            log.append(&user_entry(index, 2, &[index as u8]), false).unwrap();
        }
        drain_until_written(&mut log, &mut rx, 8);
    }

    let mut env = env.reopen();
    match recv_segment_notice(&mut env.seg_rx) {
        SegmentNotice::Recovered { wal_files, tables } => {
            assert_eq!(wal_files.len(), 1);
            assert_eq!(tables.len(), 1);
        }
        other => panic!("expected Recovered, got {:?}", other),
    }

    let (log, _rx) = env.open_log(1, &data_root.join("node-1"));
    assert_eq!(log.last_index_term(), (8, 2));
    assert_eq!(log.last_written(), (8, 2));
    let entries = log.fetch(1, 8).unwrap();
    assert_eq!(entries.len(), 8);
}

fn recv_segment_notice(rx: &mut UnboundedReceiver<SegmentNotice>) -> SegmentNotice {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(notice) = rx.try_recv() {
            return notice;
        }
        assert!(Instant::now() < deadline, "timed out waiting for segment notice");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A truncating write survives recovery: the replaced tail stays gone.
#[test]
fn test_recovery_preserves_truncation() {
    let env = WalEnv::new(u64::MAX);
    let data_root = env._dir.path().to_path_buf();
    {
        let (mut log, mut rx) = env.open_log(1, &data_root.join("node-1"));
        for index in 1..=5u64 {
            log.append(&user_entry(index, 1, b"v1"), false).unwrap();
        }
        log.append(&user_entry(3, 2, b"v2"), true).unwrap();
        drain_until_written(&mut log, &mut rx, 3);
    }

    let env = env.reopen();
    let (log, _rx) = env.open_log(1, &data_root.join("node-1"));
    assert_eq!(log.last_index_term(), (3, 2));
    assert_eq!(log.fetch_term(3), Some(2));
    assert_eq!(log.fetch_term(4), None);
}

// =============================================================================
// Segment store fallback
// =============================================================================

/// Once closed tables are flushed and purged, reads fall through to the
/// segment store.
#[test]
fn test_reads_fall_through_to_segments() {
    let mut env = WalEnv::new(u64::MAX);
    let data_root = env._dir.path().to_path_buf();
    let (mut log, mut rx) = env.open_log(1, &data_root.join("node-1"));

    log.append(&user_entry(1, 1, b"flushed"), false).unwrap();
    drain_until_written(&mut log, &mut rx, 1);
    env.wal.force_roll_over().unwrap();

    // Play the segment writer: copy the closed table into the segment
    // store, then purge it from the registry.
    match recv_segment_notice(&mut env.seg_rx) {
        SegmentNotice::Closed { tables, .. } => {
            for (writer, closed) in tables {
                for (index, entry) in closed.table.range(1, u64::MAX) {
                    env.segments.insert(writer, index, entry.term, entry.data.clone());
                }
                env.registry.purge_closed(writer, closed.seq);
            }
        }
        other => panic!("expected Closed, got {:?}", other),
    }

    assert!(env.registry.lookup(1, 1).is_none());
    let entries = log.fetch(1, 1).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].index, 1);
}
