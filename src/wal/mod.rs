//! Shared write-ahead log.
//!
//! One WAL sink per process serialises appends from every co-located node
//! into a single on-disk file, fsync-batched for throughput. Accepted
//! entries are simultaneously inserted into per-writer mem-tables
//! ([`memtable::MemTableRegistry`]) so readers can resolve them before the
//! segment writer flushes closed tables to segment files.
//!
//! Acknowledgement is asynchronous: an accepted append produces a
//! [`WalNotice::Written`] on the writer's notice channel after the batch
//! containing it has been fsynced.

// unwrap() panics in the sink lose acknowledged data guarantees.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod memtable;
pub mod record;
mod sink;

pub use sink::{MAX_MAX_BATCH, MIN_MAX_BATCH};

use crate::config::WalSettings;
use crate::error::{CohortError, Result};
use crate::metrics::BatchRing;
use crate::types::{LogIndex, Term, WriterId};
use memtable::{ClosedTable, MemTableRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// WAL configuration (directory, rollover threshold, checksums).
pub type WalConfig = WalSettings;

/// Notices delivered to a writer on its notice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalNotice {
    /// Every append in `[from, to]` for this writer is durable; `term` is
    /// the term of the highest acknowledged record.
    Written { from: LogIndex, to: LogIndex, term: Term },
    /// An append skipped ahead; resend everything from `from` onward (or
    /// issue a truncating write) to resume.
    ResendWrite { from: LogIndex },
}

/// Requests into the sink mailbox.
#[derive(Debug)]
pub(crate) enum WalRequest {
    Append {
        writer: WriterId,
        index: LogIndex,
        term: Term,
        entry: Arc<Vec<u8>>,
        truncate: bool,
        notify: UnboundedSender<WalNotice>,
    },
    ForceRollOver,
}

/// Notifications handed to the segment writer collaborator.
#[derive(Debug)]
pub enum SegmentNotice {
    /// A WAL file closed at rollover, together with the mem-tables promoted
    /// to the closed index for it.
    Closed {
        wal_file: PathBuf,
        tables: Vec<(WriterId, ClosedTable)>,
    },
    /// Tables rebuilt from existing WAL files during startup recovery.
    Recovered {
        wal_files: Vec<PathBuf>,
        tables: Vec<(WriterId, ClosedTable)>,
    },
}

/// Cloneable handle to the WAL sink.
///
/// All operations enqueue; results arrive on the notice channel supplied
/// per append. Operations fail with [`CohortError::WalDown`] once the sink
/// thread has exited.
#[derive(Clone)]
pub struct WalHandle {
    tx: UnboundedSender<WalRequest>,
    ring: BatchRing,
}

impl WalHandle {
    /// Enqueue an append for `(writer, index, term)`.
    pub fn append(
        &self,
        writer: WriterId,
        index: LogIndex,
        term: Term,
        entry: Arc<Vec<u8>>,
        notify: UnboundedSender<WalNotice>,
    ) -> Result<()> {
        self.send(WalRequest::Append { writer, index, term, entry, truncate: false, notify })
    }

    /// Enqueue a truncating append: readers treat all of the writer's
    /// entries at and after `index` as replaced by this one.
    pub fn truncate_write(
        &self,
        writer: WriterId,
        index: LogIndex,
        term: Term,
        entry: Arc<Vec<u8>>,
        notify: UnboundedSender<WalNotice>,
    ) -> Result<()> {
        self.send(WalRequest::Append { writer, index, term, entry, truncate: true, notify })
    }

    /// Close the current file and open a new one. Testing aid.
    pub fn force_roll_over(&self) -> Result<()> {
        self.send(WalRequest::ForceRollOver)
    }

    /// Window over recent batch sizes.
    pub fn batch_ring(&self) -> &BatchRing {
        &self.ring
    }

    fn send(&self, request: WalRequest) -> Result<()> {
        self.tx.send(request).map_err(|_| CohortError::WalDown)
    }
}

/// Recover any existing WAL files and start the sink thread.
///
/// The segment writer must already be reachable: recovery hands it the
/// rebuilt tables before the first fresh file opens.
pub fn spawn(
    config: WalConfig,
    registry: Arc<MemTableRegistry>,
    segment_writer: UnboundedSender<SegmentNotice>,
) -> Result<WalHandle> {
    let ring = BatchRing::new();
    let sink = sink::WalSink::open(config, registry, segment_writer, ring.clone())?;
    let (tx, rx) = unbounded_channel();
    std::thread::Builder::new()
        .name("cohort-wal".to_string())
        .spawn(move || sink.run(rx))?;
    Ok(WalHandle { tx, ring })
}
