//! Per-node log facade.
//!
//! A node owns a [`NodeLog`]: the append/fetch/term/snapshot capability
//! backing its replicated log. Two implementations exist: [`MemLog`] keeps
//! everything in memory (tests, embedded single-node use), [`WalLog`]
//! writes through the shared WAL and resolves reads against the mem-table
//! registry, the segment store and the snapshot file.
//!
//! Appends are asynchronous on the durable backend: the log surfaces a
//! `Written` watermark (`last_written`) that trails `last_index` until the
//! WAL acknowledges the fsync.

mod mem;
mod meta;
mod segments;
mod snapshot;
mod wal_log;

pub use mem::MemLog;
pub use meta::LogMeta;
pub use segments::{InMemorySegmentStore, SegmentStore};
pub use snapshot::{SnapshotData, SnapshotMeta};
pub use wal_log::WalLog;

use crate::error::Result;
use crate::types::{LogEntry, LogIndex, Term};

/// Outcome of an append through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Durability pending; a `Written` notice will arrive from the WAL.
    Queued,
    /// Immediately durable (in-memory backend). The caller schedules the
    /// written event itself.
    Written { from: LogIndex, to: LogIndex, term: Term },
}

/// The log capability consumed by the node state machine.
///
/// Handlers never suspend: every operation is either in-memory or a
/// non-blocking enqueue toward the WAL sink, except the explicit metadata
/// fsync (`sync_meta`).
pub trait NodeLog: Send {
    /// Append one entry at its index. With `truncate`, readers treat all
    /// entries at and after `entry.index` as replaced by this one.
    fn append(&mut self, entry: &LogEntry, truncate: bool) -> Result<AppendOutcome>;

    /// Fetch entries in `[from, to]`, ascending. Indexes at or below the
    /// snapshot boundary are skipped.
    fn fetch(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>>;

    /// Term of the entry at `index`. Index 0 and the snapshot boundary
    /// resolve; entries beyond the log do not.
    fn fetch_term(&self, index: LogIndex) -> Option<Term>;

    /// Whether an entry with exactly `(index, term)` exists (index 0 and
    /// the snapshot boundary count).
    fn exists(&self, index: LogIndex, term: Term) -> bool {
        self.fetch_term(index) == Some(term)
    }

    /// Index and term of the last appended entry.
    fn last_index_term(&self) -> (LogIndex, Term);

    /// Index and term of the last entry known durable.
    fn last_written(&self) -> (LogIndex, Term);

    /// Index the next appended entry will take.
    fn next_index(&self) -> LogIndex {
        self.last_index_term().0 + 1
    }

    /// Install a snapshot, discarding entries it covers.
    fn write_snapshot(&mut self, snapshot: SnapshotData) -> Result<()>;

    /// Read back the installed snapshot, if any.
    fn read_snapshot(&self) -> Result<Option<SnapshotData>>;

    /// Index and term the current snapshot covers, `(0, 0)` without one.
    fn snapshot_index_term(&self) -> (LogIndex, Term);

    /// Record that everything at or below `index` may be compacted.
    fn update_release_cursor(&mut self, index: LogIndex) -> Result<()>;

    /// Advance the durable watermark from a WAL `Written` notice.
    fn handle_written(&mut self, from: LogIndex, to: LogIndex, term: Term);

    /// Re-submit unacknowledged entries from `from` onward after the WAL
    /// requested a resend.
    fn handle_resend(&mut self, from: LogIndex) -> Result<()>;

    /// Update cached metadata (`current_term`, `voted_for`).
    fn write_meta(&mut self, meta: LogMeta) -> Result<()>;

    /// Read metadata as last persisted.
    fn read_meta(&self) -> Result<LogMeta>;

    /// Fsync metadata. Must complete before a vote is sent or a higher
    /// term is acted on.
    fn sync_meta(&mut self) -> Result<()>;

    /// Release resources. Further operations may fail.
    fn close(&mut self);
}
