//! Metrics for the WAL sink and node apply loop.
//!
//! Counter names are registered through the `metrics` facade so the host
//! can attach whatever exporter it runs. The batch ring is an in-process
//! window over recent WAL batch sizes, readable without an exporter.

use parking_lot::Mutex;
use std::sync::Arc;

/// Records written to the WAL (accepted appends).
pub const WAL_RECORDS_WRITTEN: &str = "cohort_wal_records_written";
/// Completed fsync batches.
pub const WAL_BATCHES: &str = "cohort_wal_batches";
/// WAL file rollovers.
pub const WAL_ROLLOVERS: &str = "cohort_wal_rollovers";
/// Appends dropped by the out-of-sequence policy.
pub const WAL_OUT_OF_SEQ_DROPS: &str = "cohort_wal_out_of_seq_drops";
/// Entries applied to user state machines.
pub const NODE_ENTRIES_APPLIED: &str = "cohort_node_entries_applied";

const RING_CAPACITY: usize = 64;

/// Sliding window over the sizes of recently completed WAL batches.
#[derive(Debug, Clone, Default)]
pub struct BatchRing {
    inner: Arc<Mutex<RingInner>>,
}

#[derive(Debug, Default)]
struct RingInner {
    slots: Vec<usize>,
    next: usize,
    total_batches: u64,
}

impl BatchRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the ring with a completed batch's record count.
    pub fn record(&self, batch_size: usize) {
        let mut inner = self.inner.lock();
        if inner.slots.len() < RING_CAPACITY {
            inner.slots.push(batch_size);
        } else {
            let next = inner.next;
            inner.slots[next] = batch_size;
        }
        inner.next = (inner.next + 1) % RING_CAPACITY;
        inner.total_batches += 1;
        ::metrics::counter!(WAL_BATCHES).increment(1);
        ::metrics::counter!(WAL_RECORDS_WRITTEN).increment(batch_size as u64);
    }

    /// Number of batches completed over the sink's lifetime.
    pub fn total_batches(&self) -> u64 {
        self.inner.lock().total_batches
    }

    /// Mean batch size over the window, or 0.0 when empty.
    pub fn mean_batch_size(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.slots.is_empty() {
            return 0.0;
        }
        inner.slots.iter().sum::<usize>() as f64 / inner.slots.len() as f64
    }

    /// Snapshot of the window contents, oldest position first.
    pub fn snapshot(&self) -> Vec<usize> {
        self.inner.lock().slots.clone()
    }
}
