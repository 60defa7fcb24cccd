//! Synchronization metrics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for monitoring the synchronization layer
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub notifications_received: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub refetches_executed: AtomicU64,
    pub refetches_coalesced: AtomicU64,
    pub operations_dropped: AtomicU64,
    pub resyncs: AtomicU64,
}

impl SyncMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Round-trips performed by refetches, forced or not
    pub fn refetch_count(&self) -> u64 {
        self.refetches_executed.load(Ordering::Relaxed)
    }

    /// Non-forced refetches merged into a pending one
    pub fn coalesced_count(&self) -> u64 {
        self.refetches_coalesced.load(Ordering::Relaxed)
    }

    /// Operations that became no-ops when they ran
    pub fn dropped_count(&self) -> u64 {
        self.operations_dropped.load(Ordering::Relaxed)
    }

    /// Invalidation batches dispatched
    pub fn batch_count(&self) -> u64 {
        self.batches_dispatched.load(Ordering::Relaxed)
    }

    /// Times the connection opened
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }
}
