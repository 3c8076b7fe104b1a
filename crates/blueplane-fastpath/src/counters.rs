//! Fast-Path Observable Counters
//!
//! Shared atomics exposed through the in-process health surface. The
//! surrounding read API projects them; the core defines no transport.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FastPathCounters {
    events_read: AtomicU64,
    batches_committed: AtomicU64,
    batches_failed: AtomicU64,
    cdc_published: AtomicU64,
    ack_failed: AtomicU64,
    dlq_written: AtomicU64,
}

/// Point-in-time copy of the fast-path counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FastPathStats {
    pub events_read: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub cdc_published: u64,
    pub ack_failed: u64,
    pub dlq_written: u64,
}

impl FastPathCounters {
    pub fn add_events_read(&self, n: u64) {
        self.events_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_batches_committed(&self) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cdc_published(&self, n: u64) {
        self.cdc_published.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_ack_failed(&self) {
        self.ack_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dlq_written(&self) {
        self.dlq_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FastPathStats {
        FastPathStats {
            events_read: self.events_read.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            cdc_published: self.cdc_published.load(Ordering::Relaxed),
            ack_failed: self.ack_failed.load(Ordering::Relaxed),
            dlq_written: self.dlq_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let counters = FastPathCounters::default();
        counters.add_events_read(3);
        counters.incr_batches_committed();
        counters.add_cdc_published(3);
        counters.incr_dlq_written();

        let stats = counters.snapshot();
        assert_eq!(stats.events_read, 3);
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.cdc_published, 3);
        assert_eq!(stats.dlq_written, 1);
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(stats.ack_failed, 0);
    }
}
