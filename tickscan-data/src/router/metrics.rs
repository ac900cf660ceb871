use crate::event::TickKind;
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Lock-free counters for one processing channel.
#[derive(Debug)]
pub struct ChannelMetrics {
    kind: TickKind,
    started: Instant,
    accepted: AtomicU64,
    processed: AtomicU64,
    shed: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl ChannelMetrics {
    pub fn new(kind: TickKind) -> Self {
        Self {
            kind,
            started: Instant::now(),
            accepted: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            shed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Either a queued item was shed to make room, or the incoming item was dropped.
    pub fn record_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, failed: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot the counters alongside the current backlog `depth`.
    pub fn snapshot(&self, depth: usize) -> ChannelHealth {
        let processed = self.processed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();

        ChannelHealth {
            kind: self.kind,
            depth,
            accepted: self.accepted.load(Ordering::Relaxed),
            processed,
            shed: self.shed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors,
            throughput_per_sec: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            error_rate: if processed > 0 {
                errors as f64 / processed as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time health of a processing channel.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ChannelHealth {
    pub kind: TickKind,
    pub depth: usize,
    pub accepted: u64,
    pub processed: u64,
    pub shed: u64,
    pub rejected: u64,
    pub errors: u64,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = ChannelMetrics::new(TickKind::Trade);
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_shed();
        metrics.record_shed();
        metrics.record_rejected();
        metrics.record_processed(false);
        metrics.record_processed(true);

        let health = metrics.snapshot(0);
        assert_eq!(health.kind, TickKind::Trade);
        assert_eq!(health.accepted, 3);
        assert_eq!(health.depth, 0);
        assert_eq!(health.shed, 2);
        assert_eq!(health.rejected, 1);
        assert_eq!(health.processed, 2);
        assert_eq!(health.errors, 1);
        assert_eq!(health.error_rate, 0.5);
    }
}
