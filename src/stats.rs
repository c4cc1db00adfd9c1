//! Pipeline counters shared by the tailers, the batcher and the coordinator.
//!
//! All counters are lock-free atomics; tasks hold an `Arc<PipelineStats>` and
//! only ever add to them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters for the shipping pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    logs_read: AtomicU64,
    logs_sent: AtomicU64,
    logs_failed: AtomicU64,
    logs_dropped: AtomicU64,
    logs_abandoned: AtomicU64,
    batches_sent: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry was placed into the queue.
    pub fn record_read(&self) {
        self.logs_read.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch of `count` entries was accepted by the collector.
    pub fn record_sent(&self, count: usize) {
        self.logs_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch of `count` entries was given up on after exhausting retries.
    pub fn record_failed(&self, count: usize) {
        self.logs_failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// An entry was rejected by a full queue. Drops also count as failures.
    pub fn record_dropped(&self) {
        self.logs_dropped.fetch_add(1, Ordering::Relaxed);
        self.logs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries still queued when the shutdown deadline expired.
    pub fn record_abandoned(&self, count: usize) {
        self.logs_abandoned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            logs_read: self.logs_read.load(Ordering::Relaxed),
            logs_sent: self.logs_sent.load(Ordering::Relaxed),
            logs_failed: self.logs_failed.load(Ordering::Relaxed),
            logs_dropped: self.logs_dropped.load(Ordering::Relaxed),
            logs_abandoned: self.logs_abandoned.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub logs_read: u64,
    pub logs_sent: u64,
    pub logs_failed: u64,
    pub logs_dropped: u64,
    pub logs_abandoned: u64,
    pub batches_sent: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read={} sent={} failed={} dropped={} abandoned={} batches={}",
            self.logs_read,
            self.logs_sent,
            self.logs_failed,
            self.logs_dropped,
            self.logs_abandoned,
            self.batches_sent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(PipelineStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_sent_and_failed_accounting() {
        let stats = PipelineStats::new();
        stats.record_sent(50);
        stats.record_sent(5);
        stats.record_failed(7);

        let snap = stats.snapshot();
        assert_eq!(snap.logs_sent, 55);
        assert_eq!(snap.batches_sent, 2);
        assert_eq!(snap.logs_failed, 7);
    }

    #[test]
    fn test_drop_counts_as_failure() {
        let stats = PipelineStats::new();
        stats.record_dropped();
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.logs_dropped, 2);
        assert_eq!(snap.logs_failed, 2);
        assert_eq!(snap.logs_read, 0);
    }

    #[test]
    fn test_concurrent_reads() {
        let stats = Arc::new(PipelineStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_read();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().logs_read, 4000);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = PipelineStats::new();
        stats.record_read();
        stats.record_abandoned(3);
        assert_eq!(
            stats.snapshot().to_string(),
            "read=1 sent=0 failed=0 dropped=0 abandoned=3 batches=0"
        );
    }
}
