//! Scavenge metrics tracking
//!
//! Thread-safe counters for scavenge runs using atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Thread-safe metrics for tracking scavenge runs
#[derive(Debug, Clone)]
pub struct ScavengeMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    runs_started: AtomicUsize,
    runs_succeeded: AtomicUsize,
    runs_failed: AtomicUsize,
    chunks_scavenged: AtomicUsize,
    chunks_skipped: AtomicUsize,
    chunks_merged: AtomicUsize,
    chunks_removed: AtomicUsize,
    records_discarded: AtomicU64,
    index_entries_removed: AtomicU64,
    bytes_saved: AtomicU64,
}

impl Default for ScavengeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScavengeMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                runs_started: AtomicUsize::new(0),
                runs_succeeded: AtomicUsize::new(0),
                runs_failed: AtomicUsize::new(0),
                chunks_scavenged: AtomicUsize::new(0),
                chunks_skipped: AtomicUsize::new(0),
                chunks_merged: AtomicUsize::new(0),
                chunks_removed: AtomicUsize::new(0),
                records_discarded: AtomicU64::new(0),
                index_entries_removed: AtomicU64::new(0),
                bytes_saved: AtomicU64::new(0),
            }),
        }
    }

    pub fn record_run_start(&self) {
        self.inner.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_success(&self) {
        self.inner.runs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_failure(&self) {
        self.inner.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk rewritten without its discarded records
    pub fn record_chunk_scavenged(&self, records_discarded: u64, bytes_saved: u64) {
        self.inner.chunks_scavenged.fetch_add(1, Ordering::Relaxed);
        self.inner
            .records_discarded
            .fetch_add(records_discarded, Ordering::Relaxed);
        self.inner
            .bytes_saved
            .fetch_add(bytes_saved, Ordering::Relaxed);
    }

    pub fn record_chunk_skipped(&self) {
        self.inner.chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunks_merged(&self, chunks: usize, bytes_saved: u64) {
        self.inner.chunks_merged.fetch_add(chunks, Ordering::Relaxed);
        self.inner
            .bytes_saved
            .fetch_add(bytes_saved, Ordering::Relaxed);
    }

    pub fn record_chunk_removed(&self) {
        self.inner.chunks_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_entries_removed(&self, entries: u64) {
        self.inner
            .index_entries_removed
            .fetch_add(entries, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            runs_started: self.inner.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.inner.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.inner.runs_failed.load(Ordering::Relaxed),
            chunks_scavenged: self.inner.chunks_scavenged.load(Ordering::Relaxed),
            chunks_skipped: self.inner.chunks_skipped.load(Ordering::Relaxed),
            chunks_merged: self.inner.chunks_merged.load(Ordering::Relaxed),
            chunks_removed: self.inner.chunks_removed.load(Ordering::Relaxed),
            records_discarded: self.inner.records_discarded.load(Ordering::Relaxed),
            index_entries_removed: self.inner.index_entries_removed.load(Ordering::Relaxed),
            bytes_saved: self.inner.bytes_saved.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub runs_started: usize,
    pub runs_succeeded: usize,
    pub runs_failed: usize,
    pub chunks_scavenged: usize,
    pub chunks_skipped: usize,
    pub chunks_merged: usize,
    pub chunks_removed: usize,
    pub records_discarded: u64,
    pub index_entries_removed: u64,
    pub bytes_saved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_shared_between_clones() {
        let metrics = ScavengeMetrics::new();
        let clone = metrics.clone();

        clone.record_run_start();
        clone.record_chunk_scavenged(3, 120);
        clone.record_chunks_merged(2, 40);
        clone.record_index_entries_removed(7);
        metrics.record_run_success();

        let summary = metrics.summary();
        assert_eq!(summary.runs_started, 1);
        assert_eq!(summary.runs_succeeded, 1);
        assert_eq!(summary.chunks_scavenged, 1);
        assert_eq!(summary.chunks_merged, 2);
        assert_eq!(summary.records_discarded, 3);
        assert_eq!(summary.index_entries_removed, 7);
        assert_eq!(summary.bytes_saved, 160);
    }
}
