//! Record of what each scavenge did.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::collaborators::PhysicalChunk;
use crate::metrics::ScavengeMetrics;
use crate::model::ScavengePoint;

/// Terminal result of a scavenge run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ScavengeResult {
    Success,
    /// Cancelled; committed progress is kept
    Stopped,
    Errored,
    /// A precondition or data integrity check failed
    Failed,
}

impl fmt::Display for ScavengeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Summary of one scavenge, kept in memory by [`ScavengeHistory`]
#[derive(Clone, Debug, Serialize)]
pub struct ScavengeRecord {
    pub scavenge_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scavenge_point: Option<String>,
    pub threshold: Option<i32>,
    pub threads: usize,
    pub result: Option<ScavengeResult>,
    pub error: Option<String>,
    pub chunks_scavenged: usize,
    pub chunks_not_scavenged: usize,
    pub chunks_merged: usize,
    pub chunks_removed: usize,
    pub index_entries_removed: u64,
    pub space_saved: i64,
}

impl ScavengeRecord {
    fn new(scavenge_id: Uuid, threads: usize) -> Self {
        Self {
            scavenge_id,
            started_at: Utc::now(),
            completed_at: None,
            scavenge_point: None,
            threshold: None,
            threads,
            result: None,
            error: None,
            chunks_scavenged: 0,
            chunks_not_scavenged: 0,
            chunks_merged: 0,
            chunks_removed: 0,
            index_entries_removed: 0,
            space_saved: 0,
        }
    }
}

/// Per-scavenge log handed to the stages.
///
/// Every entry is written to the shared record, counted in the metrics and
/// logged.
#[derive(Clone)]
pub struct ScavengerLog {
    scavenge_id: Uuid,
    record: Arc<Mutex<ScavengeRecord>>,
    metrics: ScavengeMetrics,
}

impl ScavengerLog {
    /// A log that is not kept in any history
    pub fn detached(threads: usize) -> Self {
        let scavenge_id = Uuid::new_v4();
        Self {
            scavenge_id,
            record: Arc::new(Mutex::new(ScavengeRecord::new(scavenge_id, threads))),
            metrics: ScavengeMetrics::new(),
        }
    }

    pub fn scavenge_id(&self) -> Uuid {
        self.scavenge_id
    }

    pub fn metrics(&self) -> &ScavengeMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> ScavengeRecord {
        self.record.lock().clone()
    }

    pub fn scavenge_started(&self, scavenge_point: &ScavengePoint) {
        info!(
            scavenge_id = %self.scavenge_id,
            scavenge_point = %scavenge_point,
            threshold = scavenge_point.threshold,
            "Scavenge started"
        );
        let mut record = self.record.lock();
        record.scavenge_point = Some(scavenge_point.name());
        record.threshold = Some(scavenge_point.threshold);
    }

    pub fn chunks_scavenged(
        &self,
        chunk: &PhysicalChunk,
        records_discarded: u64,
        elapsed: Duration,
        space_saved: i64,
    ) {
        info!(
            scavenge_id = %self.scavenge_id,
            chunk = %chunk,
            records_discarded,
            space_saved,
            elapsed_ms = elapsed.as_millis() as u64,
            "Chunk scavenged"
        );
        self.metrics
            .record_chunk_scavenged(records_discarded, space_saved.max(0) as u64);
        let mut record = self.record.lock();
        record.chunks_scavenged += 1;
        record.space_saved += space_saved;
    }

    pub fn chunks_not_scavenged(&self, chunk: &PhysicalChunk, reason: &str) {
        tracing::debug!(
            scavenge_id = %self.scavenge_id,
            chunk = %chunk,
            reason,
            "Chunk not scavenged"
        );
        self.metrics.record_chunk_skipped();
        self.record.lock().chunks_not_scavenged += 1;
    }

    pub fn chunks_merged(&self, chunks: &[PhysicalChunk], space_saved: i64) {
        let first = chunks.first().map(|c| c.chunk_start_number).unwrap_or(0);
        let last = chunks.last().map(|c| c.chunk_end_number).unwrap_or(0);
        info!(
            scavenge_id = %self.scavenge_id,
            chunks = chunks.len(),
            first,
            last,
            space_saved,
            "Chunks merged"
        );
        self.metrics
            .record_chunks_merged(chunks.len(), space_saved.max(0) as u64);
        let mut record = self.record.lock();
        record.chunks_merged += chunks.len();
        record.space_saved += space_saved;
    }

    pub fn chunks_removed(&self, chunk: &PhysicalChunk, reason: &str) {
        info!(
            scavenge_id = %self.scavenge_id,
            chunk = %chunk,
            reason,
            "Chunk removed"
        );
        self.metrics.record_chunk_removed();
        self.record.lock().chunks_removed += 1;
    }

    pub fn index_executed(&self, entries_removed: u64, elapsed: Duration) {
        info!(
            scavenge_id = %self.scavenge_id,
            entries_removed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Index scavenged"
        );
        self.metrics.record_index_entries_removed(entries_removed);
        self.record.lock().index_entries_removed += entries_removed;
    }

    pub fn scavenge_completed(&self, result: ScavengeResult, error: Option<&str>, elapsed: Duration) {
        let mut record = self.record.lock();
        info!(
            scavenge_id = %self.scavenge_id,
            result = %result,
            error = error.unwrap_or(""),
            space_saved = record.space_saved,
            elapsed_ms = elapsed.as_millis() as u64,
            "Scavenge completed"
        );
        match result {
            ScavengeResult::Success => self.metrics.record_run_success(),
            _ => self.metrics.record_run_failure(),
        }
        record.completed_at = Some(Utc::now());
        record.result = Some(result);
        record.error = error.map(str::to_string);
    }

    pub fn space_saved(&self) -> i64 {
        self.record.lock().space_saved
    }
}

/// In-memory history of scavenges, keyed by scavenge id.
#[derive(Clone, Default)]
pub struct ScavengeHistory {
    records: Arc<RwLock<BTreeMap<Uuid, Arc<Mutex<ScavengeRecord>>>>>,
    metrics: ScavengeMetrics,
}

impl ScavengeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &ScavengeMetrics {
        &self.metrics
    }

    /// Open the log of a new scavenge
    pub fn begin(&self, threads: usize) -> ScavengerLog {
        let scavenge_id = Uuid::new_v4();
        let record = Arc::new(Mutex::new(ScavengeRecord::new(scavenge_id, threads)));
        self.records.write().insert(scavenge_id, record.clone());
        self.metrics.record_run_start();
        ScavengerLog {
            scavenge_id,
            record,
            metrics: self.metrics.clone(),
        }
    }

    pub fn get(&self, scavenge_id: &Uuid) -> Option<ScavengeRecord> {
        self.records
            .read()
            .get(scavenge_id)
            .map(|record| record.lock().clone())
    }

    /// Newest first
    pub fn list(&self) -> Vec<ScavengeRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .map(|record| record.lock().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chunk(n: i32) -> PhysicalChunk {
        PhysicalChunk {
            name: format!("chunk-{n:06}"),
            chunk_start_number: n,
            chunk_end_number: n,
            chunk_start_position: i64::from(n) * 100,
            chunk_end_position: i64::from(n + 1) * 100,
            file_size: 100,
            is_read_only: true,
            is_remote: false,
            is_raw: false,
        }
    }

    #[test]
    fn test_history_tracks_log_entries() {
        let history = ScavengeHistory::new();
        let log = history.begin(2);
        let sp = ScavengePoint::new(
            250,
            0,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            0,
        );

        log.scavenge_started(&sp);
        log.chunks_scavenged(&chunk(0), 3, Duration::from_millis(5), 60);
        log.chunks_not_scavenged(&chunk(1), "below threshold");
        log.chunks_merged(&[chunk(0), chunk(1)], 20);
        log.index_executed(4, Duration::from_millis(1));
        log.scavenge_completed(ScavengeResult::Success, None, Duration::from_millis(10));

        let record = history.get(&log.scavenge_id()).unwrap();
        assert_eq!(record.scavenge_point.as_deref(), Some("SP-0"));
        assert_eq!(record.chunks_scavenged, 1);
        assert_eq!(record.chunks_not_scavenged, 1);
        assert_eq!(record.chunks_merged, 2);
        assert_eq!(record.index_entries_removed, 4);
        assert_eq!(record.space_saved, 80);
        assert_eq!(record.result, Some(ScavengeResult::Success));
        assert!(record.completed_at.is_some());

        let summary = history.metrics().summary();
        assert_eq!(summary.runs_started, 1);
        assert_eq!(summary.runs_succeeded, 1);
        assert_eq!(summary.chunks_skipped, 1);
    }

    #[test]
    fn test_list_is_newest_first() {
        let history = ScavengeHistory::new();
        let first = history.begin(1);
        std::thread::sleep(Duration::from_millis(2));
        let second = history.begin(1);
        let ids: Vec<_> = history.list().into_iter().map(|r| r.scavenge_id).collect();
        assert_eq!(ids, vec![second.scavenge_id(), first.scavenge_id()]);
    }
}
