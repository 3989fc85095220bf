//! Scavenges that are stopped, restarted, or run again over the same state.

use std::sync::Arc;

use common::testing::TestConfigBuilder;
use scavenger::history::ScavengeResult;
use scavenger::model::{DiscardPoint, ScavengeCheckpoint, StreamMetadata};
use scavenger::state::SqliteKvStore;
use scavenger::state::kv::KvStore;
use scavenger::testing::{HumanReadableHasher, MemoryLog, ScavengeHarness, ScavengeRun};

/// Work for every stage: two chunks to rewrite and merge, two streams to
/// calculate in separate batches
fn busy_log() -> MemoryLog {
    let log = MemoryLog::new().with_hasher(Arc::new(HumanReadableHasher));
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_events("ab-1", 3);
    log.write_events("cd-1", 2);
    log.complete_chunk();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));
    log.write_metadata("cd-1", &StreamMetadata::with_max_count(1));
    log
}

fn chunk_ranges(log: &MemoryLog) -> Vec<(i32, i32)> {
    log.physical_chunks()
        .iter()
        .map(|chunk| (chunk.chunk_start_number, chunk.chunk_end_number))
        .collect()
}

/// Scavenge the busy log straight through, and a second copy stopped when
/// `line` is traced then resumed. Both must end up the same.
async fn resume_after(line: &str) -> ScavengeRun {
    let config = TestConfigBuilder::new().with_checkpoint_period(1).build();

    let uninterrupted = busy_log();
    let expected = ScavengeHarness::new(&uninterrupted)
        .with_config(config.clone())
        .run()
        .await;
    assert_eq!(expected.outcome.result, ScavengeResult::Success);

    let log = busy_log();
    let harness = ScavengeHarness::new(&log).with_config(config).cancel_on(line);
    let stopped = harness.run().await;
    assert_eq!(stopped.outcome.result, ScavengeResult::Stopped, "stopping on {line}");

    let resumed = harness.without_cancel().run().await;
    assert_eq!(resumed.outcome.result, ScavengeResult::Success, "resuming after {line}");
    assert_eq!(
        resumed.outcome.scavenge_point.as_ref().map(|sp| sp.event_number),
        Some(0)
    );
    assert_eq!(log.scavenge_points().len(), 1);

    for stream in ["ab-1", "cd-1", "$$ab-1", "$$cd-1"] {
        assert_eq!(
            log.event_numbers(stream),
            uninterrupted.event_numbers(stream),
            "records of {stream} after resuming from {line}"
        );
        assert_eq!(
            log.index_event_numbers(stream),
            uninterrupted.index_event_numbers(stream),
            "index of {stream} after resuming from {line}"
        );
    }
    assert_eq!(chunk_ranges(&log), chunk_ranges(&uninterrupted));
    resumed
}

#[tokio::test]
async fn test_resumes_accumulation_after_cancel() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 5);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));

    let harness =
        ScavengeHarness::new(&log).cancel_on("Checkpoint: Accumulating SP-0 done None");
    let stopped = harness.run().await;
    assert_eq!(stopped.outcome.result, ScavengeResult::Stopped);
    assert_eq!(stopped.outcome.error, None);
    assert!(stopped.traced("Rollback"));
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2, 3, 4]);

    let harness = harness.without_cancel();
    let resumed = harness.run().await;
    assert_eq!(resumed.outcome.result, ScavengeResult::Success);
    assert!(resumed.traced("Checkpoint: Accumulating SP-0 done Chunk 0"));
    assert_eq!(resumed.outcome.scavenge_point.map(|sp| sp.event_number), Some(0));
    assert_eq!(log.scavenge_points().len(), 1);
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);
}

#[tokio::test]
async fn test_resumes_chunk_execution_after_cancel() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 5);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));

    let harness =
        ScavengeHarness::new(&log).cancel_on("Checkpoint: Executing chunks for SP-0 done None");
    let stopped = harness.run().await;
    assert_eq!(stopped.outcome.result, ScavengeResult::Stopped);
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2, 3, 4]);
    assert!(matches!(
        stopped.state.checkpoint().await.unwrap(),
        Some(ScavengeCheckpoint::ExecutingChunks { .. })
    ));

    let resumed = harness.without_cancel().run().await;
    assert_eq!(resumed.outcome.result, ScavengeResult::Success);
    // calculation is not repeated
    assert!(!resumed.trace.iter().any(|line| line.starts_with("SetDiscardPoints")));
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);
    assert!(matches!(
        resumed.state.checkpoint().await.unwrap(),
        Some(ScavengeCheckpoint::Done { .. })
    ));
}

#[tokio::test]
async fn test_rerun_writes_a_new_scavenge_point_and_changes_nothing() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 5);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));

    let harness = ScavengeHarness::new(&log);
    let first = harness.run().await;
    assert_eq!(first.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);

    let second = harness.run().await;
    assert_eq!(second.outcome.result, ScavengeResult::Success);
    assert_eq!(second.outcome.scavenge_point.map(|sp| sp.event_number), Some(1));
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);
    assert_eq!(log.index_event_numbers("ab-1"), vec![3, 4]);
    assert_eq!(second.record.chunks_scavenged, 0);
}

#[tokio::test]
async fn test_discard_points_never_move_backwards() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 5);
    log.write_metadata("ab-1", &StreamMetadata::with_truncate_before(3));

    let harness = ScavengeHarness::new(&log);
    assert_eq!(harness.run().await.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);

    log.write_events("ab-1", 2);
    log.write_metadata("ab-1", &StreamMetadata::with_truncate_before(1));

    let run = harness.run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4, 5, 6]);

    let handle = run.state.stream_handle("ab-1");
    let data = run.state.original_stream_data(&handle).await.unwrap().unwrap();
    assert_eq!(data.discard_point, DiscardPoint::discard_before(3));
}

#[tokio::test]
async fn test_later_runs_only_accumulate_new_chunks() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));

    let harness = ScavengeHarness::new(&log);
    assert_eq!(harness.run().await.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![1, 2]);

    log.write_events("ab-1", 2);
    let run = harness.run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert!(run.traced("Checkpoint: Accumulating SP-1 done Chunk 0"));
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);
}

#[tokio::test]
async fn test_sync_only_finishes_an_existing_scavenge_point() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let harness =
        ScavengeHarness::new(&log).with_config(TestConfigBuilder::new().with_sync_only().build());

    let run = harness.run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(run.outcome.scavenge_point, None);
    assert!(log.scavenge_points().is_empty());
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2]);

    let scavenge_point = log.write_scavenge_point(0);
    let run = harness.run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(run.outcome.scavenge_point, Some(scavenge_point));
    assert_eq!(log.event_numbers("ab-1"), vec![2]);

    let run = harness.run().await;
    assert_eq!(run.outcome.scavenge_point, None);
    assert_eq!(log.scavenge_points().len(), 1);
}

#[tokio::test]
async fn test_state_survives_a_restart_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}", dir.path().join("scavenge.db").display());
    let log = MemoryLog::new();
    log.write_events("ab-1", 5);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));

    let store = Arc::new(SqliteKvStore::open(&dsn).await.unwrap());
    let stopped = ScavengeHarness::new(&log)
        .with_store(store.clone() as Arc<dyn KvStore>)
        .cancel_on("Checkpoint: Executing chunks for SP-0 done None")
        .run()
        .await;
    assert_eq!(stopped.outcome.result, ScavengeResult::Stopped);
    drop(stopped);
    Arc::try_unwrap(store).ok().unwrap().close().await;

    let store = Arc::new(SqliteKvStore::open(&dsn).await.unwrap());
    let resumed = ScavengeHarness::new(&log)
        .with_store(store as Arc<dyn KvStore>)
        .run()
        .await;
    assert_eq!(resumed.outcome.result, ScavengeResult::Success);
    assert_eq!(resumed.outcome.scavenge_point.map(|sp| sp.event_number), Some(0));
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);
}

#[tokio::test]
async fn test_resumes_calculation_after_the_first_batch() {
    let resumed = resume_after("Checkpoint: Calculating SP-0 done Hash: 97").await;

    assert!(!resumed.trace.iter().any(|line| line.starts_with("Checkpoint: Accumulating")));
    assert!(!resumed.traced("Checkpoint: Calculating SP-0 done Hash: 97"));
    assert!(resumed.traced("Checkpoint: Calculating SP-0 done Hash: 99"));
    let recalculated = resumed
        .trace
        .iter()
        .filter(|line| line.starts_with("SetDiscardPoints"))
        .count();
    assert_eq!(recalculated, 1);
}

#[tokio::test]
async fn test_resumed_calculation_counts_weights_once() {
    let log = MemoryLog::new().with_hasher(Arc::new(HumanReadableHasher));
    log.write_events("ab-1", 3);
    log.write_events("cd-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));
    log.write_metadata("cd-1", &StreamMetadata::with_max_count(2));

    // one discarded event per stream weighs 4 in total, not above the threshold
    let harness = ScavengeHarness::new(&log)
        .with_config(
            TestConfigBuilder::new()
                .with_checkpoint_period(1)
                .with_threshold(4)
                .build(),
        )
        .cancel_on("Checkpoint: Calculating SP-0 done Hash: 97");
    let stopped = harness.run().await;
    assert_eq!(stopped.outcome.result, ScavengeResult::Stopped);

    let resumed = harness.without_cancel().run().await;
    assert_eq!(resumed.outcome.result, ScavengeResult::Success);
    assert_eq!(resumed.record.chunks_scavenged, 0);
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2]);
    assert_eq!(log.event_numbers("cd-1"), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_resumes_merging_after_cancel() {
    let resumed = resume_after("Checkpoint: Merging chunks for SP-0").await;

    assert!(!resumed.trace.iter().any(|line| line.starts_with("Checkpoint: Executing chunks")));
    assert_eq!(resumed.record.chunks_merged, 2);
}

#[tokio::test]
async fn test_resumes_index_execution_after_cancel() {
    let resumed = resume_after("Checkpoint: Executing index for SP-0").await;

    assert!(!resumed.trace.iter().any(|line| line.starts_with("Checkpoint: Merging")));
    assert!(resumed.record.index_entries_removed > 0);
}

#[tokio::test]
async fn test_resumes_cleaning_after_cancel() {
    let resumed = resume_after("Checkpoint: Cleaning for SP-0").await;

    assert!(!resumed.trace.iter().any(|line| line.starts_with("Checkpoint: Executing index")));
    assert!(resumed.traced("Checkpoint: Done SP-0"));
    assert!(matches!(
        resumed.state.checkpoint().await.unwrap(),
        Some(ScavengeCheckpoint::Done { .. })
    ));
}

#[tokio::test]
async fn test_cleaning_checkpoints_twice_before_done() {
    let log = busy_log();

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    let checkpoints: Vec<&str> = run
        .trace
        .iter()
        .filter_map(|line| line.strip_prefix("Checkpoint: "))
        .collect();
    assert_eq!(
        checkpoints[checkpoints.len() - 3..],
        ["Cleaning for SP-0", "Cleaning for SP-0", "Done SP-0"]
    );
}
