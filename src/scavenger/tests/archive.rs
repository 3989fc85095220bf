//! Chunks leaving local storage once the archive holds them.

use std::sync::Arc;
use std::time::Duration;

use common::testing::TestConfigBuilder;
use scavenger::history::ScavengeResult;
use scavenger::model::StreamMetadata;
use scavenger::testing::{MemoryArchiveCheckpoint, MemoryLog, Retirement, ScavengeHarness};

const HOUR: Duration = Duration::from_secs(3600);

/// An hour-old chunk followed by a fresh one holding the scavenge point
fn log_with_old_chunk() -> MemoryLog {
    let log = MemoryLog::new();
    for _ in 0..3 {
        log.write_event_aged("ab-1", 2 * HOUR);
    }
    log.complete_chunk();
    log.write_event("cd-1");
    log
}

#[tokio::test]
async fn test_old_chunks_are_switched_to_the_archive() {
    let log = log_with_old_chunk();
    let archive = Arc::new(MemoryArchiveCheckpoint::new(i64::MAX));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_archive(HOUR, 0).build())
        .with_archive(archive.clone())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.retirements(), vec![Retirement::SwitchedToRemote(0)]);
    assert_eq!(run.record.chunks_removed, 1);
    assert!(log.physical_chunks()[0].is_remote);
    assert!(!log.physical_chunks()[1].is_remote);
}

#[tokio::test]
async fn test_archived_chunks_can_be_deleted_locally() {
    let log = log_with_old_chunk();

    let run = ScavengeHarness::new(&log)
        .with_config(
            TestConfigBuilder::new()
                .with_archive(HOUR, 0)
                .with_delete_local_chunks()
                .build(),
        )
        .with_archive(Arc::new(MemoryArchiveCheckpoint::new(i64::MAX)))
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.retirements(), vec![Retirement::DeletedLocal(0)]);
}

#[tokio::test]
async fn test_recent_chunks_stay_local() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_event("cd-1");
    let archive = Arc::new(MemoryArchiveCheckpoint::new(i64::MAX));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_archive(HOUR, 0).build())
        .with_archive(archive.clone())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert!(log.retirements().is_empty());
    assert_eq!(archive.queries(), 0);
}

#[tokio::test]
async fn test_chunks_within_retained_bytes_stay_local() {
    let log = log_with_old_chunk();

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_archive(HOUR, 4096).build())
        .with_archive(Arc::new(MemoryArchiveCheckpoint::new(i64::MAX)))
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert!(log.retirements().is_empty());
}

#[tokio::test]
async fn test_waits_for_a_lagging_archive() {
    let log = log_with_old_chunk();
    let archive = Arc::new(MemoryArchiveCheckpoint::scripted([0, 0, 4096]));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_archive(HOUR, 0).build())
        .with_archive(archive.clone())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(archive.queries(), 3);
    assert_eq!(log.retirements(), vec![Retirement::SwitchedToRemote(0)]);
}

#[tokio::test]
async fn test_unarchived_chunk_errors_and_resumes_later() {
    let log = log_with_old_chunk();
    log.write_metadata("cd-1", &StreamMetadata::with_max_count(1));
    let archive = Arc::new(MemoryArchiveCheckpoint::new(0));

    let harness = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_archive(HOUR, 0).build())
        .with_archive(archive.clone());

    let run = harness.run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Errored);
    assert_eq!(
        run.outcome.error.as_deref(),
        Some(
            "Error while scavenging DB: Chunk chunk-000000.000000 \
             has not been archived after 3 attempts."
        )
    );
    assert!(log.retirements().is_empty());

    archive.set(i64::MAX);
    let run = harness.run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(run.outcome.scavenge_point.map(|sp| sp.event_number), Some(0));
    assert_eq!(log.retirements(), vec![Retirement::SwitchedToRemote(0)]);
}

#[tokio::test]
async fn test_archiving_disables_merging() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_archive(HOUR, 0).build())
        .with_archive(Arc::new(MemoryArchiveCheckpoint::new(0)))
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![5]);
    assert_eq!(run.record.chunks_merged, 0);
    assert_eq!(log.physical_chunks()[0].chunk_end_number, 0);
}
