//! Retention policies applied end to end over an in-memory log.

use std::sync::Arc;
use std::time::Duration;

use common::testing::{TestConfigBuilder, init_test_logging};
use scavenger::history::ScavengeResult;
use scavenger::model::{DELETED_STREAM_EVENT_NUMBER, StreamMetadata};
use scavenger::testing::{HumanReadableHasher, MemoryLog, ScavengeHarness};

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_max_count_keeps_the_newest_events() {
    init_test_logging();
    let log = MemoryLog::new();
    log.write_events("ab-1", 5);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(2));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![3, 4]);
    assert_eq!(log.index_event_numbers("ab-1"), vec![3, 4]);
    assert_eq!(run.record.chunks_scavenged, 1);
    assert_eq!(run.record.index_entries_removed, 3);
    assert!(run.record.space_saved > 0);
}

#[tokio::test]
async fn test_truncate_before_never_removes_the_last_event() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_truncate_before(100));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![2]);
}

#[tokio::test]
async fn test_streams_without_metadata_are_untouched() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_events("cd-1", 4);
    log.write_metadata("cd-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2]);
    assert_eq!(log.event_numbers("cd-1"), vec![3]);
}

#[tokio::test]
async fn test_newer_metadata_replaces_older() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 4);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(3));
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![3]);
    assert_eq!(log.event_numbers("$$ab-1"), vec![1]);
}

#[tokio::test]
async fn test_tombstone_discards_everything_but_itself() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(10));
    log.write_tombstone("ab-1");

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(
        log.event_numbers("ab-1"),
        vec![DELETED_STREAM_EVENT_NUMBER]
    );
    // the last metadata record outlives the stream
    assert_eq!(log.event_numbers("$$ab-1"), vec![0]);
}

#[tokio::test]
async fn test_unsafe_ignore_hard_deletes_removes_tombstoned_streams() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(10));
    log.write_tombstone("ab-1");
    log.write_events("cd-1", 2);

    let run = ScavengeHarness::new(&log)
        .with_config(
            TestConfigBuilder::new()
                .with_unsafe_ignore_hard_deletes()
                .build(),
        )
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert!(log.event_numbers("ab-1").is_empty());
    assert!(log.event_numbers("$$ab-1").is_empty());
    assert!(log.index_event_numbers("ab-1").is_empty());
    assert_eq!(log.event_numbers("cd-1"), vec![0, 1]);
}

#[tokio::test]
async fn test_max_age_discards_whole_old_chunks() {
    let log = MemoryLog::new();
    for _ in 0..3 {
        log.write_event_aged("ab-1", 2 * HOUR);
    }
    log.complete_chunk();
    log.write_event("ab-1");
    log.write_metadata("ab-1", &StreamMetadata::with_max_age(HOUR));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![3]);
    assert_eq!(log.index_event_numbers("ab-1"), vec![3]);
}

#[tokio::test]
async fn test_max_age_checks_each_record_in_mixed_chunks() {
    let log = MemoryLog::new();
    log.write_event_aged("ab-1", 3 * HOUR);
    log.write_event_aged("ab-1", 2 * HOUR);
    log.write_event_aged("ab-1", HOUR / 2);
    log.write_event("ab-1");
    log.write_metadata("ab-1", &StreamMetadata::with_max_age(HOUR));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![2, 3]);

    // the index only drops what was certainly discarded
    let handle = run.state.stream_handle("ab-1");
    let data = run.state.original_stream_data(&handle).await.unwrap().unwrap();
    assert!(data.discard_point.is_keep_all());
    assert!(data.maybe_discard_point.should_discard(2));
    assert_eq!(log.index_event_numbers("ab-1"), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_tombstone_removes_index_entries_of_emptied_chunks() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 2);
    log.write_events("cd-1", 2);
    log.complete_chunk();
    log.empty_chunk(0);
    log.write_tombstone("ab-1");

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(
        log.event_numbers("ab-1"),
        vec![DELETED_STREAM_EVENT_NUMBER]
    );
    assert_eq!(
        log.index_event_numbers("ab-1"),
        vec![DELETED_STREAM_EVENT_NUMBER]
    );
    // nothing is known about cd-1, so its entries stay
    assert!(log.event_numbers("cd-1").is_empty());
    assert_eq!(log.index_event_numbers("cd-1"), vec![0, 1]);
}

#[tokio::test]
async fn test_kept_event_stops_removal_across_emptied_chunks() {
    let log = MemoryLog::new();
    for _ in 0..3 {
        log.write_event("ab-1");
        log.complete_chunk();
    }
    log.write_event("ab-1");
    log.write_metadata("ab-1", &StreamMetadata::with_max_age(HOUR));
    log.empty_chunk(0);
    log.empty_chunk(2);

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_merge_chunks(false).build())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![1, 3]);
    // event 1 is too young to discard, so event 2 behind it is kept as well
    assert_eq!(log.index_event_numbers("ab-1"), vec![1, 2, 3]);

    let handle = run.state.stream_handle("ab-1");
    let data = run.state.original_stream_data(&handle).await.unwrap().unwrap();
    assert!(data.discard_point.should_discard(0));
    assert!(!data.discard_point.should_discard(1));
}

#[tokio::test]
async fn test_chunks_at_or_below_threshold_are_left_alone() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    // two discarded records weigh 4
    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_threshold(4).build())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2]);
    assert_eq!(run.record.chunks_scavenged, 0);
    assert!(run.record.chunks_not_scavenged > 0);
}

#[tokio::test]
async fn test_chunks_above_threshold_are_scavenged() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_threshold(3).build())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![2]);
    assert_eq!(run.record.chunks_scavenged, 1);
}

#[tokio::test]
async fn test_negative_threshold_honours_metadata_of_metastreams() {
    let log = MemoryLog::new();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(10));
    log.write_metadata("$$ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_threshold(-1).build())
        .run()
        .await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(run.record.chunks_scavenged, 1);
    let handle = run.state.stream_handle("$$ab-1");
    let data = run.state.original_stream_data(&handle).await.unwrap();
    assert_eq!(data.and_then(|data| data.max_count), Some(1));

    let log = MemoryLog::new();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(10));
    log.write_metadata("$$ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log).run().await;
    assert_eq!(run.outcome.result, ScavengeResult::Success);
    let handle = run.state.stream_handle("$$ab-1");
    assert!(run.state.original_stream_data(&handle).await.unwrap().is_none());
}

#[tokio::test]
async fn test_colliding_streams_are_told_apart() {
    let log = MemoryLog::new().with_hasher(Arc::new(HumanReadableHasher));
    log.write_events("ab-1", 3);
    log.write_events("ac-1", 3);
    log.write_events("bb-1", 3);
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));
    log.write_metadata("bb-1", &StreamMetadata::with_max_count(1));

    let harness = ScavengeHarness::new(&log);
    let run = harness.run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(run.state.collisions(), vec!["ab-1", "ac-1"]);
    assert_eq!(log.event_numbers("ab-1"), vec![2]);
    assert_eq!(log.event_numbers("ac-1"), vec![0, 1, 2]);
    assert_eq!(log.event_numbers("bb-1"), vec![2]);
    assert_eq!(log.index_event_numbers("ab-1"), vec![2]);
    assert_eq!(log.index_event_numbers("ac-1"), vec![0, 1, 2]);
    assert_eq!(log.index_event_numbers("bb-1"), vec![2]);
    assert_eq!(run.record.index_entries_removed, 4);

    let rerun = harness.run().await;
    assert_eq!(rerun.outcome.result, ScavengeResult::Success);
    assert_eq!(log.index_event_numbers("ab-1"), vec![2]);
    assert_eq!(log.index_event_numbers("ac-1"), vec![0, 1, 2]);
    assert_eq!(rerun.record.index_entries_removed, 0);
}

#[tokio::test]
async fn test_compacted_chunks_are_merged() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![5]);
    assert_eq!(run.record.chunks_merged, 2);

    let chunks = log.physical_chunks();
    assert_eq!(chunks[0].chunk_start_number, 0);
    assert_eq!(chunks[0].chunk_end_number, 1);
    assert_eq!(chunks[1].chunk_start_number, 2);
}

#[tokio::test]
async fn test_merging_can_be_disabled() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log)
        .with_config(TestConfigBuilder::new().with_merge_chunks(false).build())
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(run.record.chunks_merged, 0);
    assert_eq!(log.physical_chunks()[0].chunk_end_number, 0);
}

#[tokio::test]
async fn test_raw_chunks_are_not_rewritten() {
    let log = MemoryLog::new();
    log.write_events("ab-1", 3);
    log.complete_chunk();
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));
    log.mark_raw(0);

    let run = ScavengeHarness::new(&log).run().await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![0, 1, 2]);
    assert_eq!(run.record.chunks_scavenged, 0);
}

#[tokio::test]
async fn test_parallel_chunk_execution() {
    let log = MemoryLog::new();
    for _ in 0..4 {
        log.write_events("ab-1", 3);
        log.complete_chunk();
    }
    log.write_metadata("ab-1", &StreamMetadata::with_max_count(1));

    let run = ScavengeHarness::new(&log)
        .with_config(
            TestConfigBuilder::new()
                .with_threads(3)
                .with_merge_chunks(false)
                .build(),
        )
        .run()
        .await;

    assert_eq!(run.outcome.result, ScavengeResult::Success);
    assert_eq!(log.event_numbers("ab-1"), vec![11]);
    assert_eq!(run.record.chunks_scavenged, 4);
}
