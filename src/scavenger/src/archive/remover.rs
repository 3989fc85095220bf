use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::collaborators::{ChunkManager, PhysicalChunk};
use crate::error::{Result, ScavengeError};
use crate::model::ScavengePoint;
use crate::settings::ArchiveSettings;
use crate::stages::{StageContext, SwitchChunksLock};

use super::AdvancingCheckpoint;

/// Decides whether a chunk leaves local storage during chunk execution.
#[async_trait]
pub trait ChunkRemover: Send + Sync {
    /// Start removing the chunk unless it must be retained locally.
    /// Returns whether the chunk is being removed.
    async fn start_removing_if_not_retained(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        chunk: &PhysicalChunk,
    ) -> Result<bool>;
}

/// Used when there is no archive: every chunk is retained
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChunkRemover;

#[async_trait]
impl ChunkRemover for NoopChunkRemover {
    async fn start_removing_if_not_retained(
        &self,
        _ctx: &StageContext<'_>,
        _scavenge_point: &ScavengePoint,
        _chunk: &PhysicalChunk,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// What happens to a chunk once it is safely archived
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposal {
    /// Replace the local file with a locator of the archived copy
    SwitchToRemote,
    /// Delete the local file
    DeleteLocal,
}

/// Disposes of chunks once the archive confirms it holds them.
pub struct ChunkDeleter {
    chunks: Arc<dyn ChunkManager>,
    checkpoint: AdvancingCheckpoint,
    switch_lock: SwitchChunksLock,
    disposal: Disposal,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ChunkDeleter {
    pub fn new(
        chunks: Arc<dyn ChunkManager>,
        checkpoint: AdvancingCheckpoint,
        switch_lock: SwitchChunksLock,
        disposal: Disposal,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            chunks,
            checkpoint,
            switch_lock,
            disposal,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub async fn delete_when_archived(
        &self,
        ctx: &StageContext<'_>,
        chunk: &PhysicalChunk,
    ) -> Result<()> {
        self.wait_until_archived(ctx, chunk).await?;

        let _switch = self.switch_lock.lock().await;
        match self.disposal {
            Disposal::SwitchToRemote => self
                .chunks
                .switch_in_remote(chunk)
                .await
                .with_context(|| format!("Failed to switch {chunk} to its archived copy"))?,
            Disposal::DeleteLocal => self
                .chunks
                .delete_local(chunk)
                .await
                .with_context(|| format!("Failed to delete local {chunk}"))?,
        }
        Ok(())
    }

    async fn wait_until_archived(&self, ctx: &StageContext<'_>, chunk: &PhysicalChunk) -> Result<()> {
        for attempt in 1..=self.max_attempts {
            if self
                .checkpoint
                .is_greater_than_or_equal_to(chunk.chunk_end_position)
                .await?
            {
                return Ok(());
            }
            if attempt == self.max_attempts {
                break;
            }

            warn!(
                chunk = %chunk,
                attempt,
                max_attempts = self.max_attempts,
                "Chunk is not archived yet, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = ctx.cancel.cancelled() => return Err(ScavengeError::Cancelled),
            }
            self.checkpoint.reset();
        }

        Err(ScavengeError::NotArchived {
            chunk: chunk.name.clone(),
            attempts: self.max_attempts,
        })
    }
}

/// Retires chunks that are older than the retain period and further behind
/// the scavenge point than the retained bytes.
pub struct RetainingChunkRemover {
    retain_period: Duration,
    retain_bytes: u64,
    deleter: ChunkDeleter,
}

impl RetainingChunkRemover {
    pub fn new(retain_period: Duration, retain_bytes: u64, deleter: ChunkDeleter) -> Self {
        Self {
            retain_period,
            retain_bytes,
            deleter,
        }
    }

    pub fn from_settings(
        settings: &ArchiveSettings,
        chunks: Arc<dyn ChunkManager>,
        checkpoint: AdvancingCheckpoint,
        switch_lock: SwitchChunksLock,
    ) -> Self {
        let disposal = if settings.delete_local_chunks {
            Disposal::DeleteLocal
        } else {
            Disposal::SwitchToRemote
        };
        Self::new(
            settings.retain_period,
            settings.retain_bytes,
            ChunkDeleter::new(
                chunks,
                checkpoint,
                switch_lock,
                disposal,
                settings.max_attempts,
                settings.retry_delay,
            ),
        )
    }

    async fn is_retained(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        chunk: &PhysicalChunk,
    ) -> Result<bool> {
        let retain_bytes = i64::try_from(self.retain_bytes).unwrap_or(i64::MAX);
        if chunk.chunk_end_position.saturating_add(retain_bytes) > scavenge_point.position {
            debug!(chunk = %chunk, "Chunk retained by bytes");
            return Ok(true);
        }

        let mut newest = None;
        for logical_chunk in chunk.logical_chunk_numbers() {
            if let Some(range) = ctx.state.chunk_timestamp_range(logical_chunk).await? {
                newest = Some(newest.map_or(range.max, |newest: chrono::DateTime<chrono::Utc>| {
                    newest.max(range.max)
                }));
            }
        }

        // a chunk without records has nothing to retain
        let Some(newest) = newest else {
            return Ok(false);
        };
        let Some(cutoff) = ChronoDuration::from_std(self.retain_period)
            .ok()
            .and_then(|period| scavenge_point.effective_now.checked_sub_signed(period))
        else {
            return Ok(true);
        };

        let retained = newest >= cutoff;
        if retained {
            debug!(chunk = %chunk, newest = %newest, "Chunk retained by period");
        }
        Ok(retained)
    }
}

#[async_trait]
impl ChunkRemover for RetainingChunkRemover {
    async fn start_removing_if_not_retained(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        chunk: &PhysicalChunk,
    ) -> Result<bool> {
        if self.is_retained(ctx, scavenge_point, chunk).await? {
            return Ok(false);
        }

        self.deleter.delete_when_archived(ctx, chunk).await?;
        let reason = match self.deleter.disposal {
            Disposal::SwitchToRemote => "switched to archive",
            Disposal::DeleteLocal => "deleted, archived",
        };
        ctx.log.chunks_removed(chunk, reason);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockArchiveCheckpointReader;
    use crate::history::ScavengerLog;
    use crate::settings::ScavengeSettings;
    use crate::state::ScavengeState;
    use crate::state::data::ChunkTimeStampRange;
    use crate::state::kv::MemoryKvStore;
    use crate::testing::{MemoryLog, Retirement};
    use crate::throttle::Throttle;
    use crate::tracer::NoopTracer;
    use common::testing::TestConfigBuilder;
    use tokio_util::sync::CancellationToken;

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        log: MemoryLog,
        state: ScavengeState,
        settings: ScavengeSettings,
        throttle: Throttle,
        cancel: CancellationToken,
        history: ScavengerLog,
        scavenge_point: ScavengePoint,
    }

    impl Fixture {
        /// Two chunks with one event each, the scavenge point in the third
        fn new() -> Self {
            let log = MemoryLog::new();
            log.write_event("ab-1");
            log.complete_chunk();
            log.write_event("ab-1");
            log.complete_chunk();
            let scavenge_point = log.write_scavenge_point(0);

            Self {
                state: ScavengeState::new(
                    Arc::new(MemoryKvStore::new()),
                    log.hasher(),
                    16,
                    Arc::new(NoopTracer),
                ),
                log,
                settings: ScavengeSettings::from_config(&TestConfigBuilder::new().build()),
                throttle: Throttle::unthrottled(),
                cancel: CancellationToken::new(),
                history: ScavengerLog::detached(1),
                scavenge_point,
            }
        }

        fn ctx(&self) -> StageContext<'_> {
            StageContext {
                state: &self.state,
                settings: &self.settings,
                throttle: &self.throttle,
                cancel: &self.cancel,
                log: &self.history,
            }
        }

        fn first_chunk(&self) -> PhysicalChunk {
            self.log.physical_chunks().remove(0)
        }

        async fn set_newest_record(&self, age: Duration) {
            let newest = self.scavenge_point.effective_now
                - ChronoDuration::from_std(age).unwrap();
            self.state
                .set_chunk_timestamp_range(0, ChunkTimeStampRange::new(newest, newest))
                .await
                .unwrap();
        }

        fn remover(
            &self,
            retain_period: Duration,
            retain_bytes: u64,
            reader: MockArchiveCheckpointReader,
            retry_delay: Duration,
        ) -> RetainingChunkRemover {
            RetainingChunkRemover::new(
                retain_period,
                retain_bytes,
                ChunkDeleter::new(
                    Arc::new(self.log.clone()),
                    AdvancingCheckpoint::new(Arc::new(reader)),
                    SwitchChunksLock::new(),
                    Disposal::SwitchToRemote,
                    3,
                    retry_delay,
                ),
            )
        }
    }

    fn archived_up_to(position: i64, times: usize) -> MockArchiveCheckpointReader {
        let mut reader = MockArchiveCheckpointReader::new();
        reader
            .expect_archive_checkpoint()
            .times(times)
            .returning(move || Ok(position));
        reader
    }

    #[tokio::test]
    async fn test_chunk_within_retained_bytes_stays() {
        let fixture = Fixture::new();
        fixture.set_newest_record(2 * HOUR).await;
        let remover = fixture.remover(HOUR, 2000, archived_up_to(0, 0), Duration::ZERO);

        let removed = remover
            .start_removing_if_not_retained(
                &fixture.ctx(),
                &fixture.scavenge_point,
                &fixture.first_chunk(),
            )
            .await
            .unwrap();
        assert!(!removed);
        assert!(fixture.log.retirements().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_within_retain_period_stays() {
        let fixture = Fixture::new();
        fixture.set_newest_record(HOUR / 2).await;
        let remover = fixture.remover(HOUR, 0, archived_up_to(0, 0), Duration::ZERO);

        let removed = remover
            .start_removing_if_not_retained(
                &fixture.ctx(),
                &fixture.scavenge_point,
                &fixture.first_chunk(),
            )
            .await
            .unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_old_archived_chunk_is_switched_to_remote() {
        let fixture = Fixture::new();
        fixture.set_newest_record(2 * HOUR).await;
        let remover = fixture.remover(HOUR, 0, archived_up_to(4096, 1), Duration::ZERO);

        let removed = remover
            .start_removing_if_not_retained(
                &fixture.ctx(),
                &fixture.scavenge_point,
                &fixture.first_chunk(),
            )
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(fixture.log.retirements(), vec![Retirement::SwitchedToRemote(0)]);
        assert!(fixture.first_chunk().is_remote);
        assert_eq!(fixture.history.snapshot().chunks_removed, 1);
    }

    #[tokio::test]
    async fn test_chunk_without_records_is_not_retained() {
        let fixture = Fixture::new();
        let remover = fixture.remover(HOUR, 0, archived_up_to(4096, 1), Duration::ZERO);

        let removed = remover
            .start_removing_if_not_retained(
                &fixture.ctx(),
                &fixture.scavenge_point,
                &fixture.first_chunk(),
            )
            .await
            .unwrap();
        assert!(removed);
    }

    #[tokio::test]
    async fn test_gives_up_when_archive_lags() {
        let fixture = Fixture::new();
        fixture.set_newest_record(2 * HOUR).await;
        let remover = fixture.remover(HOUR, 0, archived_up_to(0, 3), Duration::ZERO);

        let err = remover
            .start_removing_if_not_retained(
                &fixture.ctx(),
                &fixture.scavenge_point,
                &fixture.first_chunk(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScavengeError::NotArchived { attempts: 3, .. }
        ));
        assert!(fixture.log.retirements().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_archive() {
        let fixture = Fixture::new();
        fixture.set_newest_record(2 * HOUR).await;
        let remover = fixture.remover(HOUR, 0, archived_up_to(0, 1), HOUR);
        fixture.cancel.cancel();

        let err = remover
            .start_removing_if_not_retained(
                &fixture.ctx(),
                &fixture.scavenge_point,
                &fixture.first_chunk(),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
