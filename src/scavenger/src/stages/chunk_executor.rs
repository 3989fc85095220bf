//! Chunk execution: rewrite heavy chunks without their discarded records.

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::archive::ChunkRemover;
use crate::collaborators::{ChunkManager, ChunkWriter, PhysicalChunk};
use crate::error::{Result, ScavengeError};
use crate::model::{LogRecord, PrepareRecord, ScavengeCheckpoint, ScavengePoint};
use crate::parallel::run_with_trailing_checkpoint;

use super::{CancellationCheck, StageContext};

/// Serialises replacing chunk files in the log.
#[derive(Clone, Default)]
pub struct SwitchChunksLock(Arc<Mutex<()>>);

impl SwitchChunksLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

#[derive(Debug, Default)]
struct ChunkRewrite {
    kept: u64,
    discarded: u64,
}

pub struct ChunkExecutor {
    chunks: Arc<dyn ChunkManager>,
    remover: Arc<dyn ChunkRemover>,
    switch_lock: SwitchChunksLock,
}

impl ChunkExecutor {
    pub fn new(
        chunks: Arc<dyn ChunkManager>,
        remover: Arc<dyn ChunkRemover>,
        switch_lock: SwitchChunksLock,
    ) -> Self {
        Self {
            chunks,
            remover,
            switch_lock,
        }
    }

    pub async fn execute(&self, ctx: &StageContext<'_>, scavenge_point: &ScavengePoint) -> Result<()> {
        info!(scavenge_point = %scavenge_point, "Started scavenge chunk execution phase");
        let checkpoint = ScavengeCheckpoint::ExecutingChunks {
            scavenge_point: scavenge_point.clone(),
            done_logical_chunk_number: None,
        };
        ctx.state.set_checkpoint(&checkpoint).await?;
        self.execute_from(ctx, &checkpoint).await
    }

    pub async fn execute_from(
        &self,
        ctx: &StageContext<'_>,
        checkpoint: &ScavengeCheckpoint,
    ) -> Result<()> {
        let ScavengeCheckpoint::ExecutingChunks {
            scavenge_point,
            done_logical_chunk_number,
        } = checkpoint
        else {
            return Err(anyhow::anyhow!("Cannot execute chunks from checkpoint {checkpoint}").into());
        };
        debug!(checkpoint = %checkpoint, "Executing chunks from checkpoint");

        let start_from = done_logical_chunk_number.map(|n| n + 1).unwrap_or(0);
        let physical_chunks = self.physical_chunks(start_from, scavenge_point).await?;
        let threads = ctx.settings.threads;

        run_with_trailing_checkpoint(
            physical_chunks,
            threads,
            |chunk: &PhysicalChunk| chunk.chunk_end_number,
            |chunk| self.process_chunk(ctx, scavenge_point, chunk),
            |chunk_end_number| async move {
                ctx.state
                    .set_checkpoint(&ScavengeCheckpoint::ExecutingChunks {
                        scavenge_point: scavenge_point.clone(),
                        done_logical_chunk_number: Some(chunk_end_number),
                    })
                    .await?;
                if threads == 1 {
                    ctx.throttle.rest(ctx.cancel).await?;
                }
                Ok::<(), ScavengeError>(())
            },
        )
        .await
    }

    /// Read-only physical chunks from a logical chunk up to the scavenge point
    async fn physical_chunks(
        &self,
        start_from: i32,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<PhysicalChunk>> {
        let chunk_size = self.chunks.chunk_size();
        let mut physical_chunks = Vec::new();
        let mut position = i64::from(start_from) * chunk_size;

        while position < scavenge_point.position {
            let logical_chunk = super::logical_chunk_number(position, chunk_size);
            let Some(chunk) = self
                .chunks
                .physical_chunk(logical_chunk)
                .await
                .with_context(|| format!("Failed to open chunk {logical_chunk}"))?
            else {
                break;
            };

            if !chunk.is_read_only {
                return Err(ScavengeError::Precondition(format!(
                    "Reached open chunk before scavenge point. Chunk {}. ScavengePoint: {}.",
                    chunk.chunk_start_number, scavenge_point.position
                )));
            }

            position = chunk.chunk_end_position;
            physical_chunks.push(chunk);
        }
        Ok(physical_chunks)
    }

    async fn process_chunk(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        chunk: PhysicalChunk,
    ) -> Result<()> {
        let weight = ctx
            .state
            .sum_chunk_weights(chunk.chunk_start_number, chunk.chunk_end_number)
            .await?;

        if chunk.is_remote || chunk.is_raw {
            let reason = if chunk.is_remote { "remote" } else { "raw" };
            debug!(chunk = %chunk, weight, reason, "Skipped physical chunk");
            ctx.log.chunks_not_scavenged(&chunk, reason);
            ctx.state
                .reset_chunk_weights(chunk.chunk_start_number, chunk.chunk_end_number)
                .await?;
        } else if self
            .remover
            .start_removing_if_not_retained(ctx, scavenge_point, &chunk)
            .await?
        {
            ctx.state
                .reset_chunk_weights(chunk.chunk_start_number, chunk.chunk_end_number)
                .await?;
        } else if weight > scavenge_point.threshold as f32
            || ctx.settings.unsafe_ignore_hard_deletes
        {
            self.execute_chunk(ctx, scavenge_point, &chunk, weight).await?;
            ctx.state
                .reset_chunk_weights(chunk.chunk_start_number, chunk.chunk_end_number)
                .await?;
        } else {
            debug!(
                chunk = %chunk,
                weight,
                threshold = scavenge_point.threshold,
                "Skipped physical chunk below threshold"
            );
            ctx.log.chunks_not_scavenged(&chunk, "below threshold");
        }

        ctx.check_cancelled()
    }

    async fn execute_chunk(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        chunk: &PhysicalChunk,
        weight: f32,
    ) -> Result<()> {
        let started = Instant::now();
        debug!(
            chunk = %chunk,
            weight,
            start_position = chunk.chunk_start_position,
            end_position = chunk.chunk_end_position,
            "Started to scavenge physical chunk"
        );

        let mut writer = self
            .chunks
            .create_writer(chunk)
            .await
            .with_context(|| format!("Failed to create a new chunk to scavenge {chunk}"))?;

        let written = self
            .write_survivors(ctx, scavenge_point, chunk, writer.as_mut())
            .await;
        let rewrite = match written {
            Ok(rewrite) => rewrite,
            Err(err) => {
                if err.is_cancelled() {
                    info!(chunk = %chunk, "Scavenge cancelled while rewriting chunk");
                } else {
                    info!(chunk = %chunk, error = %err, "Failed to rewrite chunk");
                }
                writer.abort().await;
                return Err(err);
            }
        };

        let completed = writer
            .complete()
            .await
            .with_context(|| format!("Failed to complete the scavenged copy of {chunk}"))?;
        {
            let _switch = self.switch_lock.lock().await;
            self.chunks
                .switch_in_chunk(chunk, &completed)
                .await
                .with_context(|| format!("Failed to switch in the scavenged copy of {chunk}"))?;
        }

        debug!(
            chunk = %chunk,
            kept = rewrite.kept,
            discarded = rewrite.discarded,
            old_size = chunk.file_size,
            new_size = completed.file_size,
            "Scavenged physical chunk"
        );
        let space_saved = chunk.file_size as i64 - completed.file_size as i64;
        ctx.log
            .chunks_scavenged(chunk, rewrite.discarded, started.elapsed(), space_saved);
        Ok(())
    }

    async fn write_survivors(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        chunk: &PhysicalChunk,
        writer: &mut dyn ChunkWriter,
    ) -> Result<ChunkRewrite> {
        let mut rewrite = ChunkRewrite::default();
        let mut cancellation = CancellationCheck::new(ctx.settings.cancellation_check_period);
        let mut records = self.chunks.read_physical_chunk(chunk);

        while let Some(record) = records.next().await {
            let record = record.with_context(|| format!("Failed to read {chunk}"))?;
            let discard = match &record {
                LogRecord::Prepare(prepare) => {
                    self.should_discard(ctx, scavenge_point, prepare).await?
                }
                LogRecord::Commit(_) => false,
            };

            if discard {
                rewrite.discarded += 1;
            } else {
                rewrite.kept += 1;
                writer.write_record(&record).await?;
            }

            cancellation.check(ctx)?;
        }
        Ok(rewrite)
    }

    async fn should_discard(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        record: &PrepareRecord,
    ) -> Result<bool> {
        if record.log_position >= scavenge_point.position {
            return Ok(false);
        }

        let unsafe_ignore_hard_deletes = ctx.settings.unsafe_ignore_hard_deletes;
        let info = ctx
            .state
            .chunk_execution_info(&record.stream_id)
            .await?
            .unwrap_or_default();

        if !record.is_self_committed() {
            if !info.is_tombstoned {
                return Ok(false);
            }
            // the transaction of a deleted stream keeps its begin and the tombstone
            return Ok(unsafe_ignore_hard_deletes
                || !(record.is_tombstone() || record.flags.transaction_begin));
        }

        if info.is_tombstoned && unsafe_ignore_hard_deletes {
            info!(
                stream_id = %record.stream_id,
                position = record.log_position,
                "Removing hard deleted stream record"
            );
            return Ok(true);
        }

        if info.discard_point.should_discard(record.event_number) {
            return Ok(true);
        }

        if !info.maybe_discard_point.should_discard(record.event_number) {
            return Ok(false);
        }

        let Some(max_age) = info.max_age else {
            return Ok(false);
        };
        Ok(ChronoDuration::from_std(max_age)
            .ok()
            .and_then(|max_age| scavenge_point.effective_now.checked_sub_signed(max_age))
            .is_some_and(|cutoff| record.timestamp < cutoff))
    }
}
