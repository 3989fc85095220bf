//! Chunk merging: combine runs of small chunks into one file.

use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info};

use crate::collaborators::{ChunkManager, PhysicalChunk};
use crate::error::Result;
use crate::model::{ScavengeCheckpoint, ScavengePoint};

use super::chunk_executor::SwitchChunksLock;
use super::StageContext;

pub struct ChunkMerger {
    chunks: Arc<dyn ChunkManager>,
    switch_lock: SwitchChunksLock,
}

impl ChunkMerger {
    pub fn new(chunks: Arc<dyn ChunkManager>, switch_lock: SwitchChunksLock) -> Self {
        Self {
            chunks,
            switch_lock,
        }
    }

    pub async fn merge(&self, ctx: &StageContext<'_>, scavenge_point: &ScavengePoint) -> Result<()> {
        let checkpoint = ScavengeCheckpoint::MergingChunks {
            scavenge_point: scavenge_point.clone(),
        };
        ctx.state.set_checkpoint(&checkpoint).await?;
        self.merge_from(ctx, &checkpoint).await
    }

    /// Merging as a whole is one unit; a resumed run simply merges again
    pub async fn merge_from(
        &self,
        ctx: &StageContext<'_>,
        checkpoint: &ScavengeCheckpoint,
    ) -> Result<()> {
        let scavenge_point = checkpoint.scavenge_point();

        if ctx.settings.archive.is_some() {
            info!("Archiving is enabled, skipping chunk merging");
            return Ok(());
        }
        if !ctx.settings.merge_chunks {
            info!("Chunk merging is disabled");
            return Ok(());
        }

        info!(scavenge_point = %scavenge_point, "Started scavenge chunk merging phase");
        for group in self.merge_groups(scavenge_point).await? {
            ctx.check_cancelled()?;
            if group.len() < 2 {
                continue;
            }

            let completed = {
                let _switch = self.switch_lock.lock().await;
                self.chunks
                    .merge_chunks(&group)
                    .await
                    .context("Failed to merge chunks")?
            };
            let old_size: u64 = group.iter().map(|chunk| chunk.file_size).sum();
            ctx.log
                .chunks_merged(&group, old_size as i64 - completed.file_size as i64);
            ctx.throttle.rest(ctx.cancel).await?;
        }
        Ok(())
    }

    /// Consecutive local chunks whose combined size fits in one chunk
    async fn merge_groups(&self, scavenge_point: &ScavengePoint) -> Result<Vec<Vec<PhysicalChunk>>> {
        let chunk_size = self.chunks.chunk_size();
        let max_size = u64::try_from(chunk_size).unwrap_or(0);
        let mut groups = Vec::new();
        let mut group: Vec<PhysicalChunk> = Vec::new();
        let mut group_size = 0u64;
        let mut position = 0i64;

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
            position = chunk.chunk_end_position;

            if !chunk.is_read_only || chunk.is_remote || chunk.is_raw {
                debug!(chunk = %chunk, "Chunk cannot be merged");
                groups.push(std::mem::take(&mut group));
                group_size = 0;
                continue;
            }

            if !group.is_empty() && group_size + chunk.file_size > max_size {
                groups.push(std::mem::take(&mut group));
                group_size = 0;
            }
            group_size += chunk.file_size;
            group.push(chunk);
        }
        groups.push(group);
        groups.retain(|group| !group.is_empty());
        Ok(groups)
    }
}
