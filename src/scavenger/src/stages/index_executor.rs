//! Index execution: drop index entries of discarded records.

use anyhow::Context;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::collaborators::{ChunkManager, IndexEntry, IndexScavenger};
use crate::error::Result;
use crate::model::{ScavengeCheckpoint, ScavengePoint, StreamHandle};
use crate::state::data::IndexExecutionInfo;

use super::{CancellationCheck, StageContext};

/// Index entries removed per call to the index
const REMOVE_BATCH_SIZE: usize = 1000;

/// Who an index entry under a colliding hash belongs to
enum EntryOwner {
    /// The record was scavenged away; the entry cannot be attributed
    RecordGone,
    Stream(Option<IndexExecutionInfo>),
}

pub struct IndexExecutor {
    index: Arc<dyn IndexScavenger>,
    chunks: Arc<dyn ChunkManager>,
}

impl IndexExecutor {
    pub fn new(index: Arc<dyn IndexScavenger>, chunks: Arc<dyn ChunkManager>) -> Self {
        Self { index, chunks }
    }

    pub async fn execute(&self, ctx: &StageContext<'_>, scavenge_point: &ScavengePoint) -> Result<()> {
        let checkpoint = ScavengeCheckpoint::ExecutingIndex {
            scavenge_point: scavenge_point.clone(),
        };
        ctx.state.set_checkpoint(&checkpoint).await?;
        self.execute_from(ctx, &checkpoint).await
    }

    /// The index is scavenged in one pass; a resumed run scans it again
    pub async fn execute_from(
        &self,
        ctx: &StageContext<'_>,
        checkpoint: &ScavengeCheckpoint,
    ) -> Result<()> {
        let scavenge_point = checkpoint.scavenge_point();
        info!(scavenge_point = %scavenge_point, "Started scavenge index execution phase");

        let started = Instant::now();
        let mut cancellation = CancellationCheck::new(ctx.settings.cancellation_check_period);
        let mut current_hash: Option<(u64, Option<IndexExecutionInfo>)> = None;
        let mut to_remove = Vec::with_capacity(REMOVE_BATCH_SIZE);
        let mut removed = 0u64;

        let mut entries = self.index.entries(scavenge_point);
        while let Some(entry) = entries.next().await {
            let entry = entry.context("Failed to read the index")?;
            cancellation.tick(ctx).await?;

            let remove = if ctx.state.is_colliding_hash(entry.stream_hash) {
                match self.colliding_entry_owner(ctx, &entry).await? {
                    EntryOwner::RecordGone => true,
                    EntryOwner::Stream(info) => should_remove(ctx, info.as_ref(), &entry),
                }
            } else {
                let info = match &current_hash {
                    Some((hash, info)) if *hash == entry.stream_hash => info.clone(),
                    _ => {
                        let info = ctx
                            .state
                            .index_execution_info(&StreamHandle::Hash(entry.stream_hash))
                            .await?;
                        current_hash = Some((entry.stream_hash, info.clone()));
                        info
                    }
                };
                should_remove(ctx, info.as_ref(), &entry)
            };

            if remove {
                to_remove.push(entry);
                if to_remove.len() >= REMOVE_BATCH_SIZE {
                    removed += self.remove(&mut to_remove).await?;
                }
            }
        }
        removed += self.remove(&mut to_remove).await?;

        ctx.log.index_executed(removed, started.elapsed());
        Ok(())
    }

    /// Entries under a colliding hash are attributed through their record
    async fn colliding_entry_owner(
        &self,
        ctx: &StageContext<'_>,
        entry: &IndexEntry,
    ) -> Result<EntryOwner> {
        let stream_id = self
            .chunks
            .lookup_stream_id(entry.log_position)
            .await
            .with_context(|| format!("Failed to look up the record at {}", entry.log_position))?;

        // only a scavenge removes records, and only discarded ones
        let Some(stream_id) = stream_id else {
            debug!(
                position = entry.log_position,
                "Record of colliding index entry is gone, removing the entry"
            );
            return Ok(EntryOwner::RecordGone);
        };
        let info = ctx
            .state
            .index_execution_info(&StreamHandle::Id(stream_id))
            .await?;
        Ok(EntryOwner::Stream(info))
    }

    async fn remove(&self, entries: &mut Vec<IndexEntry>) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.index
            .remove_entries(entries)
            .await
            .context("Failed to remove index entries")?;
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }
}

fn should_remove(
    ctx: &StageContext<'_>,
    info: Option<&IndexExecutionInfo>,
    entry: &IndexEntry,
) -> bool {
    let Some(info) = info else {
        return false;
    };
    if info.is_tombstoned && ctx.settings.unsafe_ignore_hard_deletes {
        return true;
    }
    info.discard_point.should_discard(entry.event_number)
}
