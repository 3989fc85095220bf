//! Accumulation: scan the log for the facts the later stages need.
//!
//! For every stream seen the accumulator runs collision detection. Metadata
//! records update the policy of the stream they describe, tombstones mark a
//! stream deleted, and each logical chunk's timestamp range is recorded.

use anyhow::Context;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{ChunkManager, IndexReader};
use crate::error::{Result, ScavengeError};
use crate::model::{
    DiscardPoint, LogRecord, PrepareRecord, ScavengeCheckpoint, ScavengePoint, StreamMetadata,
    streams,
};
use crate::state::data::ChunkTimeStampRange;

use super::weights::WeightAccumulator;
use super::{CancellationCheck, StageContext, logical_chunk_number, roll_back};

/// Metadata records read when checking whether a metadata record is in order
const METADATA_ORDERING_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct ChunkAccumulation {
    originals: usize,
    metadatas: usize,
    tombstones: usize,
    timestamps: Option<ChunkTimeStampRange>,
    /// The scavenge point has not been reached yet
    more: bool,
}

impl ChunkAccumulation {
    fn records(&self) -> usize {
        self.originals + self.metadatas + self.tombstones
    }
}

enum MetadataOrder {
    InOrder { replaced_position: Option<i64> },
    OutOfOrder,
}

pub struct Accumulator {
    chunks: Arc<dyn ChunkManager>,
    index: Arc<dyn IndexReader>,
}

impl Accumulator {
    pub fn new(chunks: Arc<dyn ChunkManager>, index: Arc<dyn IndexReader>) -> Self {
        Self { chunks, index }
    }

    /// Start accumulating towards a new scavenge point.
    ///
    /// Chunks up to the previous scavenge point were accumulated by the
    /// previous run; a scavenge point always completes its chunk.
    pub async fn accumulate(
        &self,
        ctx: &StageContext<'_>,
        prev_scavenge_point: Option<&ScavengePoint>,
        scavenge_point: &ScavengePoint,
    ) -> Result<()> {
        let from = prev_scavenge_point
            .map(ScavengePoint::name)
            .unwrap_or_else(|| "beginning of log".to_string());
        info!(
            from = %from,
            to = %scavenge_point,
            "Started scavenge accumulation phase"
        );

        let chunk_size = self.chunks.chunk_size();
        let checkpoint = ScavengeCheckpoint::Accumulating {
            scavenge_point: scavenge_point.clone(),
            done_logical_chunk_number: prev_scavenge_point
                .map(|sp| logical_chunk_number(sp.position, chunk_size)),
        };
        ctx.state.set_checkpoint(&checkpoint).await?;
        self.accumulate_from(ctx, &checkpoint).await
    }

    /// Resume accumulation from a checkpoint
    pub async fn accumulate_from(
        &self,
        ctx: &StageContext<'_>,
        checkpoint: &ScavengeCheckpoint,
    ) -> Result<()> {
        let ScavengeCheckpoint::Accumulating {
            scavenge_point,
            done_logical_chunk_number,
        } = checkpoint
        else {
            return Err(anyhow::anyhow!("Cannot accumulate from checkpoint {checkpoint}").into());
        };
        debug!(checkpoint = %checkpoint, "Accumulating from checkpoint");

        let chunk_size = self.chunks.chunk_size();
        let mut logical_chunk = done_logical_chunk_number.map(|n| n + 1).unwrap_or(0);
        let mut weights = WeightAccumulator::new();
        let mut cancellation = CancellationCheck::new(ctx.settings.cancellation_check_period);
        let mut last_accumulated = None;

        while i64::from(logical_chunk) * chunk_size <= scavenge_point.position {
            let started = Instant::now();
            ctx.state.begin().await?;

            let accumulated = match self
                .accumulate_chunk_in_transaction(
                    ctx,
                    scavenge_point,
                    logical_chunk,
                    &mut weights,
                    &mut cancellation,
                )
                .await
            {
                Ok(accumulated) => accumulated,
                Err(err) => return Err(roll_back(ctx.state, err).await),
            };

            debug!(
                chunk = logical_chunk,
                records = accumulated.records(),
                originals = accumulated.originals,
                metadatas = accumulated.metadatas,
                tombstones = accumulated.tombstones,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Accumulated chunk"
            );

            if !accumulated.more {
                return Ok(());
            }
            last_accumulated = Some(logical_chunk);
            logical_chunk += 1;
        }

        if let Some(last_chunk) = last_accumulated {
            warn!(
                scavenge_point = %scavenge_point,
                position = scavenge_point.position,
                last_chunk,
                "Ran out of log before reaching the scavenge point record"
            );
        }
        Ok(())
    }

    async fn accumulate_chunk_in_transaction(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        logical_chunk: i32,
        weights: &mut WeightAccumulator,
        cancellation: &mut CancellationCheck,
    ) -> Result<ChunkAccumulation> {
        let accumulated = self
            .accumulate_chunk(ctx, scavenge_point, logical_chunk, weights, cancellation)
            .await?;

        if let Some(range) = accumulated.timestamps {
            ctx.state
                .set_chunk_timestamp_range(logical_chunk, range)
                .await?;
        }
        weights.flush(ctx.state).await?;
        ctx.state
            .commit(&ScavengeCheckpoint::Accumulating {
                scavenge_point: scavenge_point.clone(),
                done_logical_chunk_number: Some(logical_chunk),
            })
            .await?;
        Ok(accumulated)
    }

    async fn accumulate_chunk(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        logical_chunk: i32,
        weights: &mut WeightAccumulator,
        cancellation: &mut CancellationCheck,
    ) -> Result<ChunkAccumulation> {
        let mut accumulated = ChunkAccumulation {
            more: true,
            ..Default::default()
        };
        let mut records = self.chunks.read_logical_chunk(logical_chunk);

        while let Some(record) = records.next().await {
            let record =
                record.with_context(|| format!("Failed to read logical chunk {logical_chunk}"))?;

            if record.log_position() > scavenge_point.position {
                return Err(anyhow::anyhow!(
                    "Accumulator expected to find {scavenge_point} at position {} before position {}",
                    scavenge_point.position,
                    record.log_position()
                )
                .into());
            }

            if let LogRecord::Prepare(prepare) = &record {
                if prepare.is_tombstone() {
                    self.process_tombstone(ctx, scavenge_point, prepare, weights)
                        .await?;
                    accumulated.tombstones += 1;
                } else if streams::is_metastream(&prepare.stream_id) {
                    self.process_metadata(ctx, scavenge_point, prepare, weights)
                        .await?;
                    accumulated.metadatas += 1;
                } else {
                    ctx.state.detect_collisions(&prepare.stream_id).await?;
                    accumulated.originals += 1;
                }

                match accumulated.timestamps.as_mut() {
                    Some(range) => range.extend(prepare.timestamp),
                    None => {
                        accumulated.timestamps =
                            Some(ChunkTimeStampRange::new(prepare.timestamp, prepare.timestamp))
                    }
                }
            }

            if record.log_position() == scavenge_point.position {
                accumulated.more = false;
                break;
            }

            cancellation.tick(ctx).await?;
        }

        Ok(accumulated)
    }

    async fn process_metadata(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        record: &PrepareRecord,
        weights: &mut WeightAccumulator,
    ) -> Result<()> {
        let metastream_id = record.stream_id.as_str();
        let original_stream_id = streams::original_stream_of(metastream_id);
        ctx.state.detect_collisions(original_stream_id).await?;
        ctx.state.detect_collisions(metastream_id).await?;

        if record.event_number < 0 {
            return Err(ScavengeError::Integrity(format!(
                "Found metadata in transaction in stream {metastream_id}"
            )));
        }

        let chunk_size = self.chunks.chunk_size();
        match self.metadata_order(ctx, scavenge_point, record).await? {
            MetadataOrder::OutOfOrder => {
                weights.on_discard(logical_chunk_number(record.log_position, chunk_size));
                info!(
                    stream_id = %metastream_id,
                    event_number = record.event_number,
                    "Found out of order metadata, ignoring it"
                );
                return Ok(());
            }
            MetadataOrder::InOrder { replaced_position } => {
                if let Some(position) = replaced_position {
                    weights.on_discard(logical_chunk_number(position, chunk_size));
                }
            }
        }

        // metadata of a metastream is only honoured when every chunk is rewritten
        if !streams::is_metastream(original_stream_id) || scavenge_point.threshold < 0 {
            let metadata = StreamMetadata::parse(&record.data);
            ctx.state
                .set_original_stream_metadata(original_stream_id, &metadata)
                .await?;
        }

        let discard_point = DiscardPoint::discard_before(record.event_number);
        if !discard_point.is_keep_all() {
            ctx.state
                .set_metastream_discard_point(metastream_id, discard_point)
                .await?;
        }
        Ok(())
    }

    /// A metadata record is out of order when an earlier record of the
    /// metastream already carries its event number or a later one.
    async fn metadata_order(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        record: &PrepareRecord,
    ) -> Result<MetadataOrder> {
        let from_event_number = (record.event_number - 1).max(0);
        let slice = self
            .index
            .read_event_info_forward(
                &ctx.state.stream_handle(&record.stream_id),
                from_event_number,
                METADATA_ORDERING_WINDOW,
                scavenge_point,
            )
            .await
            .context("Failed to read metadata event infos")?;

        let out_of_order = slice.events.iter().any(|info| {
            info.log_position < record.log_position && info.event_number >= record.event_number
        });
        if out_of_order {
            return Ok(MetadataOrder::OutOfOrder);
        }

        let replaced_position = slice
            .events
            .first()
            .filter(|info| {
                info.event_number < record.event_number && info.log_position < record.log_position
            })
            .map(|info| info.log_position);
        Ok(MetadataOrder::InOrder { replaced_position })
    }

    async fn process_tombstone(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        record: &PrepareRecord,
        weights: &mut WeightAccumulator,
    ) -> Result<()> {
        let stream_id = record.stream_id.as_str();
        ctx.state.detect_collisions(stream_id).await?;

        if streams::is_metastream(stream_id) {
            return Err(ScavengeError::Integrity(format!(
                "Found Tombstone in metadata stream {stream_id}"
            )));
        }
        if record.event_number < 0 {
            return Err(ScavengeError::Integrity(format!(
                "Found Tombstone in transaction in stream {stream_id}"
            )));
        }

        ctx.state.set_original_stream_tombstone(stream_id).await?;

        let metastream_id = streams::metastream_of(stream_id);
        ctx.state.detect_collisions(&metastream_id).await?;
        ctx.state.set_metastream_tombstone(&metastream_id).await?;

        // the final metadata record outlives the stream unless hard deletes are ignored
        if !ctx.settings.unsafe_ignore_hard_deletes {
            return Ok(());
        }
        let last_metadata = self
            .index
            .read_event_info_backward(
                &ctx.state.stream_handle(&metastream_id),
                None,
                1,
                scavenge_point,
            )
            .await
            .context("Failed to read the last metadata record")?;
        for info in last_metadata {
            weights.on_discard(logical_chunk_number(info.log_position, self.chunks.chunk_size()));
        }
        Ok(())
    }
}
