//! Calculation: turn each stream's policy into discard points and chunk weights.

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::collaborators::{EventInfo, IndexReader};
use crate::error::Result;
use crate::model::{DiscardPoint, ScavengeCheckpoint, ScavengePoint, StreamHandle};
use crate::state::data::{CalculationStatus, OriginalStreamData};

use super::weights::WeightAccumulator;
use super::{CancellationCheck, StageContext, logical_chunk_number, roll_back};

/// Event infos read from the index at a time
const EVENT_INFO_SLICE: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DiscardDecision {
    Discard,
    /// Might be old enough to discard; only the record's own timestamp can tell
    MaybeDiscard,
    /// Lives in a chunk that holds no records any more
    AlreadyDiscarded,
    Keep,
}

/// What is known about the stream being calculated
struct StreamCalculation<'a> {
    handle: &'a StreamHandle,
    data: &'a OriginalStreamData,
    last_event_number: i64,
    /// Discard point implied by truncate-before, max count and tombstones
    policy_discard_point: DiscardPoint,
}

pub struct Calculator {
    index: Arc<dyn IndexReader>,
    chunk_size: i64,
}

impl Calculator {
    pub fn new(index: Arc<dyn IndexReader>, chunk_size: i64) -> Self {
        Self { index, chunk_size }
    }

    pub async fn calculate(&self, ctx: &StageContext<'_>, scavenge_point: &ScavengePoint) -> Result<()> {
        info!(scavenge_point = %scavenge_point, "Started scavenge calculation phase");
        let checkpoint = ScavengeCheckpoint::Calculating {
            scavenge_point: scavenge_point.clone(),
            done_stream_handle: StreamHandle::None,
        };
        ctx.state.set_checkpoint(&checkpoint).await?;
        self.calculate_from(ctx, &checkpoint).await
    }

    pub async fn calculate_from(
        &self,
        ctx: &StageContext<'_>,
        checkpoint: &ScavengeCheckpoint,
    ) -> Result<()> {
        let ScavengeCheckpoint::Calculating {
            scavenge_point,
            done_stream_handle,
        } = checkpoint
        else {
            return Err(anyhow::anyhow!("Cannot calculate from checkpoint {checkpoint}").into());
        };
        debug!(checkpoint = %checkpoint, "Calculating from checkpoint");

        let started = Instant::now();
        let mut done = done_stream_handle.clone();
        let mut weights = WeightAccumulator::new();
        let mut cancellation = CancellationCheck::new(ctx.settings.cancellation_check_period);
        let mut total = 0usize;

        loop {
            let batch = ctx
                .state
                .original_streams_after(&done, ctx.settings.checkpoint_period)
                .await?;
            let Some((last_handle, _)) = batch.last() else {
                break;
            };
            let last_handle = last_handle.clone();

            ctx.state.begin().await?;
            match self
                .calculate_batch(
                    ctx,
                    scavenge_point,
                    &batch,
                    &last_handle,
                    &mut weights,
                    &mut cancellation,
                )
                .await
            {
                Ok(calculated) => total += calculated,
                Err(err) => return Err(roll_back(ctx.state, err).await),
            }

            debug!(streams = batch.len(), done = %last_handle, "Calculated batch");
            done = last_handle;
        }

        info!(
            streams = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Calculated discard points"
        );
        ctx.throttle.rest(ctx.cancel).await
    }

    async fn calculate_batch(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        batch: &[(StreamHandle, OriginalStreamData)],
        last_handle: &StreamHandle,
        weights: &mut WeightAccumulator,
        cancellation: &mut CancellationCheck,
    ) -> Result<usize> {
        let mut calculated = 0;
        for (handle, data) in batch {
            if data.status != CalculationStatus::Active {
                continue;
            }
            self.calculate_stream(ctx, scavenge_point, handle, data, weights, cancellation)
                .await?;
            calculated += 1;
        }

        weights.flush(ctx.state).await?;
        ctx.state
            .commit(&ScavengeCheckpoint::Calculating {
                scavenge_point: scavenge_point.clone(),
                done_stream_handle: last_handle.clone(),
            })
            .await?;
        Ok(calculated)
    }

    async fn calculate_stream(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        handle: &StreamHandle,
        data: &OriginalStreamData,
        weights: &mut WeightAccumulator,
        cancellation: &mut CancellationCheck,
    ) -> Result<()> {
        let status = if data.is_tombstoned {
            CalculationStatus::Archived
        } else if data.has_policy() {
            CalculationStatus::Active
        } else {
            CalculationStatus::Spent
        };

        let last_event_number = self
            .index
            .last_event_number(handle, scavenge_point)
            .await
            .with_context(|| format!("Failed to read last event number of {handle}"))?;

        let (discard_point, maybe_discard_point) = match last_event_number {
            Some(last_event_number) => {
                let stream = StreamCalculation {
                    handle,
                    data,
                    last_event_number,
                    policy_discard_point: policy_discard_point(data, last_event_number),
                };
                self.discard_points(ctx, scavenge_point, &stream, weights, cancellation)
                    .await?
            }
            None => (DiscardPoint::KEEP_ALL, DiscardPoint::KEEP_ALL),
        };

        // discard points never move backwards
        let discard_point = data.discard_point.or(discard_point);
        let maybe_discard_point = data
            .maybe_discard_point
            .or(maybe_discard_point)
            .or(discard_point);

        if status != data.status
            || discard_point != data.discard_point
            || maybe_discard_point != data.maybe_discard_point
        {
            ctx.state
                .set_original_stream_discard_points(
                    handle,
                    status,
                    discard_point,
                    maybe_discard_point,
                )
                .await?;
        }
        Ok(())
    }

    /// Walk the stream's events in order until the first one that is kept
    async fn discard_points(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        stream: &StreamCalculation<'_>,
        weights: &mut WeightAccumulator,
        cancellation: &mut CancellationCheck,
    ) -> Result<(DiscardPoint, DiscardPoint)> {
        let mut from_event_number = stream.data.discard_point.first_event_number_to_keep();
        let mut discard_point = DiscardPoint::KEEP_ALL;
        let mut maybe_discard_point = DiscardPoint::KEEP_ALL;
        let mut first = true;
        let mut all_discarded_so_far = true;

        loop {
            let slice = self
                .index
                .read_event_info_forward(
                    stream.handle,
                    from_event_number,
                    EVENT_INFO_SLICE,
                    scavenge_point,
                )
                .await
                .with_context(|| format!("Failed to read event infos of {}", stream.handle))?;

            for info in &slice.events {
                cancellation.tick(ctx).await?;

                if first {
                    discard_point = DiscardPoint::discard_before(info.event_number);
                    maybe_discard_point = discard_point;
                    first = false;
                }

                let chunk = logical_chunk_number(info.log_position, self.chunk_size);
                match self.decide(ctx, scavenge_point, stream, info).await? {
                    DiscardDecision::Discard => {
                        weights.on_discard(chunk);
                        discard_point = DiscardPoint::discard_including(info.event_number);
                        all_discarded_so_far = true;
                    }
                    DiscardDecision::MaybeDiscard => {
                        weights.on_maybe_discard(chunk);
                        maybe_discard_point = DiscardPoint::discard_including(info.event_number);
                        all_discarded_so_far = false;
                    }
                    DiscardDecision::AlreadyDiscarded => {
                        if all_discarded_so_far {
                            discard_point = DiscardPoint::discard_including(info.event_number);
                        }
                    }
                    DiscardDecision::Keep => {
                        return Ok((discard_point, maybe_discard_point.or(discard_point)));
                    }
                }
            }

            if slice.is_end_of_stream {
                if first {
                    return Ok((DiscardPoint::KEEP_ALL, DiscardPoint::KEEP_ALL));
                }
                return Err(anyhow::anyhow!(
                    "Calculated that every event of stream {} should be discarded",
                    stream.handle
                )
                .into());
            }
            from_event_number = slice.next_event_number;
        }
    }

    async fn decide(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
        stream: &StreamCalculation<'_>,
        info: &EventInfo,
    ) -> Result<DiscardDecision> {
        if info.event_number == stream.last_event_number {
            return Ok(DiscardDecision::Keep);
        }

        let chunk = logical_chunk_number(info.log_position, self.chunk_size);
        let Some(range) = ctx.state.chunk_timestamp_range(chunk).await? else {
            return Ok(DiscardDecision::AlreadyDiscarded);
        };

        if stream.policy_discard_point.should_discard(info.event_number) {
            return Ok(DiscardDecision::Discard);
        }

        let Some(max_age) = stream.data.max_age else {
            return Ok(DiscardDecision::Keep);
        };
        let Some(cutoff) = ChronoDuration::from_std(max_age)
            .ok()
            .and_then(|max_age| scavenge_point.effective_now.checked_sub_signed(max_age))
        else {
            return Ok(DiscardDecision::Keep);
        };

        Ok(if range.max < cutoff {
            DiscardDecision::Discard
        } else if range.min >= cutoff {
            DiscardDecision::Keep
        } else {
            DiscardDecision::MaybeDiscard
        })
    }
}

/// Discard point implied by everything except max age. Never reaches the last event.
fn policy_discard_point(data: &OriginalStreamData, last_event_number: i64) -> DiscardPoint {
    let discard_point = if data.is_tombstoned {
        DiscardPoint::discard_before(last_event_number)
    } else {
        let truncate_before = data
            .truncate_before
            .map(DiscardPoint::discard_before)
            .unwrap_or_default();
        let max_count = data
            .max_count
            .map(|max_count| last_event_number - max_count)
            .filter(|discard_up_to| *discard_up_to >= 0)
            .map(DiscardPoint::discard_including)
            .unwrap_or_default();
        truncate_before.or(max_count)
    };
    discard_point.min(DiscardPoint::discard_before(last_event_number))
}
