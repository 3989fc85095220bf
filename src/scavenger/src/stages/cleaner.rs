//! Cleaning: drop state rows the finished run made obsolete.

use tracing::{info, warn};

use crate::error::{Result, ScavengeError};
use crate::model::{ScavengeCheckpoint, ScavengePoint};

use super::{StageContext, roll_back};

#[derive(Debug, Default)]
pub struct Cleaner;

impl Cleaner {
    pub fn new() -> Self {
        Self
    }

    pub async fn clean(&self, ctx: &StageContext<'_>, scavenge_point: &ScavengePoint) -> Result<()> {
        let checkpoint = ScavengeCheckpoint::Cleaning {
            scavenge_point: scavenge_point.clone(),
        };
        ctx.state.set_checkpoint(&checkpoint).await?;
        self.clean_from(ctx, &checkpoint).await
    }

    /// Cleaning takes two committed passes. The first drops obsolete rows and
    /// checkpoints `Cleaning` again, the second marks the run done. Resuming
    /// from `Cleaning` repeats the first pass, which deletes nothing new.
    pub async fn clean_from(
        &self,
        ctx: &StageContext<'_>,
        checkpoint: &ScavengeCheckpoint,
    ) -> Result<()> {
        let scavenge_point = checkpoint.scavenge_point();
        info!(scavenge_point = %scavenge_point, "Started scavenge cleaning phase");

        ctx.check_cancelled()?;
        ctx.state.begin().await?;
        if let Err(err) = self.delete_obsolete_state(ctx, scavenge_point).await {
            return Err(roll_back(ctx.state, err).await);
        }
        ctx.state.clear_caches();

        ctx.check_cancelled()?;
        ctx.state.begin().await?;
        let done = ScavengeCheckpoint::Done {
            scavenge_point: scavenge_point.clone(),
        };
        if let Err(err) = ctx.state.commit(&done).await {
            return Err(roll_back(ctx.state, err).await);
        }
        Ok(())
    }

    async fn delete_obsolete_state(
        &self,
        ctx: &StageContext<'_>,
        scavenge_point: &ScavengePoint,
    ) -> Result<()> {
        let unsafe_ignore_hard_deletes = ctx.settings.unsafe_ignore_hard_deletes;

        if ctx.state.all_chunks_executed().await? {
            ctx.state.delete_metastream_data().await?;
            let deleted = ctx
                .state
                .delete_original_stream_data(unsafe_ignore_hard_deletes)
                .await?;
            info!(streams = deleted, "Deleted obsolete stream data");
        } else if unsafe_ignore_hard_deletes {
            return Err(ScavengeError::Precondition(
                "Cannot clean scavenge state when ignoring hard deletes: \
                 not every chunk with weight was executed"
                    .to_string(),
            ));
        } else {
            warn!("Not every chunk with weight was executed, skipping state cleaning");
        }

        ctx.state
            .commit(&ScavengeCheckpoint::Cleaning {
                scavenge_point: scavenge_point.clone(),
            })
            .await
    }
}
