//! The stages of a scavenge, run in order by the orchestrator.

pub mod accumulator;
pub mod calculator;
pub mod chunk_executor;
pub mod chunk_merger;
pub mod cleaner;
pub mod index_executor;
pub mod weights;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Result, ScavengeError};
use crate::history::ScavengerLog;
use crate::settings::ScavengeSettings;
use crate::state::ScavengeState;
use crate::throttle::Throttle;

pub use accumulator::Accumulator;
pub use calculator::Calculator;
pub use chunk_executor::{ChunkExecutor, SwitchChunksLock};
pub use chunk_merger::ChunkMerger;
pub use cleaner::Cleaner;
pub use index_executor::IndexExecutor;
pub use weights::WeightAccumulator;

/// Everything a stage needs for the duration of one run
pub struct StageContext<'a> {
    pub state: &'a ScavengeState,
    pub settings: &'a ScavengeSettings,
    pub throttle: &'a Throttle,
    pub cancel: &'a CancellationToken,
    pub log: &'a ScavengerLog,
}

impl StageContext<'_> {
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ScavengeError::Cancelled);
        }
        Ok(())
    }
}

/// Checks for cancellation, and rests, every `period` calls.
pub(crate) struct CancellationCheck {
    period: usize,
    counter: usize,
}

impl CancellationCheck {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            counter: 0,
        }
    }

    /// Count a unit of work; checks for cancellation without resting
    pub fn check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        self.counter += 1;
        if self.counter < self.period {
            return Ok(());
        }
        self.counter = 0;
        ctx.check_cancelled()
    }

    /// Count a unit of work; checks for cancellation and rests
    pub async fn tick(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        self.counter += 1;
        if self.counter < self.period {
            return Ok(());
        }
        self.counter = 0;
        ctx.check_cancelled()?;
        ctx.throttle.rest(ctx.cancel).await
    }
}

/// Logical chunk number holding a log position
pub(crate) fn logical_chunk_number(log_position: i64, chunk_size: i64) -> i32 {
    (log_position / chunk_size.max(1)) as i32
}

/// Roll back the open transaction and hand the error back to the caller.
pub(crate) async fn roll_back(state: &ScavengeState, err: ScavengeError) -> ScavengeError {
    if !err.is_cancelled() {
        warn!(error = %err, "Rolling back scavenge transaction");
    }
    if let Err(rollback_err) = state.rollback().await {
        error!(error = %rollback_err, "Failed to roll back scavenge transaction");
    }
    err
}
