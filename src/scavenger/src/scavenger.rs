//! Orchestration of one scavenge run.
//!
//! A run targets a single scavenge point and goes through the stages in
//! order, starting from wherever the persisted checkpoint says the previous
//! run stopped.

use anyhow::Context;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::archive::{
    AdvancingCheckpoint, ChunkRemover, NoopChunkRemover, RetainingChunkRemover,
};
use crate::collaborators::{
    ArchiveCheckpointReader, ChunkManager, IndexReader, IndexScavenger, MIN_INDEX_VERSION,
    ScavengePointSource,
};
use crate::error::{Result, ScavengeError};
use crate::history::{ScavengeResult, ScavengerLog};
use crate::model::{ScavengeCheckpoint, ScavengePoint};
use crate::settings::ScavengeSettings;
use crate::stages::{
    Accumulator, Calculator, ChunkExecutor, ChunkMerger, Cleaner, IndexExecutor, StageContext,
    SwitchChunksLock,
};
use crate::state::ScavengeState;
use crate::status::{ScavengePhase, ScavengeStatusTracker};
use crate::throttle::Throttle;

/// The log as seen by the scavenger
#[derive(Clone)]
pub struct LogCollaborators {
    pub chunks: Arc<dyn ChunkManager>,
    pub index_reader: Arc<dyn IndexReader>,
    pub index_scavenger: Arc<dyn IndexScavenger>,
    pub scavenge_points: Arc<dyn ScavengePointSource>,
}

impl LogCollaborators {
    /// All collaborators served by one object
    pub fn from_log<L>(log: Arc<L>) -> Self
    where
        L: ChunkManager + IndexReader + IndexScavenger + ScavengePointSource + 'static,
    {
        Self {
            chunks: log.clone(),
            index_reader: log.clone(),
            index_scavenger: log.clone(),
            scavenge_points: log,
        }
    }
}

/// How a run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScavengeOutcome {
    pub result: ScavengeResult,
    pub error: Option<String>,
    /// Scavenge point the run targeted, if it got that far
    pub scavenge_point: Option<ScavengePoint>,
}

pub struct Scavenger {
    log: LogCollaborators,
    remover: Arc<dyn ChunkRemover>,
    switch_lock: SwitchChunksLock,
    settings: ScavengeSettings,
    status: ScavengeStatusTracker,
}

impl Scavenger {
    pub fn new(log: LogCollaborators, settings: ScavengeSettings) -> Self {
        Self {
            log,
            remover: Arc::new(NoopChunkRemover),
            switch_lock: SwitchChunksLock::new(),
            settings,
            status: ScavengeStatusTracker::new(),
        }
    }

    /// Retire chunks held by the archive. Ignored unless archiving is enabled.
    pub fn with_archive(mut self, reader: Arc<dyn ArchiveCheckpointReader>) -> Self {
        if let Some(archive) = &self.settings.archive {
            self.remover = Arc::new(RetainingChunkRemover::from_settings(
                archive,
                self.log.chunks.clone(),
                AdvancingCheckpoint::new(reader),
                self.switch_lock.clone(),
            ));
        }
        self
    }

    pub fn with_status_tracker(mut self, status: ScavengeStatusTracker) -> Self {
        self.status = status;
        self
    }

    pub fn settings(&self) -> &ScavengeSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        state: &ScavengeState,
        log: &ScavengerLog,
        cancel: &CancellationToken,
    ) -> ScavengeOutcome {
        let started = Instant::now();
        let mut scavenge_point = None;

        let result = self.run_stages(state, log, cancel, &mut scavenge_point).await;
        if result.is_err() {
            if let Err(err) = state.rollback_if_open().await {
                error!(error = %err, "Failed to roll back after scavenge error");
            }
        }
        info!(collisions = ?state.collisions(), "Scavenge collisions at end");

        let outcome = match result {
            Ok(()) => ScavengeOutcome {
                result: ScavengeResult::Success,
                error: None,
                scavenge_point,
            },
            Err(ScavengeError::Cancelled) => ScavengeOutcome {
                result: ScavengeResult::Stopped,
                error: None,
                scavenge_point,
            },
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Scavenge failed");
                ScavengeOutcome {
                    result: ScavengeResult::Failed,
                    error: Some(err.to_string()),
                    scavenge_point,
                }
            }
            Err(err) => {
                error!(error = %err, "Scavenge errored");
                ScavengeOutcome {
                    result: ScavengeResult::Errored,
                    error: Some(format!("Error while scavenging DB: {err}.")),
                    scavenge_point,
                }
            }
        };

        log.scavenge_completed(outcome.result, outcome.error.as_deref(), started.elapsed());
        outcome
    }

    async fn run_stages(
        &self,
        state: &ScavengeState,
        log: &ScavengerLog,
        cancel: &CancellationToken,
        target: &mut Option<ScavengePoint>,
    ) -> Result<()> {
        let index_version = self
            .log
            .index_scavenger
            .version()
            .await
            .context("Failed to read the index version")?;
        if index_version < MIN_INDEX_VERSION {
            return Err(ScavengeError::Precondition(format!(
                "Cannot scavenge with index version {index_version}. \
                 Rebuild the index to version {MIN_INDEX_VERSION} or later first."
            )));
        }

        state.init().await?;
        info!(collisions = ?state.collisions(), "Scavenge collisions at start");

        let throttle = Throttle::new(
            self.settings.throttle_percent,
            self.settings.min_rest,
            self.settings.long_rest_warning,
        );
        let ctx = StageContext {
            state,
            settings: &self.settings,
            throttle: &throttle,
            cancel,
            log,
        };

        let checkpoint = state.checkpoint().await?;
        let (prev_scavenge_point, resume) = match checkpoint {
            None => (None, None),
            Some(ScavengeCheckpoint::Done { scavenge_point }) => (Some(scavenge_point), None),
            Some(checkpoint) => (None, Some(checkpoint)),
        };

        let scavenge_point = match &resume {
            Some(checkpoint) => {
                info!(checkpoint = %checkpoint, "Resuming scavenge");
                checkpoint.scavenge_point().clone()
            }
            None => match self.next_scavenge_point(prev_scavenge_point.as_ref()).await? {
                Some(scavenge_point) => scavenge_point,
                None => {
                    info!("Scavenge has nothing to do");
                    return Ok(());
                }
            },
        };
        *target = Some(scavenge_point.clone());
        log.scavenge_started(&scavenge_point);

        self.run_from(
            &ctx,
            prev_scavenge_point.as_ref(),
            &scavenge_point,
            resume.as_ref(),
        )
        .await?;

        info!(
            scavenge_point = %scavenge_point,
            throttle = %throttle.pretty_totals(),
            "Scavenge complete"
        );
        Ok(())
    }

    async fn run_from(
        &self,
        ctx: &StageContext<'_>,
        prev_scavenge_point: Option<&ScavengePoint>,
        scavenge_point: &ScavengePoint,
        resume: Option<&ScavengeCheckpoint>,
    ) -> Result<()> {
        let chunks = &self.log.chunks;
        let start = resume.map(stage_order).unwrap_or(0);
        let resume_at = |stage: u8| resume.filter(|checkpoint| stage_order(checkpoint) == stage);

        if start <= 0 {
            let _activity = self.status.start_activity(ScavengePhase::Accumulation);
            let accumulator = Accumulator::new(chunks.clone(), self.log.index_reader.clone());
            match resume_at(0) {
                Some(checkpoint) => accumulator.accumulate_from(ctx, checkpoint).await?,
                None => {
                    accumulator
                        .accumulate(ctx, prev_scavenge_point, scavenge_point)
                        .await?
                }
            }
        }

        if start <= 1 {
            let _activity = self.status.start_activity(ScavengePhase::Calculation);
            let calculator = Calculator::new(self.log.index_reader.clone(), chunks.chunk_size());
            match resume_at(1) {
                Some(checkpoint) => calculator.calculate_from(ctx, checkpoint).await?,
                None => calculator.calculate(ctx, scavenge_point).await?,
            }
        }

        if start <= 2 {
            let _activity = self.status.start_activity(ScavengePhase::ChunkExecution);
            let executor = ChunkExecutor::new(
                chunks.clone(),
                self.remover.clone(),
                self.switch_lock.clone(),
            );
            match resume_at(2) {
                Some(checkpoint) => executor.execute_from(ctx, checkpoint).await?,
                None => executor.execute(ctx, scavenge_point).await?,
            }
        }

        if start <= 3 {
            let _activity = self.status.start_activity(ScavengePhase::ChunkMerging);
            let merger = ChunkMerger::new(chunks.clone(), self.switch_lock.clone());
            match resume_at(3) {
                Some(checkpoint) => merger.merge_from(ctx, checkpoint).await?,
                None => merger.merge(ctx, scavenge_point).await?,
            }
        }

        if start <= 4 {
            let _activity = self.status.start_activity(ScavengePhase::IndexExecution);
            let executor =
                IndexExecutor::new(self.log.index_scavenger.clone(), chunks.clone());
            match resume_at(4) {
                Some(checkpoint) => executor.execute_from(ctx, checkpoint).await?,
                None => executor.execute(ctx, scavenge_point).await?,
            }
        }

        let _activity = self.status.start_activity(ScavengePhase::Cleaning);
        let cleaner = Cleaner::new();
        match resume_at(5) {
            Some(checkpoint) => cleaner.clean_from(ctx, checkpoint).await,
            None => cleaner.clean(ctx, scavenge_point).await,
        }
    }

    /// The scavenge point a new run should target, writing one if needed
    async fn next_scavenge_point(
        &self,
        prev_scavenge_point: Option<&ScavengePoint>,
    ) -> Result<Option<ScavengePoint>> {
        let latest = self
            .log
            .scavenge_points
            .latest_scavenge_point()
            .await
            .context("Failed to read the latest scavenge point")?;

        let expected_event_number = match (&latest, prev_scavenge_point) {
            (None, _) => None,
            (Some(latest), None) => return Ok(Some(latest.clone())),
            (Some(latest), Some(prev)) if prev.event_number < latest.event_number => {
                return Ok(Some(latest.clone()));
            }
            (Some(latest), Some(_)) => Some(latest.event_number),
        };

        if self.settings.sync_only {
            info!("Sync only scavenge and no new scavenge point exists");
            return Ok(None);
        }

        let scavenge_point = self
            .log
            .scavenge_points
            .add_scavenge_point(expected_event_number, self.settings.threshold)
            .await
            .context("Failed to add a scavenge point")?;
        info!(scavenge_point = %scavenge_point, "Added scavenge point");
        Ok(Some(scavenge_point))
    }
}

/// Position of a checkpoint's stage in the pipeline
fn stage_order(checkpoint: &ScavengeCheckpoint) -> u8 {
    match checkpoint {
        ScavengeCheckpoint::Accumulating { .. } => 0,
        ScavengeCheckpoint::Calculating { .. } => 1,
        ScavengeCheckpoint::ExecutingChunks { .. } => 2,
        ScavengeCheckpoint::MergingChunks { .. } => 3,
        ScavengeCheckpoint::ExecutingIndex { .. } => 4,
        ScavengeCheckpoint::Cleaning { .. } => 5,
        ScavengeCheckpoint::Done { .. } => 6,
    }
}
