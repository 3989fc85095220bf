//! Background scavenges started and stopped on request.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use common::Configuration;

use crate::archive::ObjectStoreCheckpointReader;
use crate::collaborators::ArchiveCheckpointReader;
use crate::history::{ScavengeHistory, ScavengeRecord, ScavengeResult, ScavengerLog};
use crate::model::StreamHasher;
use crate::scavenger::{LogCollaborators, ScavengeOutcome, Scavenger};
use crate::settings::ScavengeSettings;
use crate::state::ScavengeState;
use crate::state::kv::KvStore;
use crate::state::sqlite::SqliteKvStore;
use crate::status::{ScavengePhase, ScavengeStatusTracker};
use crate::tracer::NoopTracer;

/// Request to start a scavenge
#[derive(Clone, Debug, Default)]
pub struct StartScavengeOptions {
    /// Only 0 is accepted; runs resume from their own checkpoint
    pub start_from_chunk: i32,
    pub threads: Option<usize>,
    pub threshold: Option<i32>,
    pub throttle_percent: Option<u8>,
    /// Finish a pending scavenge point but never write a new one
    pub sync_only: bool,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Scavenge {0} is already running")]
    InProgress(Uuid),

    #[error("Starting from chunk {0} is not supported, scavenges resume from their checkpoint")]
    UnsupportedStartFromChunk(i32),

    #[error("Scavenge {0} is not running")]
    NotRunning(Uuid),
}

#[derive(Clone, Debug, Serialize)]
pub struct ScavengeProgress {
    pub phase: ScavengePhase,
    pub current: Option<ScavengeRecord>,
}

/// Where each run keeps its state
#[derive(Clone)]
enum StateStore {
    /// A sqlite database opened for the run and closed after it
    Sqlite(String),
    Shared(Arc<dyn KvStore>),
}

struct RunningScavenge {
    scavenge_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<ScavengeOutcome>,
}

/// Runs at most one scavenge at a time in a background task.
pub struct ScavengeService {
    log: LogCollaborators,
    hasher: Arc<dyn StreamHasher>,
    config: Configuration,
    archive: Option<Arc<dyn ArchiveCheckpointReader>>,
    store: StateStore,
    status: ScavengeStatusTracker,
    history: ScavengeHistory,
    current: Mutex<Option<RunningScavenge>>,
}

impl ScavengeService {
    pub fn new(log: LogCollaborators, hasher: Arc<dyn StreamHasher>, config: Configuration) -> Self {
        let store = StateStore::Sqlite(config.database.dsn.clone());
        Self {
            log,
            hasher,
            config,
            archive: None,
            store,
            status: ScavengeStatusTracker::new(),
            history: ScavengeHistory::new(),
            current: Mutex::new(None),
        }
    }

    /// Keep state in the given store instead of the configured database
    pub fn with_state_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = StateStore::Shared(store);
        self
    }

    pub fn with_archive(mut self, reader: Arc<dyn ArchiveCheckpointReader>) -> Self {
        self.archive = Some(reader);
        self
    }

    /// Read the archive checkpoint from the configured archive store
    pub fn with_configured_archive(self) -> anyhow::Result<Self> {
        let reader = ObjectStoreCheckpointReader::from_config(&self.config.archive)?;
        Ok(self.with_archive(Arc::new(reader)))
    }

    /// Start a scavenge in the background. Must be called within a tokio runtime.
    pub fn start(&self, options: StartScavengeOptions) -> Result<Uuid, ServiceError> {
        if options.start_from_chunk != 0 {
            return Err(ServiceError::UnsupportedStartFromChunk(
                options.start_from_chunk,
            ));
        }

        let mut current = self.current.lock();
        if let Some(running) = current.as_ref().filter(|running| !running.handle.is_finished()) {
            return Err(ServiceError::InProgress(running.scavenge_id));
        }

        let settings = self.settings_for(&options);
        let log = self.history.begin(settings.threads);
        let scavenge_id = log.scavenge_id();
        info!(
            scavenge_id = %scavenge_id,
            threads = settings.threads,
            threshold = settings.threshold,
            sync_only = settings.sync_only,
            "Starting scavenge"
        );

        let capacity = settings.hash_users_cache_capacity;
        let mut scavenger = Scavenger::new(self.log.clone(), settings)
            .with_status_tracker(self.status.clone());
        if let Some(reader) = &self.archive {
            scavenger = scavenger.with_archive(reader.clone());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_scavenge(
            scavenger,
            self.store.clone(),
            self.hasher.clone(),
            capacity,
            log,
            cancel.clone(),
        ));

        *current = Some(RunningScavenge {
            scavenge_id,
            cancel,
            handle,
        });
        Ok(scavenge_id)
    }

    /// Ask a running scavenge to stop. It ends with the Stopped result.
    pub fn stop(&self, scavenge_id: Uuid) -> Result<(), ServiceError> {
        let current = self.current.lock();
        match current.as_ref() {
            Some(running) if running.scavenge_id == scavenge_id && !running.handle.is_finished() => {
                info!(scavenge_id = %scavenge_id, "Stopping scavenge");
                running.cancel.cancel();
                Ok(())
            }
            _ => Err(ServiceError::NotRunning(scavenge_id)),
        }
    }

    /// Wait for the current scavenge to finish
    pub async fn wait(&self) -> Option<ScavengeOutcome> {
        let running = self.current.lock().take()?;
        match running.handle.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(scavenge_id = %running.scavenge_id, error = %err, "Scavenge task failed");
                None
            }
        }
    }

    pub fn progress(&self) -> ScavengeProgress {
        let current = self
            .current
            .lock()
            .as_ref()
            .and_then(|running| self.history.get(&running.scavenge_id));
        ScavengeProgress {
            phase: self.status.current(),
            current,
        }
    }

    /// Newest first
    pub fn history(&self) -> Vec<ScavengeRecord> {
        self.history.list()
    }

    pub fn scavenge(&self, scavenge_id: &Uuid) -> Option<ScavengeRecord> {
        self.history.get(scavenge_id)
    }

    fn settings_for(&self, options: &StartScavengeOptions) -> ScavengeSettings {
        let mut settings = ScavengeSettings::from_config(&self.config);
        if let Some(threads) = options.threads {
            settings = settings.with_threads(threads);
        }
        if let Some(threshold) = options.threshold {
            settings.threshold = threshold;
        }
        if let Some(throttle_percent) = options.throttle_percent {
            settings.throttle_percent = throttle_percent.clamp(1, 100);
        }
        settings.sync_only |= options.sync_only;
        settings
    }
}

async fn run_scavenge(
    scavenger: Scavenger,
    store: StateStore,
    hasher: Arc<dyn StreamHasher>,
    capacity: usize,
    log: ScavengerLog,
    cancel: CancellationToken,
) -> ScavengeOutcome {
    let (kv, sqlite): (Arc<dyn KvStore>, Option<Arc<SqliteKvStore>>) = match store {
        StateStore::Shared(kv) => (kv, None),
        StateStore::Sqlite(dsn) => match SqliteKvStore::open(&dsn).await {
            Ok(sqlite) => {
                let sqlite = Arc::new(sqlite);
                (sqlite.clone() as Arc<dyn KvStore>, Some(sqlite))
            }
            Err(err) => {
                error!(error = %err, "Failed to open scavenge state");
                let message = format!("Error while scavenging DB: {err}.");
                log.scavenge_completed(ScavengeResult::Errored, Some(&message), Default::default());
                return ScavengeOutcome {
                    result: ScavengeResult::Errored,
                    error: Some(message),
                    scavenge_point: None,
                };
            }
        },
    };

    let state = ScavengeState::new(kv, hasher, capacity, Arc::new(NoopTracer));
    let outcome = scavenger.run(&state, &log, &cancel).await;
    drop(state);

    if let Some(sqlite) = sqlite {
        match Arc::try_unwrap(sqlite) {
            Ok(sqlite) => sqlite.close().await,
            Err(_) => error!("Scavenge state is still in use after the run"),
        }
    }
    outcome
}
