use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::Configuration;
use common::testing::TestConfigBuilder;

use crate::collaborators::ArchiveCheckpointReader;
use crate::history::{ScavengeRecord, ScavengerLog};
use crate::scavenger::{LogCollaborators, ScavengeOutcome, Scavenger};
use crate::settings::ScavengeSettings;
use crate::state::ScavengeState;
use crate::state::kv::{KvStore, MemoryKvStore};

use super::memory_log::MemoryLog;
use super::tracer::RecordingTracer;

/// What one scavenge run left behind
pub struct ScavengeRun {
    pub outcome: ScavengeOutcome,
    pub record: ScavengeRecord,
    pub trace: Vec<String>,
    pub state: ScavengeState,
}

impl ScavengeRun {
    pub fn traced(&self, line: &str) -> bool {
        self.trace.iter().any(|traced| traced == line)
    }
}

/// Runs scavenges over a [`MemoryLog`].
///
/// The state store outlives each run, so calling [`ScavengeHarness::run`]
/// again behaves like restarting the scavenger.
pub struct ScavengeHarness {
    log: MemoryLog,
    store: Arc<dyn KvStore>,
    config: Configuration,
    archive: Option<Arc<dyn ArchiveCheckpointReader>>,
    cancel_on: Option<String>,
}

impl ScavengeHarness {
    pub fn new(log: &MemoryLog) -> Self {
        Self {
            log: log.clone(),
            store: Arc::new(MemoryKvStore::new()),
            config: TestConfigBuilder::new().build(),
            archive: None,
            cancel_on: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn with_archive(mut self, reader: Arc<dyn ArchiveCheckpointReader>) -> Self {
        self.archive = Some(reader);
        self
    }

    /// Cancel the next runs as soon as `line` is traced
    pub fn cancel_on(mut self, line: impl Into<String>) -> Self {
        self.cancel_on = Some(line.into());
        self
    }

    /// Stop cancelling runs
    pub fn without_cancel(mut self) -> Self {
        self.cancel_on = None;
        self
    }

    pub async fn run(&self) -> ScavengeRun {
        let cancel = CancellationToken::new();
        let tracer = Arc::new(match &self.cancel_on {
            Some(line) => RecordingTracer::cancelling_on(line.clone(), cancel.clone()),
            None => RecordingTracer::new(),
        });

        let settings = ScavengeSettings::from_config(&self.config);
        let state = ScavengeState::new(
            self.store.clone(),
            self.log.hasher(),
            settings.hash_users_cache_capacity,
            tracer.clone(),
        );
        let threads = settings.threads;

        let mut scavenger = Scavenger::new(
            LogCollaborators::from_log(Arc::new(self.log.clone())),
            settings,
        );
        if let Some(reader) = &self.archive {
            scavenger = scavenger.with_archive(reader.clone());
        }

        let log = ScavengerLog::detached(threads);
        let outcome = scavenger.run(&state, &log, &cancel).await;

        ScavengeRun {
            outcome,
            record: log.snapshot(),
            trace: tracer.lines(),
            state,
        }
    }
}
