//! Unit-of-work transactions that commit together with a checkpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, ScavengeError};
use crate::model::{PersistedCheckpoint, ScavengeCheckpoint};
use crate::tracer::Tracer;

use super::kv::KvStore;
use super::map::ScavengeMap;

const CHECKPOINT_KEY: &str = "checkpoint";

/// Brackets the writes of one unit of work.
///
/// A transaction either commits together with the checkpoint that says the
/// work is done, or rolls back entirely. Calls out of order are faults.
pub struct TransactionManager {
    store: Arc<dyn KvStore>,
    checkpoints: ScavengeMap<String, PersistedCheckpoint>,
    began: AtomicBool,
    tracer: Arc<dyn Tracer>,
}

impl TransactionManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        checkpoints: ScavengeMap<String, PersistedCheckpoint>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            store,
            checkpoints,
            began: AtomicBool::new(false),
            tracer,
        }
    }

    pub fn is_open(&self) -> bool {
        self.began.load(Ordering::SeqCst)
    }

    pub async fn begin(&self) -> Result<()> {
        if self.began.swap(true, Ordering::SeqCst) {
            return Err(ScavengeError::TransactionMisuse(
                "Cannot begin a transaction that has already begun",
            ));
        }
        self.tracer.trace("Begin");
        if let Err(e) = self.store.begin().await {
            self.began.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn commit(&self, checkpoint: &ScavengeCheckpoint) -> Result<()> {
        if !self.began.load(Ordering::SeqCst) {
            return Err(ScavengeError::TransactionMisuse(
                "Cannot commit a transaction that has not begun",
            ));
        }
        self.tracer.trace(&format!("Checkpoint: {checkpoint}"));
        self.checkpoints
            .set(
                &CHECKPOINT_KEY.to_string(),
                &PersistedCheckpoint::from(checkpoint.clone()),
            )
            .await?;
        self.store.commit().await?;
        self.began.store(false, Ordering::SeqCst);
        self.tracer.trace("Commit");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        if !self.began.load(Ordering::SeqCst) {
            return Err(ScavengeError::TransactionMisuse(
                "Cannot rollback a transaction that has not begun",
            ));
        }
        self.store.rollback().await?;
        self.began.store(false, Ordering::SeqCst);
        self.tracer.trace("Rollback");
        Ok(())
    }

    pub async fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>> {
        Ok(self
            .checkpoints
            .get(&CHECKPOINT_KEY.to_string())
            .await?
            .map(|persisted| persisted.checkpoint))
    }
}
