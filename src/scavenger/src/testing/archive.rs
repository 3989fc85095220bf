use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::collaborators::ArchiveCheckpointReader;

/// Archive checkpoint a test moves by hand.
///
/// Scripted positions are handed out one per query and then stick; once the
/// script runs out the last position keeps being returned.
#[derive(Debug, Default)]
pub struct MemoryArchiveCheckpoint {
    position: AtomicI64,
    script: Mutex<VecDeque<i64>>,
    queries: AtomicUsize,
}

impl MemoryArchiveCheckpoint {
    pub fn new(position: i64) -> Self {
        Self {
            position: AtomicI64::new(position),
            ..Default::default()
        }
    }

    /// Positions returned by the next queries, in order
    pub fn scripted(positions: impl IntoIterator<Item = i64>) -> Self {
        Self {
            script: Mutex::new(positions.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn set(&self, position: i64) {
        self.position.store(position, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveCheckpointReader for MemoryArchiveCheckpoint {
    async fn archive_checkpoint(&self) -> Result<i64> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(position) = self.script.lock().pop_front() {
            self.position.store(position, Ordering::SeqCst);
        }
        Ok(self.position.load(Ordering::SeqCst))
    }
}
