//! Cached view of how far the archive has got.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::collaborators::ArchiveCheckpointReader;
use crate::error::Result;

const UNKNOWN: i64 = i64::MIN;

/// Remembers the highest archive checkpoint seen and only asks the archive
/// again for positions beyond it.
pub struct AdvancingCheckpoint {
    reader: Arc<dyn ArchiveCheckpointReader>,
    confirmed: AtomicI64,
}

impl AdvancingCheckpoint {
    pub fn new(reader: Arc<dyn ArchiveCheckpointReader>) -> Self {
        Self {
            reader,
            confirmed: AtomicI64::new(UNKNOWN),
        }
    }

    /// Whether the archive holds everything before `position`
    pub async fn is_greater_than_or_equal_to(&self, position: i64) -> Result<bool> {
        if self.confirmed.load(Ordering::Acquire) >= position {
            return Ok(true);
        }

        let latest = self.reader.archive_checkpoint().await?;
        self.confirmed.fetch_max(latest, Ordering::AcqRel);
        Ok(latest >= position)
    }

    /// Forget the cached value so the next question goes to the archive
    pub fn reset(&self) {
        self.confirmed.store(UNKNOWN, Ordering::Release);
    }
}
