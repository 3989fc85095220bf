//! Point-in-time gauge of the scavenge pipeline phase.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ScavengePhase {
    Idle = 0,
    Accumulation = 1,
    Calculation = 2,
    ChunkExecution = 3,
    ChunkMerging = 4,
    IndexExecution = 5,
    Cleaning = 6,
}

impl ScavengePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScavengePhase::Accumulation,
            2 => ScavengePhase::Calculation,
            3 => ScavengePhase::ChunkExecution,
            4 => ScavengePhase::ChunkMerging,
            5 => ScavengePhase::IndexExecution,
            6 => ScavengePhase::Cleaning,
            _ => ScavengePhase::Idle,
        }
    }
}

impl fmt::Display for ScavengePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared handle to the current phase
#[derive(Clone, Debug, Default)]
pub struct ScavengeStatusTracker {
    phase: Arc<AtomicU8>,
}

impl ScavengeStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ScavengePhase {
        ScavengePhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    /// Enter a phase until the returned guard is dropped
    pub fn start_activity(&self, phase: ScavengePhase) -> Activity {
        self.phase.store(phase as u8, Ordering::Relaxed);
        Activity {
            phase: self.phase.clone(),
        }
    }
}

/// Resets the tracker to idle when dropped
#[must_use]
pub struct Activity {
    phase: Arc<AtomicU8>,
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.phase.store(ScavengePhase::Idle as u8, Ordering::Relaxed);
    }
}
