//! The persisted resume marker of a scavenge run.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::scavenge_point::ScavengePoint;
use super::stream_handle::StreamHandle;

/// Version of the persisted checkpoint layout.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Stage reached by a scavenge run, with what that stage needs to resume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum ScavengeCheckpoint {
    Accumulating {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<i32>,
    },
    Calculating {
        scavenge_point: ScavengePoint,
        done_stream_handle: StreamHandle,
    },
    ExecutingChunks {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<i32>,
    },
    MergingChunks {
        scavenge_point: ScavengePoint,
    },
    ExecutingIndex {
        scavenge_point: ScavengePoint,
    },
    Cleaning {
        scavenge_point: ScavengePoint,
    },
    Done {
        scavenge_point: ScavengePoint,
    },
}

impl ScavengeCheckpoint {
    pub fn scavenge_point(&self) -> &ScavengePoint {
        match self {
            ScavengeCheckpoint::Accumulating { scavenge_point, .. }
            | ScavengeCheckpoint::Calculating { scavenge_point, .. }
            | ScavengeCheckpoint::ExecutingChunks { scavenge_point, .. }
            | ScavengeCheckpoint::MergingChunks { scavenge_point }
            | ScavengeCheckpoint::ExecutingIndex { scavenge_point }
            | ScavengeCheckpoint::Cleaning { scavenge_point }
            | ScavengeCheckpoint::Done { scavenge_point } => scavenge_point,
        }
    }
}

/// Checkpoint as stored in the state database
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCheckpoint {
    pub schema_version: u32,
    pub checkpoint: ScavengeCheckpoint,
}

impl From<ScavengeCheckpoint> for PersistedCheckpoint {
    fn from(checkpoint: ScavengeCheckpoint) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            checkpoint,
        }
    }
}

fn fmt_chunk(done: &Option<i32>) -> String {
    match done {
        Some(chunk) => format!("Chunk {chunk}"),
        None => "None".to_string(),
    }
}

impl fmt::Display for ScavengeCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScavengeCheckpoint::Accumulating {
                scavenge_point,
                done_logical_chunk_number,
            } => write!(
                f,
                "Accumulating {scavenge_point} done {}",
                fmt_chunk(done_logical_chunk_number)
            ),
            ScavengeCheckpoint::Calculating {
                scavenge_point,
                done_stream_handle,
            } => write!(f, "Calculating {scavenge_point} done {done_stream_handle}"),
            ScavengeCheckpoint::ExecutingChunks {
                scavenge_point,
                done_logical_chunk_number,
            } => write!(
                f,
                "Executing chunks for {scavenge_point} done {}",
                fmt_chunk(done_logical_chunk_number)
            ),
            ScavengeCheckpoint::MergingChunks { scavenge_point } => {
                write!(f, "Merging chunks for {scavenge_point}")
            }
            ScavengeCheckpoint::ExecutingIndex { scavenge_point } => {
                write!(f, "Executing index for {scavenge_point}")
            }
            ScavengeCheckpoint::Cleaning { scavenge_point } => {
                write!(f, "Cleaning for {scavenge_point}")
            }
            ScavengeCheckpoint::Done { scavenge_point } => write!(f, "Done {scavenge_point}"),
        }
    }
}
