use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker delimiting one scavenge run.
///
/// Records at or after `position` are out of reach of the run; `effective_now`
/// is the clock used for every age calculation in the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengePoint {
    /// Log position of the scavenge point record
    pub position: i64,
    /// Event number of the record in the scavenge points stream, its ordinal
    pub event_number: i64,
    pub effective_now: DateTime<Utc>,
    /// Chunk weight a chunk must exceed to be rewritten in this run
    pub threshold: i32,
}

impl ScavengePoint {
    pub fn new(
        position: i64,
        event_number: i64,
        effective_now: DateTime<Utc>,
        threshold: i32,
    ) -> Self {
        Self {
            position,
            event_number,
            effective_now,
            threshold,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ScavengePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SP-{}", self.event_number)
    }
}

/// Payload of a scavenge point record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScavengePointPayload {
    pub effective_now: DateTime<Utc>,
    pub threshold: i32,
}
