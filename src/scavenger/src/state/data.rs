//! Rows kept per stream and per chunk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::model::{DiscardPoint, StreamMetadata};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationStatus {
    /// Needs calculating in every run
    #[default]
    Active,
    /// No policy left; the row is deleted when the run is cleaned
    Spent,
    /// Tombstoned; nothing further can happen to the stream
    Archived,
}

impl fmt::Display for CalculationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalculationStatus::Active => "Active",
            CalculationStatus::Spent => "Spent",
            CalculationStatus::Archived => "Archived",
        };
        write!(f, "{name}")
    }
}

/// What is known about a plain stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalStreamData {
    #[serde(with = "humantime_serde", default)]
    pub max_age: Option<Duration>,
    pub max_count: Option<i64>,
    pub truncate_before: Option<i64>,
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub status: CalculationStatus,
}

impl OriginalStreamData {
    /// Replace the policy, keeping what was already calculated
    pub fn apply_metadata(&mut self, metadata: &StreamMetadata) {
        self.max_age = metadata.max_age;
        self.max_count = metadata.max_count;
        self.truncate_before = metadata.truncate_before;
        self.status = CalculationStatus::Active;
    }

    pub fn has_policy(&self) -> bool {
        self.max_age.is_some() || self.max_count.is_some() || self.truncate_before.is_some()
    }
}

/// What is known about a metastream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetastreamData {
    /// Everything before the newest metadata record
    pub discard_point: DiscardPoint,
    /// The stream it describes is tombstoned
    pub is_tombstoned: bool,
}

/// Oldest and newest record timestamps found in a logical chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTimeStampRange {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

impl ChunkTimeStampRange {
    pub fn new(min: DateTime<Utc>, max: DateTime<Utc>) -> Self {
        Self { min, max }
    }

    pub fn extend(&mut self, timestamp: DateTime<Utc>) {
        self.min = self.min.min(timestamp);
        self.max = self.max.max(timestamp);
    }
}

/// What the chunk executor needs to decide about one stream's records
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkExecutionInfo {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub max_age: Option<Duration>,
}

/// What the index executor needs to decide about one stream's entries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexExecutionInfo {
    pub is_metastream: bool,
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
}
