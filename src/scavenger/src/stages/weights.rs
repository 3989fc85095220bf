//! Batching of chunk weight increases.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::state::ScavengeState;

/// Weight added to a chunk for a record that will be discarded
pub const DISCARD_WEIGHT: f32 = 2.0;

/// Weight added to a chunk for a record that may be discarded by age
pub const MAYBE_DISCARD_WEIGHT: f32 = 1.0;

/// Collects weight per logical chunk in memory and writes it to the state
/// in one go when flushed.
#[derive(Debug, Default)]
pub struct WeightAccumulator {
    weights: BTreeMap<i32, f32>,
}

impl WeightAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_discard(&mut self, logical_chunk_number: i32) {
        self.add(logical_chunk_number, DISCARD_WEIGHT);
    }

    pub fn on_maybe_discard(&mut self, logical_chunk_number: i32) {
        self.add(logical_chunk_number, MAYBE_DISCARD_WEIGHT);
    }

    fn add(&mut self, logical_chunk_number: i32, weight: f32) {
        *self.weights.entry(logical_chunk_number).or_default() += weight;
    }

    pub fn pending(&self, logical_chunk_number: i32) -> f32 {
        self.weights
            .get(&logical_chunk_number)
            .copied()
            .unwrap_or(0.0)
    }

    pub async fn flush(&mut self, state: &ScavengeState) -> Result<()> {
        for (chunk, weight) in std::mem::take(&mut self.weights) {
            state.increase_chunk_weight(chunk, weight).await?;
        }
        Ok(())
    }
}
