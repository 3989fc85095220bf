//! Cooperative throttling of long running stages.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScavengeError};

struct ThrottleState {
    active_since: Instant,
    total_active: Duration,
    total_rest: Duration,
}

/// Keeps a stage busy for only `active_percent` of wall clock time.
///
/// Stages call [`Throttle::rest`] between units of work. The rest owed is
/// proportional to the time spent working since the last rest.
pub struct Throttle {
    active_percent: u8,
    min_rest: Duration,
    long_rest_warning: Duration,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    pub fn new(active_percent: u8, min_rest: Duration, long_rest_warning: Duration) -> Self {
        Self {
            active_percent: active_percent.clamp(1, 100),
            min_rest,
            long_rest_warning,
            state: Mutex::new(ThrottleState {
                active_since: Instant::now(),
                total_active: Duration::ZERO,
                total_rest: Duration::ZERO,
            }),
        }
    }

    pub fn unthrottled() -> Self {
        Self::new(100, Duration::ZERO, Duration::MAX)
    }

    /// Rest owed for a period of work
    pub fn rest_for(&self, active: Duration) -> Duration {
        if self.active_percent >= 100 {
            return Duration::ZERO;
        }
        let resting_percent = u32::from(100 - self.active_percent);
        active * resting_percent / u32::from(self.active_percent)
    }

    pub async fn rest(&self, cancel: &CancellationToken) -> Result<()> {
        let rest = {
            let state = self.state.lock();
            self.rest_for(state.active_since.elapsed())
        };

        // short rests are deferred until enough work has piled up
        if rest.is_zero() || rest < self.min_rest {
            return Ok(());
        }

        if rest > self.long_rest_warning {
            tracing::warn!(
                rest_ms = rest.as_millis() as u64,
                active_percent = self.active_percent,
                "Scavenge throttle is resting for a long time"
            );
        }

        {
            let mut state = self.state.lock();
            let elapsed = state.active_since.elapsed();
            state.total_active += elapsed;
        }

        tokio::select! {
            _ = tokio::time::sleep(rest) => {}
            _ = cancel.cancelled() => return Err(ScavengeError::Cancelled),
        }

        let mut state = self.state.lock();
        state.total_rest += rest;
        state.active_since = Instant::now();
        Ok(())
    }

    pub fn pretty_totals(&self) -> String {
        let state = self.state.lock();
        format!(
            "Active: {:?}, Rested: {:?}",
            state.total_active + state.active_since.elapsed(),
            state.total_rest
        )
    }
}
