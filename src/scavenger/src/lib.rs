//! Scavenge engine of a chunked, append-only event log.
//!
//! A scavenge reclaims the space held by records that stream policies
//! (max age, max count, truncate before, tombstones) no longer require. It
//! runs towards a [`model::ScavengePoint`] in stages: accumulate, calculate,
//! execute chunks, merge or retire chunks, execute the index, clean. Progress
//! is checkpointed in [`state::ScavengeState`] so a stopped run resumes where
//! it left off.

pub mod archive;
pub mod collaborators;
pub mod error;
pub mod history;
pub mod metrics;
pub mod model;
pub mod parallel;
pub mod scavenger;
pub mod service;
pub mod settings;
pub mod stages;
pub mod state;
pub mod status;
pub mod throttle;
pub mod tracer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, ScavengeError};
pub use history::{ScavengeHistory, ScavengeRecord, ScavengeResult, ScavengerLog};
pub use scavenger::{LogCollaborators, ScavengeOutcome, Scavenger};
pub use service::{ScavengeService, ServiceError, StartScavengeOptions};
pub use settings::ScavengeSettings;
pub use state::ScavengeState;
