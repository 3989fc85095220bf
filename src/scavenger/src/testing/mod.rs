//! In-memory collaborators and a run harness for exercising the scavenger.
//!
//! Available under `cfg(test)` and with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! scavenger = { path = "../scavenger", features = ["testing"] }
//! ```

mod archive;
mod harness;
mod hasher;
mod memory_log;
mod tracer;

pub use archive::MemoryArchiveCheckpoint;
pub use harness::{ScavengeHarness, ScavengeRun};
pub use hasher::HumanReadableHasher;
pub use memory_log::{DEFAULT_CHUNK_SIZE, MemoryLog, Retirement};
pub use tracer::RecordingTracer;
