pub mod checkpoint;
pub mod discard_point;
pub mod metadata;
pub mod records;
pub mod scavenge_point;
pub mod stream_handle;
pub mod streams;

pub use checkpoint::{CHECKPOINT_SCHEMA_VERSION, PersistedCheckpoint, ScavengeCheckpoint};
pub use discard_point::DiscardPoint;
pub use metadata::StreamMetadata;
pub use records::{
    CommitRecord, DELETED_STREAM_EVENT_NUMBER, LogRecord, PrepareFlags, PrepareRecord,
    UNCOMMITTED_EVENT_NUMBER,
};
pub use scavenge_point::{ScavengePoint, ScavengePointPayload};
pub use stream_handle::StreamHandle;
pub use streams::{StreamHasher, Xxh3StreamHasher};
