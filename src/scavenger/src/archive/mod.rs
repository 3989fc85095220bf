//! Archive aware retention of chunks.
//!
//! When an archive holds the log, old chunks are retired from local storage
//! instead of being merged: once a chunk is past both retention limits and
//! the archive confirms it holds the chunk, the local copy is replaced by a
//! remote locator or deleted.

pub mod advancing_checkpoint;
pub mod object_store_reader;
pub mod remover;

pub use advancing_checkpoint::AdvancingCheckpoint;
pub use object_store_reader::{ObjectStoreCheckpointReader, write_archive_checkpoint};
pub use remover::{ChunkDeleter, ChunkRemover, Disposal, NoopChunkRemover, RetainingChunkRemover};
