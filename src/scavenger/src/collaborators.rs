//! Contracts of the systems the scavenger works against.
//!
//! The physical chunk format, the stream index and the archive are owned
//! elsewhere; the scavenger only needs the narrow operations below.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::model::{LogRecord, ScavengePoint, StreamHandle};

/// Oldest index format that records enough to be scavenged safely
pub const MIN_INDEX_VERSION: u8 = 3;

/// A chunk file on disk, or a locator for one held in the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalChunk {
    pub name: String,
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub chunk_start_position: i64,
    /// Exclusive
    pub chunk_end_position: i64,
    pub file_size: u64,
    pub is_read_only: bool,
    pub is_remote: bool,
    /// Written by an older scavenger and never touched again
    pub is_raw: bool,
}

impl PhysicalChunk {
    pub fn logical_chunk_numbers(&self) -> std::ops::RangeInclusive<i32> {
        self.chunk_start_number..=self.chunk_end_number
    }
}

impl std::fmt::Display for PhysicalChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk {}-{}", self.chunk_start_number, self.chunk_end_number)
    }
}

/// Outcome of writing a replacement chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedChunk {
    pub file_name: String,
    pub file_size: u64,
}

/// Read and replace access to the chunked log.
#[async_trait]
pub trait ChunkManager: Send + Sync {
    /// Size in bytes of one logical chunk
    fn chunk_size(&self) -> i64;

    /// Records belonging to one logical chunk, in log order
    fn read_logical_chunk(&self, logical_chunk_number: i32) -> BoxStream<'_, Result<LogRecord>>;

    /// Every record held by a physical chunk, in log order
    fn read_physical_chunk(&self, chunk: &PhysicalChunk) -> BoxStream<'_, Result<LogRecord>>;

    /// Physical chunk holding the given logical chunk, if the log reaches that far
    async fn physical_chunk(&self, logical_chunk_number: i32) -> Result<Option<PhysicalChunk>>;

    /// Start writing a replacement for the given chunk
    async fn create_writer(&self, chunk: &PhysicalChunk) -> Result<Box<dyn ChunkWriter>>;

    /// Atomically replace the source chunk's file with the completed one
    async fn switch_in_chunk(&self, chunk: &PhysicalChunk, completed: &CompletedChunk)
    -> Result<()>;

    /// Combine consecutive chunks into one file that still answers for every
    /// logical chunk number of its sources
    async fn merge_chunks(&self, chunks: &[PhysicalChunk]) -> Result<CompletedChunk>;

    /// Replace a local chunk with a locator for its archived copy
    async fn switch_in_remote(&self, chunk: &PhysicalChunk) -> Result<()>;

    /// Delete a local chunk whose data lives in the archive
    async fn delete_local(&self, chunk: &PhysicalChunk) -> Result<()>;

    /// Stream id of the record at a position, if the record still exists
    async fn lookup_stream_id(&self, log_position: i64) -> Result<Option<String>>;
}

/// Writes the surviving records of a chunk being scavenged.
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write_record(&mut self, record: &LogRecord) -> Result<()>;

    async fn complete(self: Box<Self>) -> Result<CompletedChunk>;

    /// Throw away the partially written chunk
    async fn abort(self: Box<Self>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventInfo {
    pub log_position: i64,
    pub event_number: i64,
}

/// Event infos read from the index, bounded by a scavenge point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventInfoSlice {
    pub events: Vec<EventInfo>,
    pub next_event_number: i64,
    pub is_end_of_stream: bool,
}

/// Per-stream reads against the index.
///
/// Hash handles address every entry under the hash; id handles address the
/// entries of that stream only.
#[async_trait]
pub trait IndexReader: Send + Sync {
    /// Highest event number before the scavenge point
    async fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>>;

    async fn read_event_info_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<EventInfoSlice>;

    /// Newest first, starting at `from_event_number` (or the last event)
    async fn read_event_info_backward(
        &self,
        handle: &StreamHandle,
        from_event_number: Option<i64>,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: i64,
    pub log_position: i64,
}

/// Bulk access used to drop stale index entries.
#[async_trait]
pub trait IndexScavenger: Send + Sync {
    /// Format version of the on-disk index
    async fn version(&self) -> Result<u8>;

    /// Entries before the scavenge point, ordered by hash then event number
    fn entries(&self, scavenge_point: &ScavengePoint) -> BoxStream<'_, Result<IndexEntry>>;

    async fn remove_entries(&self, entries: &[IndexEntry]) -> Result<()>;
}

/// Source of the scavenge points that delimit runs.
#[async_trait]
pub trait ScavengePointSource: Send + Sync {
    async fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>>;

    /// Write a new scavenge point. Fails if `expected_event_number` no longer
    /// matches the last one written.
    async fn add_scavenge_point(
        &self,
        expected_event_number: Option<i64>,
        threshold: i32,
    ) -> Result<ScavengePoint>;
}

/// Highest log position durably stored in the archive.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArchiveCheckpointReader: Send + Sync {
    async fn archive_checkpoint(&self) -> Result<i64>;
}
