//! In-memory chunked log serving chunks, index and scavenge points.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{
    ChunkManager, ChunkWriter, CompletedChunk, EventInfo, EventInfoSlice, IndexEntry, IndexReader,
    IndexScavenger, MIN_INDEX_VERSION, PhysicalChunk, ScavengePointSource,
};
use crate::model::streams::{
    METADATA_EVENT_TYPE, SCAVENGE_POINT_EVENT_TYPE, SCAVENGE_POINTS_STREAM, metastream_of,
};
use crate::model::{
    CommitRecord, DELETED_STREAM_EVENT_NUMBER, LogRecord, PrepareFlags, PrepareRecord,
    ScavengePoint, ScavengePointPayload, StreamHandle, StreamHasher, StreamMetadata,
    UNCOMMITTED_EVENT_NUMBER, Xxh3StreamHasher,
};

pub const DEFAULT_CHUNK_SIZE: i64 = 1024;

const EVENT_TYPE: &str = "test-event";

/// What happened to a chunk the archive took over
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retirement {
    SwitchedToRemote(i32),
    DeletedLocal(i32),
}

#[derive(Clone, Debug)]
struct MemoryChunk {
    start: i32,
    end: i32,
    version: u32,
    records: Vec<LogRecord>,
    read_only: bool,
    remote: bool,
    raw: bool,
    /// Rewritten at least once, so the file holds just its records
    compacted: bool,
}

impl MemoryChunk {
    fn new(start: i32) -> Self {
        Self {
            start,
            end: start,
            version: 0,
            records: Vec::new(),
            read_only: false,
            remote: false,
            raw: false,
            compacted: false,
        }
    }

    fn name(&self) -> String {
        chunk_file_name(self.start, self.version)
    }

    fn contains(&self, logical_chunk_number: i32) -> bool {
        (self.start..=self.end).contains(&logical_chunk_number)
    }

    fn data_size(&self) -> u64 {
        self.records.iter().map(LogRecord::size).sum()
    }

    fn file_size(&self, chunk_size: i64) -> u64 {
        if self.compacted {
            self.data_size()
        } else {
            chunk_size as u64 * (self.end - self.start + 1) as u64
        }
    }

    fn to_physical(&self, chunk_size: i64) -> PhysicalChunk {
        PhysicalChunk {
            name: self.name(),
            chunk_start_number: self.start,
            chunk_end_number: self.end,
            chunk_start_position: i64::from(self.start) * chunk_size,
            chunk_end_position: i64::from(self.end + 1) * chunk_size,
            file_size: self.file_size(chunk_size),
            is_read_only: self.read_only,
            is_remote: self.remote,
            is_raw: self.raw,
        }
    }
}

fn chunk_file_name(start: i32, version: u32) -> String {
    format!("chunk-{start:06}.{version:06}")
}

struct LogInner {
    chunk_size: i64,
    hasher: Arc<dyn StreamHasher>,
    index_version: u8,
    now: DateTime<Utc>,
    chunks: Vec<MemoryChunk>,
    next_position: i64,
    next_event_numbers: HashMap<String, i64>,
    /// (hash, event number, position) to stream id
    index: BTreeMap<(u64, i64, i64), String>,
    scavenge_points: Vec<ScavengePoint>,
    pending: HashMap<String, Vec<LogRecord>>,
    retirements: Vec<Retirement>,
    fail_switching: bool,
}

impl LogInner {
    fn logical_chunk_number(&self, position: i64) -> i32 {
        (position / self.chunk_size) as i32
    }

    fn chunk(&self, logical_chunk_number: i32) -> Option<&MemoryChunk> {
        self.chunks
            .iter()
            .find(|chunk| chunk.contains(logical_chunk_number))
    }

    fn chunk_mut(&mut self, start: i32) -> Result<&mut MemoryChunk> {
        self.chunks
            .iter_mut()
            .find(|chunk| chunk.start == start)
            .ok_or_else(|| anyhow!("No chunk starts at logical chunk {start}"))
    }

    fn has_open_chunk(&self) -> bool {
        self.chunks.last().is_some_and(|chunk| !chunk.read_only)
    }

    fn complete_chunk(&mut self) {
        let chunk_size = self.chunk_size;
        if let Some(chunk) = self.chunks.last_mut().filter(|chunk| !chunk.read_only) {
            chunk.read_only = true;
            self.next_position = i64::from(chunk.end + 1) * chunk_size;
        }
    }

    /// Position for a record of `size` bytes, starting a new chunk if needed
    fn place(&mut self, size: u64) -> i64 {
        let chunk_size = self.chunk_size;
        let next_position = self.next_position;
        let full = self
            .chunks
            .last()
            .filter(|open| !open.read_only)
            .is_some_and(|open| {
                !open.records.is_empty()
                    && next_position + size as i64 > i64::from(open.end + 1) * chunk_size
            });
        if full {
            self.complete_chunk();
        }
        if !self.has_open_chunk() {
            let start = self.logical_chunk_number(self.next_position);
            self.chunks.push(MemoryChunk::new(start));
        }
        let position = self.next_position;
        self.next_position += size as i64;
        position
    }

    fn push(&mut self, mut record: LogRecord) -> i64 {
        let position = self.place(record.size());
        match &mut record {
            LogRecord::Prepare(prepare) => {
                prepare.log_position = position;
                if prepare.transaction_position < 0 {
                    prepare.transaction_position = position;
                }
            }
            LogRecord::Commit(commit) => commit.log_position = position,
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.records.push(record);
        }
        position
    }

    fn next_event_number(&mut self, stream_id: &str) -> i64 {
        let next = self
            .next_event_numbers
            .entry(stream_id.to_string())
            .or_insert(0);
        let event_number = *next;
        *next += 1;
        event_number
    }

    fn index(&mut self, stream_id: &str, event_number: i64, position: i64) {
        let hash = self.hasher.hash(stream_id);
        self.index
            .insert((hash, event_number, position), stream_id.to_string());
    }

    fn prepare(
        &self,
        stream_id: &str,
        event_type: &str,
        event_number: i64,
        flags: PrepareFlags,
        timestamp: DateTime<Utc>,
        data: Vec<u8>,
    ) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            log_position: 0,
            transaction_position: -1,
            stream_id: stream_id.to_string(),
            event_number,
            event_type: event_type.to_string(),
            timestamp,
            flags,
            data,
        })
    }

    /// Self committed write, indexed straight away
    fn write(
        &mut self,
        stream_id: &str,
        event_type: &str,
        event_number: i64,
        flags: PrepareFlags,
        timestamp: DateTime<Utc>,
        data: Vec<u8>,
    ) -> i64 {
        let record = self.prepare(stream_id, event_type, event_number, flags, timestamp, data);
        let position = self.push(record);
        self.index(stream_id, event_number, position);
        position
    }

    /// Explicit transaction of prepares followed by its commit
    fn write_transaction(
        &mut self,
        stream_id: &str,
        event_type: &str,
        payloads: Vec<Vec<u8>>,
        tombstone: bool,
    ) -> Vec<i64> {
        let count = payloads.len();
        let timestamp = self.now;
        let mut transaction_position = -1;
        let mut positions = Vec::with_capacity(count);

        for (i, data) in payloads.into_iter().enumerate() {
            let flags = PrepareFlags {
                self_committed: false,
                transaction_begin: i == 0,
                transaction_end: i + 1 == count,
                tombstone: tombstone && i + 1 == count,
            };
            let mut record = self.prepare(
                stream_id,
                event_type,
                UNCOMMITTED_EVENT_NUMBER,
                flags,
                timestamp,
                data,
            );
            if let LogRecord::Prepare(prepare) = &mut record {
                prepare.transaction_position = transaction_position;
            }
            let position = self.push(record);
            if i == 0 {
                transaction_position = position;
            }
            positions.push(position);
        }

        let first_event_number = if tombstone {
            DELETED_STREAM_EVENT_NUMBER
        } else {
            let first = self.next_event_number(stream_id);
            for _ in 1..count {
                self.next_event_number(stream_id);
            }
            first
        };
        for (i, position) in positions.iter().enumerate() {
            let event_number = if tombstone {
                DELETED_STREAM_EVENT_NUMBER
            } else {
                first_event_number + i as i64
            };
            if !tombstone || i + 1 == count {
                self.index(stream_id, event_number, *position);
            }
        }

        self.push(LogRecord::Commit(CommitRecord {
            log_position: 0,
            transaction_position,
            first_event_number,
            timestamp,
        }));
        positions
    }

    fn write_scavenge_point(&mut self, threshold: i32) -> ScavengePoint {
        let event_number = self.next_event_number(SCAVENGE_POINTS_STREAM);
        let payload = ScavengePointPayload {
            effective_now: self.now,
            threshold,
        };
        let data = serde_json::to_vec(&payload).unwrap_or_default();
        let now = self.now;
        let position = self.write(
            SCAVENGE_POINTS_STREAM,
            SCAVENGE_POINT_EVENT_TYPE,
            event_number,
            PrepareFlags::self_committed(),
            now,
            data,
        );
        self.complete_chunk();

        let scavenge_point = ScavengePoint::new(position, event_number, now, threshold);
        self.scavenge_points.push(scavenge_point.clone());
        scavenge_point
    }

    /// Index entries of a handle before the scavenge point, by event number
    fn event_infos(&self, handle: &StreamHandle, scavenge_point: &ScavengePoint) -> Vec<EventInfo> {
        let (hash, stream_id) = match handle {
            StreamHandle::Hash(hash) => (*hash, None),
            StreamHandle::Id(id) => (self.hasher.hash(id), Some(id.as_str())),
            StreamHandle::None => return Vec::new(),
        };
        self.index
            .range((hash, i64::MIN, i64::MIN)..=(hash, i64::MAX, i64::MAX))
            .filter(|((_, _, position), stream)| {
                *position < scavenge_point.position
                    && stream_id.is_none_or(|id| id == stream.as_str())
            })
            .map(|((_, event_number, position), _)| EventInfo {
                log_position: *position,
                event_number: *event_number,
            })
            .collect()
    }

    fn prepares(&self) -> impl Iterator<Item = &PrepareRecord> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.records.iter())
            .filter_map(LogRecord::as_prepare)
    }
}

/// A complete log held in memory.
///
/// Clones share the same log, so a test keeps a handle for writing and
/// inspecting while the scavenger works through another.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<LogInner>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let now = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                chunk_size: DEFAULT_CHUNK_SIZE,
                hasher: Arc::new(Xxh3StreamHasher),
                index_version: MIN_INDEX_VERSION,
                now,
                chunks: Vec::new(),
                next_position: 0,
                next_event_numbers: HashMap::new(),
                index: BTreeMap::new(),
                scavenge_points: Vec::new(),
                pending: HashMap::new(),
                retirements: Vec::new(),
                fail_switching: false,
            })),
        }
    }

    pub fn with_chunk_size(self, chunk_size: i64) -> Self {
        self.inner.lock().chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_hasher(self, hasher: Arc<dyn StreamHasher>) -> Self {
        self.inner.lock().hasher = hasher;
        self
    }

    pub fn with_index_version(self, version: u8) -> Self {
        self.inner.lock().index_version = version;
        self
    }

    pub fn hasher(&self) -> Arc<dyn StreamHasher> {
        self.inner.lock().hasher.clone()
    }

    // Clock

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    pub fn advance_clock(&self, by: Duration) {
        let mut inner = self.inner.lock();
        if let Some(now) = ChronoDuration::from_std(by)
            .ok()
            .and_then(|by| inner.now.checked_add_signed(by))
        {
            inner.now = now;
        }
    }

    // Writing

    /// Append an event stamped with the log's clock. Returns its position.
    pub fn write_event(&self, stream_id: &str) -> i64 {
        let now = self.now();
        self.write_event_at(stream_id, now)
    }

    pub fn write_events(&self, stream_id: &str, count: usize) -> Vec<i64> {
        (0..count).map(|_| self.write_event(stream_id)).collect()
    }

    /// Append an event that is already `age` old
    pub fn write_event_aged(&self, stream_id: &str, age: Duration) -> i64 {
        let now = self.now();
        let timestamp = ChronoDuration::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(now);
        self.write_event_at(stream_id, timestamp)
    }

    pub fn write_event_at(&self, stream_id: &str, timestamp: DateTime<Utc>) -> i64 {
        let mut inner = self.inner.lock();
        let event_number = inner.next_event_number(stream_id);
        inner.write(
            stream_id,
            EVENT_TYPE,
            event_number,
            PrepareFlags::self_committed(),
            timestamp,
            b"data".to_vec(),
        )
    }

    /// Append metadata for a stream to its metastream
    pub fn write_metadata(&self, stream_id: &str, metadata: &StreamMetadata) -> i64 {
        let metastream_id = metastream_of(stream_id);
        let mut inner = self.inner.lock();
        let event_number = inner.next_event_number(&metastream_id);
        let timestamp = inner.now;
        inner.write(
            &metastream_id,
            METADATA_EVENT_TYPE,
            event_number,
            PrepareFlags::self_committed(),
            timestamp,
            metadata.to_bytes(),
        )
    }

    /// Append metadata carrying an explicit event number, possibly out of order
    pub fn write_metadata_numbered(
        &self,
        stream_id: &str,
        event_number: i64,
        metadata: &StreamMetadata,
    ) -> i64 {
        let metastream_id = metastream_of(stream_id);
        let mut inner = self.inner.lock();
        let timestamp = inner.now;
        inner.write(
            &metastream_id,
            METADATA_EVENT_TYPE,
            event_number,
            PrepareFlags::self_committed(),
            timestamp,
            metadata.to_bytes(),
        )
    }

    pub fn write_tombstone(&self, stream_id: &str) -> i64 {
        let mut inner = self.inner.lock();
        let timestamp = inner.now;
        inner.write(
            stream_id,
            "$streamDeleted",
            DELETED_STREAM_EVENT_NUMBER,
            PrepareFlags::tombstone(),
            timestamp,
            Vec::new(),
        )
    }

    /// Append `count` events in one explicit transaction. Returns the
    /// positions of its prepares.
    pub fn write_transaction(&self, stream_id: &str, count: usize) -> Vec<i64> {
        let payloads = vec![b"data".to_vec(); count.max(1)];
        self.inner
            .lock()
            .write_transaction(stream_id, EVENT_TYPE, payloads, false)
    }

    pub fn write_metadata_in_transaction(&self, stream_id: &str, metadata: &StreamMetadata) -> i64 {
        let metastream_id = metastream_of(stream_id);
        let positions = self.inner.lock().write_transaction(
            &metastream_id,
            METADATA_EVENT_TYPE,
            vec![metadata.to_bytes()],
            false,
        );
        positions.first().copied().unwrap_or_default()
    }

    pub fn write_tombstone_in_transaction(&self, stream_id: &str) -> i64 {
        let positions = self.inner.lock().write_transaction(
            stream_id,
            "$streamDeleted",
            vec![Vec::new()],
            true,
        );
        positions.first().copied().unwrap_or_default()
    }

    /// Make the open chunk read-only; the next write starts a new chunk
    pub fn complete_chunk(&self) {
        self.inner.lock().complete_chunk();
    }

    /// Write a scavenge point without going through the scavenger
    pub fn write_scavenge_point(&self, threshold: i32) -> ScavengePoint {
        self.inner.lock().write_scavenge_point(threshold)
    }

    pub fn mark_raw(&self, logical_chunk_number: i32) {
        let mut inner = self.inner.lock();
        if let Some(chunk) = inner
            .chunks
            .iter_mut()
            .find(|chunk| chunk.contains(logical_chunk_number))
        {
            chunk.raw = true;
        }
    }

    /// Drop every record of the chunk holding a logical chunk number but leave
    /// the index alone, like a scavenge that kept no state behind
    pub fn empty_chunk(&self, logical_chunk_number: i32) {
        let mut inner = self.inner.lock();
        if let Some(chunk) = inner
            .chunks
            .iter_mut()
            .find(|chunk| chunk.contains(logical_chunk_number))
        {
            chunk.records.clear();
            chunk.version += 1;
            chunk.compacted = true;
        }
    }

    /// Every later switch-in fails
    pub fn fail_switching(&self) {
        self.inner.lock().fail_switching = true;
    }

    // Inspection

    /// Event numbers of the stream's records still in the log, in log order.
    /// Records of a transaction show as uncommitted.
    pub fn event_numbers(&self, stream_id: &str) -> Vec<i64> {
        self.inner
            .lock()
            .prepares()
            .filter(|prepare| prepare.stream_id == stream_id)
            .map(|prepare| prepare.event_number)
            .collect()
    }

    pub fn records(&self, stream_id: &str) -> Vec<PrepareRecord> {
        self.inner
            .lock()
            .prepares()
            .filter(|prepare| prepare.stream_id == stream_id)
            .cloned()
            .collect()
    }

    /// Event numbers the index still holds for the stream
    pub fn index_event_numbers(&self, stream_id: &str) -> Vec<i64> {
        self.inner
            .lock()
            .index
            .iter()
            .filter(|(_, stream)| stream.as_str() == stream_id)
            .map(|((_, event_number, _), _)| *event_number)
            .collect()
    }

    pub fn physical_chunks(&self) -> Vec<PhysicalChunk> {
        let inner = self.inner.lock();
        inner
            .chunks
            .iter()
            .map(|chunk| chunk.to_physical(inner.chunk_size))
            .collect()
    }

    pub fn retirements(&self) -> Vec<Retirement> {
        self.inner.lock().retirements.clone()
    }

    pub fn scavenge_points(&self) -> Vec<ScavengePoint> {
        self.inner.lock().scavenge_points.clone()
    }

    /// Position the next record will be written at
    pub fn log_position(&self) -> i64 {
        self.inner.lock().next_position
    }
}

#[async_trait]
impl ChunkManager for MemoryLog {
    fn chunk_size(&self) -> i64 {
        self.inner.lock().chunk_size
    }

    fn read_logical_chunk(&self, logical_chunk_number: i32) -> BoxStream<'_, Result<LogRecord>> {
        let inner = self.inner.lock();
        let start = i64::from(logical_chunk_number) * inner.chunk_size;
        let end = start + inner.chunk_size;
        let records: Vec<LogRecord> = inner
            .chunk(logical_chunk_number)
            .map(|chunk| {
                chunk
                    .records
                    .iter()
                    .filter(|record| (start..end).contains(&record.log_position()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        stream::iter(records.into_iter().map(Ok)).boxed()
    }

    fn read_physical_chunk(&self, chunk: &PhysicalChunk) -> BoxStream<'_, Result<LogRecord>> {
        let records: Vec<LogRecord> = self
            .inner
            .lock()
            .chunks
            .iter()
            .find(|memory_chunk| memory_chunk.start == chunk.chunk_start_number)
            .map(|memory_chunk| memory_chunk.records.clone())
            .unwrap_or_default();
        stream::iter(records.into_iter().map(Ok)).boxed()
    }

    async fn physical_chunk(&self, logical_chunk_number: i32) -> Result<Option<PhysicalChunk>> {
        let inner = self.inner.lock();
        Ok(inner
            .chunk(logical_chunk_number)
            .map(|chunk| chunk.to_physical(inner.chunk_size)))
    }

    async fn create_writer(&self, chunk: &PhysicalChunk) -> Result<Box<dyn ChunkWriter>> {
        let version = self.inner.lock().chunk_mut(chunk.chunk_start_number)?.version;
        Ok(Box::new(MemoryChunkWriter {
            inner: self.inner.clone(),
            file_name: chunk_file_name(chunk.chunk_start_number, version + 1),
            records: Vec::new(),
        }))
    }

    async fn switch_in_chunk(&self, chunk: &PhysicalChunk, completed: &CompletedChunk) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_switching {
            bail!("Failed to switch in {}: disk is read-only", completed.file_name);
        }
        let records = inner
            .pending
            .remove(&completed.file_name)
            .ok_or_else(|| anyhow!("No completed chunk named {}", completed.file_name))?;
        let target = inner.chunk_mut(chunk.chunk_start_number)?;
        target.records = records;
        target.version += 1;
        target.compacted = true;
        Ok(())
    }

    async fn merge_chunks(&self, chunks: &[PhysicalChunk]) -> Result<CompletedChunk> {
        let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
            bail!("Nothing to merge");
        };
        let mut inner = self.inner.lock();
        if inner.fail_switching {
            bail!("Failed to merge chunks: disk is read-only");
        }

        let sources: Vec<MemoryChunk> = inner
            .chunks
            .iter()
            .filter(|chunk| chunk.start >= first.chunk_start_number && chunk.end <= last.chunk_end_number)
            .cloned()
            .collect();
        let Some(insert_at) = inner
            .chunks
            .iter()
            .position(|chunk| chunk.start == first.chunk_start_number)
        else {
            bail!("No chunk starts at logical chunk {}", first.chunk_start_number);
        };
        inner
            .chunks
            .retain(|chunk| chunk.start < first.chunk_start_number || chunk.end > last.chunk_end_number);

        let merged = MemoryChunk {
            start: first.chunk_start_number,
            end: last.chunk_end_number,
            version: sources.iter().map(|chunk| chunk.version).max().unwrap_or(0) + 1,
            records: sources
                .iter()
                .flat_map(|chunk| chunk.records.iter().cloned())
                .collect(),
            read_only: true,
            remote: false,
            raw: false,
            compacted: true,
        };
        let completed = CompletedChunk {
            file_name: merged.name(),
            file_size: merged.data_size(),
        };
        inner.chunks.insert(insert_at, merged);
        Ok(completed)
    }

    async fn switch_in_remote(&self, chunk: &PhysicalChunk) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.chunk_mut(chunk.chunk_start_number)?.remote = true;
        inner
            .retirements
            .push(Retirement::SwitchedToRemote(chunk.chunk_start_number));
        Ok(())
    }

    async fn delete_local(&self, chunk: &PhysicalChunk) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.chunk_mut(chunk.chunk_start_number)?.remote = true;
        inner
            .retirements
            .push(Retirement::DeletedLocal(chunk.chunk_start_number));
        Ok(())
    }

    async fn lookup_stream_id(&self, log_position: i64) -> Result<Option<String>> {
        let inner = self.inner.lock();
        let logical_chunk_number = inner.logical_chunk_number(log_position);
        Ok(inner.chunk(logical_chunk_number).and_then(|chunk| {
            chunk
                .records
                .iter()
                .filter_map(LogRecord::as_prepare)
                .find(|prepare| prepare.log_position == log_position)
                .map(|prepare| prepare.stream_id.clone())
        }))
    }
}

struct MemoryChunkWriter {
    inner: Arc<Mutex<LogInner>>,
    file_name: String,
    records: Vec<LogRecord>,
}

#[async_trait]
impl ChunkWriter for MemoryChunkWriter {
    async fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    async fn complete(self: Box<Self>) -> Result<CompletedChunk> {
        let file_size: u64 = self.records.iter().map(LogRecord::size).sum();
        let MemoryChunkWriter {
            inner,
            file_name,
            records,
        } = *self;
        inner.lock().pending.insert(file_name.clone(), records);
        Ok(CompletedChunk {
            file_name,
            file_size,
        })
    }

    async fn abort(self: Box<Self>) {}
}

#[async_trait]
impl IndexReader for MemoryLog {
    async fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .event_infos(handle, scavenge_point)
            .iter()
            .map(|info| info.event_number)
            .max())
    }

    async fn read_event_info_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<EventInfoSlice> {
        let infos: Vec<EventInfo> = self
            .inner
            .lock()
            .event_infos(handle, scavenge_point)
            .into_iter()
            .filter(|info| info.event_number >= from_event_number)
            .collect();
        let is_end_of_stream = infos.len() <= max_count;
        let events: Vec<EventInfo> = infos.into_iter().take(max_count).collect();
        let next_event_number = events
            .last()
            .map(|info| info.event_number.saturating_add(1))
            .unwrap_or(from_event_number);
        Ok(EventInfoSlice {
            events,
            next_event_number,
            is_end_of_stream,
        })
    }

    async fn read_event_info_backward(
        &self,
        handle: &StreamHandle,
        from_event_number: Option<i64>,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>> {
        Ok(self
            .inner
            .lock()
            .event_infos(handle, scavenge_point)
            .into_iter()
            .rev()
            .filter(|info| from_event_number.is_none_or(|from| info.event_number <= from))
            .take(max_count)
            .collect())
    }
}

#[async_trait]
impl IndexScavenger for MemoryLog {
    async fn version(&self) -> Result<u8> {
        Ok(self.inner.lock().index_version)
    }

    fn entries(&self, scavenge_point: &ScavengePoint) -> BoxStream<'_, Result<IndexEntry>> {
        let entries: Vec<IndexEntry> = self
            .inner
            .lock()
            .index
            .keys()
            .filter(|(_, _, position)| *position < scavenge_point.position)
            .map(|(stream_hash, event_number, log_position)| IndexEntry {
                stream_hash: *stream_hash,
                event_number: *event_number,
                log_position: *log_position,
            })
            .collect();
        stream::iter(entries.into_iter().map(Ok)).boxed()
    }

    async fn remove_entries(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner
                .index
                .remove(&(entry.stream_hash, entry.event_number, entry.log_position));
        }
        Ok(())
    }
}

#[async_trait]
impl ScavengePointSource for MemoryLog {
    async fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>> {
        Ok(self.inner.lock().scavenge_points.last().cloned())
    }

    async fn add_scavenge_point(
        &self,
        expected_event_number: Option<i64>,
        threshold: i32,
    ) -> Result<ScavengePoint> {
        let mut inner = self.inner.lock();
        let latest = inner
            .scavenge_points
            .last()
            .map(|scavenge_point| scavenge_point.event_number);
        if latest != expected_event_number {
            bail!(
                "Expected the latest scavenge point to be {expected_event_number:?} but it is {latest:?}"
            );
        }
        Ok(inner.write_scavenge_point(threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_records_roll_into_new_chunks() {
        // each record takes 66 bytes
        let log = MemoryLog::new().with_chunk_size(150);
        let first = log.write_event("ab-1");
        let second = log.write_event("ab-1");
        let third = log.write_event("ab-1");

        assert_eq!(first, 0);
        assert_eq!(second, 66);
        assert_eq!(third, 150);

        let chunks = log.physical_chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_read_only);
        assert!(!chunks[1].is_read_only);
        assert_eq!(chunks[1].chunk_start_position, 150);
    }

    #[tokio::test]
    async fn test_scavenge_point_completes_its_chunk() {
        let log = MemoryLog::new();
        log.write_event("ab-1");
        let sp = log.add_scavenge_point(None, 0).await.unwrap();
        assert_eq!(sp.event_number, 0);
        assert_eq!(log.log_position(), DEFAULT_CHUNK_SIZE);
        assert!(log.physical_chunks()[0].is_read_only);

        let err = log.add_scavenge_point(None, 0).await.unwrap_err();
        assert!(err.to_string().contains("Expected the latest scavenge point"));
        let sp = log.add_scavenge_point(Some(0), 0).await.unwrap();
        assert_eq!(sp.name(), "SP-1");
    }

    #[tokio::test]
    async fn test_index_reads_are_bounded_by_the_scavenge_point() {
        let log = MemoryLog::new();
        log.write_events("ab-1", 3);
        let sp = log.write_scavenge_point(0);
        log.write_event("ab-1");

        let handle = StreamHandle::Id("ab-1".into());
        assert_eq!(log.last_event_number(&handle, &sp).await.unwrap(), Some(2));

        let slice = log
            .read_event_info_forward(&handle, 1, 1, &sp)
            .await
            .unwrap();
        assert_eq!(slice.events.len(), 1);
        assert_eq!(slice.events[0].event_number, 1);
        assert_eq!(slice.next_event_number, 2);
        assert!(!slice.is_end_of_stream);

        let backward = log
            .read_event_info_backward(&handle, None, 2, &sp)
            .await
            .unwrap();
        let numbers: Vec<i64> = backward.iter().map(|info| info.event_number).collect();
        assert_eq!(numbers, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_transaction_is_indexed_on_commit() {
        let log = MemoryLog::new();
        log.write_event("ab-1");
        log.write_transaction("ab-1", 2);

        assert_eq!(log.event_numbers("ab-1"), vec![0, -1, -1]);
        assert_eq!(log.index_event_numbers("ab-1"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_rewrite_and_merge() {
        let log = MemoryLog::new().with_chunk_size(200);
        log.write_events("ab-1", 2);
        log.complete_chunk();
        log.write_events("ab-1", 2);
        log.complete_chunk();

        let chunks = log.physical_chunks();
        let mut writer = log.create_writer(&chunks[0]).await.unwrap();
        let records: Vec<LogRecord> = log
            .read_physical_chunk(&chunks[0])
            .try_collect()
            .await
            .unwrap();
        writer.write_record(&records[1]).await.unwrap();
        let completed = writer.complete().await.unwrap();
        log.switch_in_chunk(&chunks[0], &completed).await.unwrap();
        assert_eq!(log.event_numbers("ab-1"), vec![1, 2, 3]);

        let chunks = log.physical_chunks();
        let merged = log.merge_chunks(&chunks).await.unwrap();
        let chunks = log.physical_chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].logical_chunk_numbers(), 0..=1);
        assert_eq!(chunks[0].file_size, merged.file_size);
        assert_eq!(
            log.lookup_stream_id(records[1].log_position()).await.unwrap(),
            Some("ab-1".to_string())
        );
    }
}
