//! Persistent state shared by the scavenge stages.
//!
//! Every stage reads what the previous one wrote through [`ScavengeState`].
//! Writes happen inside transactions that commit together with the stage's
//! checkpoint, so a run can resume from any committed unit of work.

pub mod collision_map;
pub mod collisions;
pub mod data;
pub mod kv;
pub mod lru_map;
pub mod map;
pub mod sqlite;
pub mod transaction;

use std::sync::Arc;

use crate::error::Result;
use crate::model::{
    DiscardPoint, ScavengeCheckpoint, StreamHandle, StreamHasher, StreamMetadata, streams,
};
use crate::tracer::Tracer;

use collision_map::CollisionMap;
use collisions::{CollisionDetector, CollisionResult};
use data::{
    CalculationStatus, ChunkExecutionInfo, ChunkTimeStampRange, IndexExecutionInfo,
    MetastreamData, OriginalStreamData,
};
use kv::KvStore;
use map::ScavengeMap;
use transaction::TransactionManager;

pub use kv::MemoryKvStore;
pub use sqlite::SqliteKvStore;

/// Table names of the named maps
pub mod tables {
    pub const HASH_USERS: &str = "hash_users";
    pub const COLLISIONS: &str = "collisions";
    pub const METASTREAMS_BY_HASH: &str = "metastreams_by_hash";
    pub const METASTREAMS_BY_ID: &str = "metastreams_by_id";
    pub const ORIGINAL_STREAMS_BY_HASH: &str = "original_streams_by_hash";
    pub const ORIGINAL_STREAMS_BY_ID: &str = "original_streams_by_id";
    pub const CHUNK_TIMESTAMP_RANGES: &str = "chunk_timestamp_ranges";
    pub const CHUNK_WEIGHTS: &str = "chunk_weights";
    pub const CHECKPOINT: &str = "checkpoint";
}

pub struct ScavengeState {
    detector: CollisionDetector,
    metastreams: CollisionMap<MetastreamData>,
    original_streams: CollisionMap<OriginalStreamData>,
    chunk_timestamp_ranges: ScavengeMap<i32, ChunkTimeStampRange>,
    chunk_weights: ScavengeMap<i32, f32>,
    transactions: TransactionManager,
    tracer: Arc<dyn Tracer>,
}

impl ScavengeState {
    pub fn new(
        store: Arc<dyn KvStore>,
        hasher: Arc<dyn StreamHasher>,
        hash_users_cache_capacity: usize,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let detector = CollisionDetector::new(
            hasher,
            ScavengeMap::new(store.clone(), tables::HASH_USERS),
            ScavengeMap::new(store.clone(), tables::COLLISIONS),
            hash_users_cache_capacity,
        );

        Self {
            detector,
            metastreams: CollisionMap::new(
                ScavengeMap::new(store.clone(), tables::METASTREAMS_BY_HASH),
                ScavengeMap::new(store.clone(), tables::METASTREAMS_BY_ID),
            ),
            original_streams: CollisionMap::new(
                ScavengeMap::new(store.clone(), tables::ORIGINAL_STREAMS_BY_HASH),
                ScavengeMap::new(store.clone(), tables::ORIGINAL_STREAMS_BY_ID),
            ),
            chunk_timestamp_ranges: ScavengeMap::new(
                store.clone(),
                tables::CHUNK_TIMESTAMP_RANGES,
            ),
            chunk_weights: ScavengeMap::new(store.clone(), tables::CHUNK_WEIGHTS),
            transactions: TransactionManager::new(
                store.clone(),
                ScavengeMap::new(store, tables::CHECKPOINT),
                tracer.clone(),
            ),
            tracer,
        }
    }

    /// Load what must be held in memory for the run
    pub async fn init(&self) -> Result<()> {
        self.detector.load().await?;
        Ok(())
    }

    pub fn tracer(&self) -> &dyn Tracer {
        self.tracer.as_ref()
    }

    // Transactions and checkpoints

    pub async fn begin(&self) -> Result<()> {
        self.transactions.begin().await
    }

    pub async fn commit(&self, checkpoint: &ScavengeCheckpoint) -> Result<()> {
        self.transactions.commit(checkpoint).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.transactions.rollback().await?;
        self.detector.on_rollback().await?;
        Ok(())
    }

    /// Roll back if a transaction is open; used on the error path
    pub async fn rollback_if_open(&self) -> Result<()> {
        if self.transactions.is_open() {
            self.rollback().await?;
        }
        Ok(())
    }

    pub async fn set_checkpoint(&self, checkpoint: &ScavengeCheckpoint) -> Result<()> {
        self.begin().await?;
        self.commit(checkpoint).await
    }

    pub async fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>> {
        self.transactions.checkpoint().await
    }

    // Collisions

    pub async fn detect_collisions(&self, stream_id: &str) -> Result<CollisionResult> {
        let result = self.detector.detect_collisions(stream_id).await?;
        if let CollisionResult::NewCollision(other) = &result {
            let hash = self.detector.hash(stream_id);
            tracing::info!(
                stream_id = %stream_id,
                colliding_with = %other,
                hash,
                "Found hash collision"
            );
            self.metastreams.notify_collision(other, hash).await?;
            self.original_streams.notify_collision(other, hash).await?;
        }
        Ok(result)
    }

    pub fn collisions(&self) -> Vec<String> {
        self.detector.collisions()
    }

    pub fn stream_handle(&self, stream_id: &str) -> StreamHandle {
        if self.detector.is_collision(stream_id) {
            StreamHandle::Id(stream_id.to_string())
        } else {
            StreamHandle::Hash(self.detector.hash(stream_id))
        }
    }

    pub fn is_colliding_hash(&self, hash: u64) -> bool {
        self.detector.is_colliding_hash(hash)
    }

    // Accumulation

    pub async fn set_original_stream_metadata(
        &self,
        stream_id: &str,
        metadata: &StreamMetadata,
    ) -> Result<()> {
        let handle = self.stream_handle(stream_id);
        let mut data = self
            .original_streams
            .get(&handle)
            .await?
            .unwrap_or_default();
        data.apply_metadata(metadata);
        self.original_streams.set(&handle, &data).await?;
        Ok(())
    }

    pub async fn set_original_stream_tombstone(&self, stream_id: &str) -> Result<()> {
        let handle = self.stream_handle(stream_id);
        let mut data = self
            .original_streams
            .get(&handle)
            .await?
            .unwrap_or_default();
        data.is_tombstoned = true;
        data.status = CalculationStatus::Active;
        self.original_streams.set(&handle, &data).await?;
        Ok(())
    }

    pub async fn metastream_data(&self, metastream_id: &str) -> Result<Option<MetastreamData>> {
        Ok(self
            .metastreams
            .get(&self.stream_handle(metastream_id))
            .await?)
    }

    pub async fn set_metastream_discard_point(
        &self,
        metastream_id: &str,
        discard_point: DiscardPoint,
    ) -> Result<()> {
        let handle = self.stream_handle(metastream_id);
        let mut data = self.metastreams.get(&handle).await?.unwrap_or_default();
        data.discard_point = data.discard_point.or(discard_point);
        self.metastreams.set(&handle, &data).await?;
        Ok(())
    }

    pub async fn set_metastream_tombstone(&self, metastream_id: &str) -> Result<()> {
        let handle = self.stream_handle(metastream_id);
        let mut data = self.metastreams.get(&handle).await?.unwrap_or_default();
        data.is_tombstoned = true;
        self.metastreams.set(&handle, &data).await?;
        Ok(())
    }

    pub async fn set_chunk_timestamp_range(
        &self,
        logical_chunk_number: i32,
        range: ChunkTimeStampRange,
    ) -> Result<()> {
        self.chunk_timestamp_ranges
            .set(&logical_chunk_number, &range)
            .await?;
        Ok(())
    }

    pub async fn chunk_timestamp_range(
        &self,
        logical_chunk_number: i32,
    ) -> Result<Option<ChunkTimeStampRange>> {
        Ok(self
            .chunk_timestamp_ranges
            .get(&logical_chunk_number)
            .await?)
    }

    // Chunk weights

    pub async fn increase_chunk_weight(&self, logical_chunk_number: i32, by: f32) -> Result<()> {
        if by <= 0.0 {
            return Ok(());
        }
        let current = self
            .chunk_weights
            .get(&logical_chunk_number)
            .await?
            .unwrap_or(0.0);
        self.chunk_weights
            .set(&logical_chunk_number, &(current + by))
            .await?;
        Ok(())
    }

    async fn chunk_weights_in(&self, start: i32, end: i32) -> Result<Vec<(i32, f32)>> {
        let after = start.checked_sub(1).filter(|n| *n >= 0);
        let count = usize::try_from(end - start + 1).unwrap_or(0);
        let weights = self.chunk_weights.range_after(after.as_ref(), count).await?;
        Ok(weights
            .into_iter()
            .filter(|(chunk, _)| *chunk >= start && *chunk <= end)
            .collect())
    }

    pub async fn sum_chunk_weights(&self, start: i32, end: i32) -> Result<f32> {
        Ok(self
            .chunk_weights_in(start, end)
            .await?
            .into_iter()
            .map(|(_, weight)| weight)
            .sum())
    }

    pub async fn reset_chunk_weights(&self, start: i32, end: i32) -> Result<()> {
        for (chunk, _) in self.chunk_weights_in(start, end).await? {
            self.chunk_weights.remove(&chunk).await?;
        }
        Ok(())
    }

    /// No chunk is still waiting to be rewritten
    pub async fn all_chunks_executed(&self) -> Result<bool> {
        Ok(self.chunk_weights.range_after(None, 1).await?.is_empty())
    }

    // Calculation

    pub async fn original_streams_after(
        &self,
        checkpoint: &StreamHandle,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, OriginalStreamData)>> {
        Ok(self
            .original_streams
            .enumerate_after(checkpoint, limit)
            .await?)
    }

    pub async fn original_stream_data(
        &self,
        handle: &StreamHandle,
    ) -> Result<Option<OriginalStreamData>> {
        Ok(self.original_streams.get(handle).await?)
    }

    pub async fn set_original_stream_discard_points(
        &self,
        handle: &StreamHandle,
        status: CalculationStatus,
        discard_point: DiscardPoint,
        maybe_discard_point: DiscardPoint,
    ) -> Result<()> {
        self.tracer.trace(&format!(
            "SetDiscardPoints({}, {status}, {discard_point}, {maybe_discard_point})",
            handle_label(handle)
        ));
        let mut data = self
            .original_streams
            .get(handle)
            .await?
            .unwrap_or_default();
        data.status = status;
        data.discard_point = discard_point;
        data.maybe_discard_point = maybe_discard_point;
        self.original_streams.set(handle, &data).await?;
        Ok(())
    }

    // Execution

    pub async fn chunk_execution_info(&self, stream_id: &str) -> Result<Option<ChunkExecutionInfo>> {
        let handle = self.stream_handle(stream_id);
        let original = self.original_streams.get(&handle).await?;

        if !streams::is_metastream(stream_id) {
            return Ok(original.map(|data| ChunkExecutionInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
                maybe_discard_point: data.maybe_discard_point,
                max_age: data.max_age,
            }));
        }

        // a metastream may also carry its own policy when meta-of-meta is honoured
        let meta = self.metastreams.get(&handle).await?;
        if meta.is_none() && original.is_none() {
            return Ok(None);
        }
        let meta = meta.unwrap_or_default();
        let original = original.unwrap_or_default();
        let discard_point = meta.discard_point.or(original.discard_point);
        Ok(Some(ChunkExecutionInfo {
            is_tombstoned: meta.is_tombstoned,
            discard_point,
            maybe_discard_point: original.maybe_discard_point.or(discard_point),
            max_age: original.max_age,
        }))
    }

    pub async fn index_execution_info(
        &self,
        handle: &StreamHandle,
    ) -> Result<Option<IndexExecutionInfo>> {
        let original = self.original_streams.get(handle).await?;
        let meta = self.metastreams.get(handle).await?;

        let is_metastream = match handle {
            StreamHandle::Id(id) => streams::is_metastream(id),
            _ => meta.is_some(),
        };

        Ok(match (original, meta) {
            (None, None) => None,
            (original, meta) => {
                let original = original.unwrap_or_default();
                let meta = meta.unwrap_or_default();
                Some(IndexExecutionInfo {
                    is_metastream,
                    is_tombstoned: original.is_tombstoned || meta.is_tombstoned,
                    discard_point: original.discard_point.or(meta.discard_point),
                })
            }
        })
    }

    // Cleaning

    pub async fn delete_metastream_data(&self) -> Result<()> {
        self.metastreams.clear().await?;
        Ok(())
    }

    /// Delete rows of streams with nothing left to do. Returns how many were deleted.
    pub async fn delete_original_stream_data(&self, delete_archived: bool) -> Result<usize> {
        let mut deleted = 0;
        for (handle, data) in self.original_streams.all().await? {
            let obsolete = match data.status {
                CalculationStatus::Spent => true,
                CalculationStatus::Archived => delete_archived,
                CalculationStatus::Active => false,
            };
            if obsolete && self.original_streams.remove(&handle).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn clear_caches(&self) {
        self.detector.clear_cache();
    }
}

fn handle_label(handle: &StreamHandle) -> String {
    match handle {
        StreamHandle::Hash(hash) => hash.to_string(),
        StreamHandle::Id(id) => id.clone(),
        StreamHandle::None => "None".to_string(),
    }
}
