//! Per-stream maps keyed by hash, or by id once a stream collides.

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::StreamHandle;

use super::map::ScavengeMap;

/// Two maps behind one stream handle: entries for non-colliding streams
/// live under their hash, colliding streams under their id.
pub struct CollisionMap<V> {
    by_hash: ScavengeMap<u64, V>,
    by_id: ScavengeMap<String, V>,
}

impl<V> CollisionMap<V>
where
    V: Serialize + DeserializeOwned + Send,
{
    pub fn new(by_hash: ScavengeMap<u64, V>, by_id: ScavengeMap<String, V>) -> Self {
        Self { by_hash, by_id }
    }

    pub async fn get(&self, handle: &StreamHandle) -> Result<Option<V>> {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.get(hash).await,
            StreamHandle::Id(id) => self.by_id.get(id).await,
            StreamHandle::None => Ok(None),
        }
    }

    pub async fn set(&self, handle: &StreamHandle, value: &V) -> Result<()> {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.set(hash, value).await,
            StreamHandle::Id(id) => self.by_id.set(id, value).await,
            StreamHandle::None => {
                anyhow::bail!("Cannot store stream data without a stream handle")
            }
        }
    }

    pub async fn remove(&self, handle: &StreamHandle) -> Result<bool> {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.remove(hash).await,
            StreamHandle::Id(id) => self.by_id.remove(id).await,
            StreamHandle::None => Ok(false),
        }
    }

    /// The stream that owned `hash` now collides: move its entry to its id.
    pub async fn notify_collision(&self, stream_id: &str, hash: u64) -> Result<()> {
        if let Some(value) = self.by_hash.get(&hash).await? {
            self.by_id.set(&stream_id.to_string(), &value).await?;
            self.by_hash.remove(&hash).await?;
        }
        Ok(())
    }

    /// Up to `limit` entries after `checkpoint`: hashed entries first,
    /// then id entries in id order.
    pub async fn enumerate_after(
        &self,
        checkpoint: &StreamHandle,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, V)>> {
        let mut page = Vec::new();

        let id_after = match checkpoint {
            StreamHandle::None | StreamHandle::Hash(_) => {
                let hash_after = match checkpoint {
                    StreamHandle::Hash(hash) => Some(*hash),
                    _ => None,
                };
                let hashed = self.by_hash.range_after(hash_after.as_ref(), limit).await?;
                page.extend(
                    hashed
                        .into_iter()
                        .map(|(hash, value)| (StreamHandle::Hash(hash), value)),
                );
                None
            }
            StreamHandle::Id(id) => Some(id.clone()),
        };

        if page.len() < limit {
            let ids = self
                .by_id
                .range_after(id_after.as_ref(), limit - page.len())
                .await?;
            page.extend(ids.into_iter().map(|(id, value)| (StreamHandle::Id(id), value)));
        }

        Ok(page)
    }

    pub async fn all(&self) -> Result<Vec<(StreamHandle, V)>> {
        let mut entries: Vec<_> = self
            .by_hash
            .all()
            .await?
            .into_iter()
            .map(|(hash, value)| (StreamHandle::Hash(hash), value))
            .collect();
        entries.extend(
            self.by_id
                .all()
                .await?
                .into_iter()
                .map(|(id, value)| (StreamHandle::Id(id), value)),
        );
        Ok(entries)
    }

    pub async fn clear(&self) -> Result<()> {
        self.by_hash.clear().await?;
        self.by_id.clear().await
    }
}
