//! Detection of stream ids that share a hash.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::model::StreamHasher;

use super::lru_map::LruCachingMap;
use super::map::ScavengeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollisionResult {
    NoCollision,
    /// First sight of a collision; carries the stream that already owned the hash
    NewCollision(String),
    /// The stream was already known to collide
    OldCollision,
}

#[derive(Default)]
struct KnownCollisions {
    ids: HashSet<String>,
    hashes: HashSet<u64>,
}

/// Remembers the first stream seen for each hash and every id that has been
/// found to share a hash with another.
///
/// The collision set only grows. Once an id is in it, that stream is
/// addressed by id for good.
pub struct CollisionDetector {
    hasher: Arc<dyn StreamHasher>,
    hash_users: LruCachingMap<u64, String>,
    collisions: ScavengeMap<String, bool>,
    known: RwLock<KnownCollisions>,
}

impl CollisionDetector {
    pub fn new(
        hasher: Arc<dyn StreamHasher>,
        hash_users: ScavengeMap<u64, String>,
        collisions: ScavengeMap<String, bool>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            hasher,
            hash_users: LruCachingMap::new(hash_users, cache_capacity),
            collisions,
            known: RwLock::new(KnownCollisions::default()),
        }
    }

    /// Load the persisted collision set
    pub async fn load(&self) -> Result<()> {
        let ids: Vec<String> = self
            .collisions
            .all()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let hashes = ids.iter().map(|id| self.hasher.hash(id)).collect();
        *self.known.write() = KnownCollisions {
            ids: ids.into_iter().collect(),
            hashes,
        };
        Ok(())
    }

    pub fn hash(&self, stream_id: &str) -> u64 {
        self.hasher.hash(stream_id)
    }

    pub fn is_collision(&self, stream_id: &str) -> bool {
        self.known.read().ids.contains(stream_id)
    }

    /// Whether any stream under this hash is addressed by id
    pub fn is_colliding_hash(&self, hash: u64) -> bool {
        self.known.read().hashes.contains(&hash)
    }

    pub fn collisions(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.known.read().ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn detect_collisions(&self, stream_id: &str) -> Result<CollisionResult> {
        if self.is_collision(stream_id) {
            return Ok(CollisionResult::OldCollision);
        }

        let hash = self.hasher.hash(stream_id);
        match self.hash_users.get(&hash).await? {
            None => {
                self.hash_users.set(&hash, &stream_id.to_string()).await?;
                Ok(CollisionResult::NoCollision)
            }
            Some(user) if user == stream_id => Ok(CollisionResult::NoCollision),
            Some(user) => {
                // the first user may already be flagged by an earlier collision
                self.add_collision(&user, hash).await?;
                self.add_collision(stream_id, hash).await?;
                Ok(CollisionResult::NewCollision(user))
            }
        }
    }

    async fn add_collision(&self, stream_id: &str, hash: u64) -> Result<()> {
        if self.is_collision(stream_id) {
            return Ok(());
        }
        self.collisions.set(&stream_id.to_string(), &true).await?;
        let mut known = self.known.write();
        known.ids.insert(stream_id.to_string());
        known.hashes.insert(hash);
        Ok(())
    }

    /// Forget everything written in a transaction that was rolled back
    pub async fn on_rollback(&self) -> Result<()> {
        self.hash_users.clear_cache();
        self.load().await
    }

    pub fn clear_cache(&self) {
        self.hash_users.clear_cache();
    }
}
