//! Read-through LRU cache in front of a [`ScavengeMap`].

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::num::NonZeroUsize;

use super::map::{MapKey, ScavengeMap};

/// Writes go to both the cache and the map. The cache holds uncommitted
/// values, so it must be cleared when a transaction rolls back.
pub struct LruCachingMap<K, V>
where
    K: Hash + Eq,
{
    map: ScavengeMap<K, V>,
    cache: Mutex<LruCache<K, V>>,
}

impl<K, V> LruCachingMap<K, V>
where
    K: MapKey + Hash + Eq + Clone,
    V: Serialize + DeserializeOwned + Clone + Send,
{
    pub fn new(map: ScavengeMap<K, V>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            map,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.cache.lock().get(key) {
            return Ok(Some(value.clone()));
        }
        let value = self.map.get(key).await?;
        if let Some(value) = &value {
            self.cache.lock().put(key.clone(), value.clone());
        }
        Ok(value)
    }

    pub async fn set(&self, key: &K, value: &V) -> Result<()> {
        self.map.set(key, value).await?;
        self.cache.lock().put(key.clone(), value.clone());
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}
