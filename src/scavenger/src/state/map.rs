//! Typed views over a [`KvStore`] table.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

use super::kv::KvStore;

/// Keys encode to text that sorts the same way the key does.
pub trait MapKey: Sized + Send + Sync {
    fn encode(&self) -> String;
    fn decode(encoded: &str) -> Result<Self>;
}

impl MapKey for u64 {
    fn encode(&self) -> String {
        format!("{self:016x}")
    }

    fn decode(encoded: &str) -> Result<Self> {
        u64::from_str_radix(encoded, 16).with_context(|| format!("Invalid hash key '{encoded}'"))
    }
}

impl MapKey for i32 {
    // chunk numbers are never negative
    fn encode(&self) -> String {
        format!("{self:010}")
    }

    fn decode(encoded: &str) -> Result<Self> {
        encoded
            .parse()
            .with_context(|| format!("Invalid chunk key '{encoded}'"))
    }
}

impl MapKey for String {
    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(encoded: &str) -> Result<Self> {
        Ok(encoded.to_string())
    }
}

const PAGE_SIZE: usize = 1024;

/// A named map of `K` to JSON encoded `V`.
pub struct ScavengeMap<K, V> {
    store: Arc<dyn KvStore>,
    table: &'static str,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for ScavengeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            table: self.table,
            _marker: PhantomData,
        }
    }
}

impl<K, V> ScavengeMap<K, V>
where
    K: MapKey,
    V: Serialize + DeserializeOwned + Send,
{
    pub fn new(store: Arc<dyn KvStore>, table: &'static str) -> Self {
        Self {
            store,
            table,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        match self.store.get(self.table, &key.encode()).await? {
            Some(value) => Ok(Some(self.decode_value(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &K, value: &V) -> Result<()> {
        let value = serde_json::to_string(value)
            .with_context(|| format!("Failed to encode value for {}", self.table))?;
        self.store.put(self.table, &key.encode(), &value).await
    }

    pub async fn remove(&self, key: &K) -> Result<bool> {
        self.store.delete(self.table, &key.encode()).await
    }

    /// Up to `limit` entries after `after`, in key order
    pub async fn range_after(&self, after: Option<&K>, limit: usize) -> Result<Vec<(K, V)>> {
        let after = after.map(MapKey::encode);
        let rows = self.store.scan(self.table, after.as_deref(), limit).await?;
        rows.into_iter()
            .map(|(k, v)| Ok((K::decode(&k)?, self.decode_value(&v)?)))
            .collect()
    }

    pub async fn all(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .store
                .scan(self.table, after.as_deref(), PAGE_SIZE)
                .await?;
            let done = page.len() < PAGE_SIZE;
            for (k, v) in page {
                entries.push((K::decode(&k)?, self.decode_value(&v)?));
                after = Some(k);
            }
            if done {
                return Ok(entries);
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(self.table).await
    }

    fn decode_value(&self, value: &str) -> Result<V> {
        serde_json::from_str(value)
            .with_context(|| format!("Failed to decode value in {}: {value}", self.table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::kv::MemoryKvStore;

    #[test]
    fn test_hash_keys_sort_numerically() {
        let mut keys = vec![255u64, 1, 4096, 16];
        let mut encoded: Vec<_> = keys.iter().map(MapKey::encode).collect();
        keys.sort();
        encoded.sort();
        let decoded: Vec<u64> = encoded.iter().map(|k| u64::decode(k).unwrap()).collect();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn test_chunk_keys_sort_numerically() {
        assert!(2i32.encode() < 10i32.encode());
        assert_eq!(i32::decode(&123i32.encode()).unwrap(), 123);
    }

    #[tokio::test]
    async fn test_all_pages_through_large_tables() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let map: ScavengeMap<i32, f32> = ScavengeMap::new(store, "weights");
        for chunk in 0..(PAGE_SIZE as i32 * 2 + 5) {
            map.set(&chunk, &1.0).await.unwrap();
        }
        let all = map.all().await.unwrap();
        assert_eq!(all.len(), PAGE_SIZE * 2 + 5);
        assert_eq!(all.last().unwrap().0, PAGE_SIZE as i32 * 2 + 4);
    }

    #[tokio::test]
    async fn test_range_after() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let map: ScavengeMap<u64, String> = ScavengeMap::new(store, "hashes");
        for hash in [3u64, 1, 2] {
            map.set(&hash, &format!("stream-{hash}")).await.unwrap();
        }
        let page = map.range_after(Some(&1), 10).await.unwrap();
        assert_eq!(
            page,
            vec![(2, "stream-2".to_string()), (3, "stream-3".to_string())]
        );
    }
}
