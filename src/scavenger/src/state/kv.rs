//! Transactional key-value contract backing the scavenge state.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Named, ordered string maps with a single open transaction at a time.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: &'static str, key: &str) -> Result<Option<String>>;

    async fn put(&self, table: &'static str, key: &str, value: &str) -> Result<()>;

    /// Returns whether the key was present
    async fn delete(&self, table: &'static str, key: &str) -> Result<bool>;

    /// Up to `limit` entries with keys strictly after `after`, in key order
    async fn scan(
        &self,
        table: &'static str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>>;

    async fn clear(&self, table: &'static str) -> Result<()>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

type Tables = BTreeMap<&'static str, BTreeMap<String, String>>;

#[derive(Default)]
struct MemoryInner {
    tables: Tables,
    snapshot: Option<Tables>,
}

/// In-process store. Clones share the same data, so a test can drop one
/// scavenger and start another over the same state.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, table: &'static str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &'static str) -> bool {
        self.len(table) == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, table: &'static str, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(key).cloned()))
    }

    async fn put(&self, table: &'static str, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .tables
            .entry(table)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, table: &'static str, key: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .tables
            .get_mut(table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn scan(
        &self,
        table: &'static str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        use std::ops::Bound;

        let inner = self.inner.lock();
        let Some(t) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        Ok(t.range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear(&self, table: &'static str) -> Result<()> {
        self.inner.lock().tables.remove(table);
        Ok(())
    }

    async fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.snapshot.is_some() {
            anyhow::bail!("A transaction is already open");
        }
        inner.snapshot = Some(inner.tables.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.snapshot.take().is_none() {
            anyhow::bail!("No transaction to commit");
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.snapshot.take() {
            Some(snapshot) => {
                inner.tables = snapshot;
                Ok(())
            }
            None => anyhow::bail!("No transaction to roll back"),
        }
    }
}
