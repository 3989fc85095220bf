//! Archive checkpoint kept as a small object next to the archived chunks.

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path;
use std::sync::Arc;

use common::config::ArchiveConfig;
use common::storage::create_archive_store;

use crate::collaborators::ArchiveCheckpointReader;

/// Reads the archived log position from an 8 byte little endian object.
/// A missing object means nothing is archived yet.
pub struct ObjectStoreCheckpointReader {
    store: Arc<dyn ObjectStore>,
    path: Path,
}

impl ObjectStoreCheckpointReader {
    pub fn new(store: Arc<dyn ObjectStore>, checkpoint_object: &str) -> Self {
        Self {
            store,
            path: Path::from(checkpoint_object),
        }
    }

    /// Open the configured archive store
    pub fn from_config(config: &ArchiveConfig) -> Result<Self> {
        let store = create_archive_store(config)?;
        Ok(Self::new(store, &config.checkpoint_object))
    }
}

#[async_trait]
impl ArchiveCheckpointReader for ObjectStoreCheckpointReader {
    async fn archive_checkpoint(&self) -> Result<i64> {
        match self.store.get(&self.path).await {
            Ok(get_result) => {
                let bytes = get_result.bytes().await?;
                let Ok(raw) = <[u8; 8]>::try_from(bytes.as_ref()) else {
                    bail!(
                        "Archive checkpoint {} has {} bytes, expected 8",
                        self.path,
                        bytes.len()
                    );
                };
                Ok(i64::from_le_bytes(raw))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Record how far the archive has got
pub async fn write_archive_checkpoint(
    store: &dyn ObjectStore,
    checkpoint_object: &str,
    position: i64,
) -> Result<()> {
    let payload = Bytes::copy_from_slice(&position.to_le_bytes());
    store
        .put(&Path::from(checkpoint_object), payload.into())
        .await?;
    Ok(())
}
