use anyhow::Result;
use object_store::{ObjectStore, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

use crate::config::ArchiveConfig;

/// Create the archive object store from archive configuration
pub fn create_archive_store(archive_config: &ArchiveConfig) -> Result<Arc<dyn ObjectStore>> {
    create_object_store_from_dsn(&archive_config.dsn)
}

/// Create an object store from a DSN string
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = file_path(&url)?;
            std::fs::create_dir_all(path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory",
            scheme
        )),
    }
}

fn file_path(url: &Url) -> Result<&str> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        return Err(anyhow::anyhow!(
            "File DSN must specify a path: file:///path/to/archive"
        ));
    }
    // /.data/archive is relative, /tmp/data is absolute
    Ok(if path.starts_with("/.") {
        &path[1..]
    } else {
        path
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::{PutPayload, path::Path};

    #[tokio::test]
    async fn test_create_memory_object_store() {
        let object_store = create_object_store_from_dsn("memory://").unwrap();
        let path = Path::from("archive.chk");
        object_store
            .put(&path, PutPayload::from_static(b"x"))
            .await
            .unwrap();
        assert!(object_store.head(&path).await.is_ok());
    }

    #[test]
    fn test_create_filesystem_object_store() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive");
        let dsn = format!("file://{}", path.to_string_lossy());

        let object_store = create_object_store_from_dsn(&dsn).unwrap();
        assert!(Arc::strong_count(&object_store) == 1);
        assert!(path.exists());
    }

    #[test]
    fn test_create_archive_store_from_config() {
        let archive_config = ArchiveConfig::default();
        assert!(create_archive_store(&archive_config).is_ok());
    }

    #[test]
    fn test_invalid_dsn() {
        let result = create_object_store_from_dsn("not-a-url");
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid storage DSN")
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        let result = create_object_store_from_dsn("gcs://bucket/prefix");
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported storage scheme")
        );
    }

    #[test]
    fn test_file_dsn_without_path() {
        let result = create_object_store_from_dsn("file://");
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("File DSN must specify a path")
        );
    }
}
