//! Durable blob storage
//!
//! Publishing is all-or-nothing: [`LocalStore::put`] writes to a temporary
//! file in the destination directory, syncs it and renames it into place, so
//! readers (including the partner's dependency gate) never observe a partly
//! written object.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, StepError};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Single existence check, no retries
    async fn exists(&self, location: &Path) -> Result<bool>;

    async fn get(&self, location: &Path) -> Result<Vec<u8>>;

    /// Atomically create or replace the object at `location`
    async fn put(&self, location: &Path, data: &[u8]) -> Result<()>;
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed store
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        Self
    }

    fn temp_path(location: &Path) -> PathBuf {
        let name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_string());
        let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        location.with_file_name(format!(".{}.tmp-{}-{}", name, std::process::id(), unique))
    }
}

fn storage_err(action: &str, location: &Path, err: std::io::Error) -> StepError {
    StepError::Storage(format!("{} {}: {}", action, location.display(), err))
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn exists(&self, location: &Path) -> Result<bool> {
        match tokio::fs::metadata(location).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_err("stat", location, e)),
        }
    }

    async fn get(&self, location: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(location)
            .await
            .map_err(|e| storage_err("read", location, e))
    }

    async fn put(&self, location: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err("create directory for", location, e))?;
        }

        let temp = Self::temp_path(location);
        let write = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, location).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(storage_err("write", location, e));
        }

        tracing::debug!(path = %location.display(), bytes = data.len(), "Published blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_exists() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new();
        let path = dir.path().join("q/level-0.result");

        assert!(!store.exists(&path).await.unwrap());
        store.put(&path, b"hello").await.unwrap();
        assert!(store.exists(&path).await.unwrap());
        assert_eq!(store.get(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_put_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new();
        let path = dir.path().join("blob");

        store.put(&path, b"first").await.unwrap();
        store.put(&path, b"second").await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), b"second");

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_storage_error() {
        let dir = tempdir().unwrap();
        let err = LocalStore::new()
            .get(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Storage(_)));
    }

    #[tokio::test]
    async fn test_directory_is_not_an_object() {
        let dir = tempdir().unwrap();
        assert!(!LocalStore::new().exists(dir.path()).await.unwrap());
    }
}
