//! Persistent key-value tier.
//!
//! The cache manager and session persistence both talk to an asynchronous
//! key-value store through [`PersistentStore`]. Two implementations ship
//! with the crate: [`FsStore`] over a directory (writes are atomic via a
//! temp file and rename, so readers never observe partial writes) and
//! [`MemoryStore`] for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Asynchronous key-value store for cache entries and session snapshots.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Persist `bytes` under `key`, replacing any previous value.
    async fn save(&self, key: &str, bytes: Bytes) -> Result<(), StoreError>;

    /// Load the value stored under `key`.
    async fn load(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Remove the value stored under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// List all stored keys, in no particular order.
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Directory-backed store.
///
/// Keys are percent-encoded into file names, so cache keys containing
/// `:` map cleanly onto any filesystem.
pub struct FsStore {
    base_dir: PathBuf,
}

impl FsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(urlencoding::encode(key).as_ref())
    }
}

#[async_trait]
impl PersistentStore for FsStore {
    async fn save(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            if let Ok(decoded) = urlencoding::decode(name) {
                keys.push(decoded.into_owned());
            }
        }
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn save(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Bytes, StoreError> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store
            .save("precinct:7", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert_eq!(store.load("precinct:7").await.unwrap().as_ref(), b"abc");
        assert_eq!(store.list_keys().await.unwrap(), vec!["precinct:7"]);

        store.remove("precinct:7").await.unwrap();
        assert!(matches!(
            store.load("precinct:7").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store
            .save("tile:3", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(store.load("tile:3").await.unwrap().as_ref(), b"payload");

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys, vec!["tile:3".to_string()]);

        store.remove("tile:3").await.unwrap();
        assert!(matches!(
            store.load("tile:3").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(matches!(
            store.load("absent").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_missing_dir_lists_empty() {
        let store = FsStore::new("/nonexistent/jpip-test-dir");
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.save("k", Bytes::from_static(b"one")).await.unwrap();
        store.save("k", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.load("k").await.unwrap().as_ref(), b"two");
        assert_eq!(store.list_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.remove("never-there").await.unwrap();
    }
}
