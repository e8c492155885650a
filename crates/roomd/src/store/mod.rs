//! Persisted key-value settings.
//!
//! The learner keeps its per-sensor timeouts here so they survive restarts.
//! Callers treat every store failure as non-fatal: a read error degrades to
//! "no data", a write error is logged and the save skipped.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read settings file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("failed to write settings file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("settings file {0} is not valid JSON: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

/// A small persisted key-value store with get/set/unset semantics.
///
/// Absent keys are not an error; `get` returns `None` for them.
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn unset(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON file (one top-level object, key -> value).
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_map(&self) -> Result<HashMap<String, Value>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Parse(self.path.clone(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StoreError::Read(self.path.clone(), e)),
        }
    }

    async fn write_map(&self, map: &HashMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if parent != Path::new("") {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Write(self.path.clone(), e))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(map)
            .map_err(|e| StoreError::Parse(self.path.clone(), e))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| StoreError::Write(self.path.clone(), e))
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_map().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut map = self.read_map().await?;
        map.insert(key.to_string(), value);
        self.write_map(&map).await
    }

    async fn unset(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.read_map().await?;
        if map.remove(key).is_some() {
            self.write_map(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));

        store.unset("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("settings.json"));

        // Absent file reads as absent key
        assert_eq!(store.get("timeouts").await.unwrap(), None);

        store.set("timeouts", json!({"m1": 5000})).await.unwrap();
        assert_eq!(
            store.get("timeouts").await.unwrap(),
            Some(json!({"m1": 5000}))
        );

        // Reopening the same path sees the persisted value
        let reopened = FileStore::new(dir.path().join("settings.json"));
        assert_eq!(
            reopened.get("timeouts").await.unwrap(),
            Some(json!({"m1": 5000}))
        );

        reopened.unset("timeouts").await.unwrap();
        assert_eq!(reopened.get("timeouts").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(
            store.get("timeouts").await,
            Err(StoreError::Parse(..))
        ));
    }
}
