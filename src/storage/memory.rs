//! In-memory key-value store for tests and hosts without durable storage

use super::{KeyValueStore, StorageError, DEFAULT_QUOTA_BYTES};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, (Value, u64)>>,
    quota_bytes: u64,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            quota_bytes,
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().await.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let size = serde_json::to_vec(&value)?.len() as u64;
        let mut entries = self.entries.write().await;

        let used: u64 = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, (_, s))| *s)
            .sum();

        if used + size > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                requested: size,
                available: self.quota_bytes.saturating_sub(used),
            });
        }

        entries.insert(key.to_string(), (value, size));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn bytes_in_use(&self) -> Result<u64, StorageError> {
        Ok(self.entries.read().await.values().map(|(_, s)| *s).sum())
    }

    fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_typed_helpers() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());

        store.save("numbers", &vec![1, 2, 3]).await.unwrap();
        let loaded: Option<Vec<i32>> = store.load("numbers").await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = store.load("other").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        store.set("cache:a", json!(1)).await.unwrap();
        store.set("cache:b", json!(2)).await.unwrap();
        store.set("sync:queue", json!([])).await.unwrap();

        let keys = store.keys_with_prefix("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:a".to_string(), "cache:b".to_string()]);
    }

    #[tokio::test]
    async fn test_quota() {
        let store = MemoryKeyValueStore::with_quota(10);
        store.set("a", json!("1234")).await.unwrap();

        let err = store.set("b", json!("123456")).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { requested: 8, available: 4 }));
    }
}
