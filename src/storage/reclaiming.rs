//! Quota recovery for writers sharing the store with the cache

use super::{KeyValueStore, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Something that can give bytes back when the store is full
#[async_trait]
pub trait SpaceReclaimer: Send + Sync {
    /// Free at least `shortfall` bytes without touching `keep`
    async fn reclaim(&self, shortfall: u64, keep: &str) -> Result<u64, StorageError>;
}

/// Store wrapper that reclaims space and retries once when a write hits the quota
pub struct ReclaimingStore {
    inner: Arc<dyn KeyValueStore>,
    reclaimer: Arc<dyn SpaceReclaimer>,
}

impl ReclaimingStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, reclaimer: Arc<dyn SpaceReclaimer>) -> Self {
        Self { inner, reclaimer }
    }
}

#[async_trait]
impl KeyValueStore for ReclaimingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        match self.inner.set(key, value.clone()).await {
            Err(StorageError::QuotaExceeded { requested, available }) => {
                let shortfall = requested.saturating_sub(available);
                log::warn!(
                    "Storage quota exceeded writing {} (short {} bytes), reclaiming",
                    key,
                    shortfall
                );
                self.reclaimer.reclaim(shortfall, key).await?;
                self.inner.set(key, value).await
            }
            other => other,
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    async fn bytes_in_use(&self) -> Result<u64, StorageError> {
        self.inner.bytes_in_use().await
    }

    fn quota_bytes(&self) -> u64 {
        self.inner.quota_bytes()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Drops every `filler:` key
    struct DropFiller {
        store: Arc<dyn KeyValueStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpaceReclaimer for DropFiller {
        async fn reclaim(&self, _shortfall: u64, keep: &str) -> Result<u64, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let before = self.store.bytes_in_use().await?;
            for key in self.store.keys_with_prefix("filler:").await? {
                if key != keep {
                    self.store.remove(&key).await?;
                }
            }
            Ok(before.saturating_sub(self.store.bytes_in_use().await?))
        }
    }

    fn create_store(quota: u64) -> (ReclaimingStore, Arc<dyn KeyValueStore>, Arc<DropFiller>) {
        let inner: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::with_quota(quota));
        let reclaimer = Arc::new(DropFiller {
            store: Arc::clone(&inner),
            calls: AtomicUsize::new(0),
        });
        (ReclaimingStore::new(Arc::clone(&inner), reclaimer.clone()), inner, reclaimer)
    }

    #[tokio::test]
    async fn test_full_store_reclaims_then_writes() {
        let (store, inner, reclaimer) = create_store(1_000);
        inner.set("filler:1", json!("x".repeat(400))).await.unwrap();
        inner.set("filler:2", json!("x".repeat(400))).await.unwrap();

        store.set("queue", json!("y".repeat(400))).await.unwrap();

        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 1);
        assert!(inner.get("queue").await.unwrap().is_some());
        assert!(inner.keys_with_prefix("filler:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_within_quota_does_not_reclaim() {
        let (store, inner, reclaimer) = create_store(1_000);
        inner.set("filler:1", json!("x".repeat(100))).await.unwrap();

        store.set("queue", json!("y".repeat(100))).await.unwrap();

        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 0);
        assert!(inner.get("filler:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_quota_surfaces_when_nothing_to_reclaim() {
        let (store, _, reclaimer) = create_store(100);

        let err = store.set("queue", json!("y".repeat(500))).await.unwrap_err();

        assert!(err.is_quota_exceeded());
        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 1);
    }
}
