//! Host key-value storage
//!
//! The persistent key-value store is the single source of truth shared by
//! every process. The tiered cache, the typed repositories and the offline
//! mutation queue are all built on this one primitive:
//! - async `get` / `set` / `remove` / `clear` over JSON values
//! - key listing (needed for prefix invalidation and eviction)
//! - an application-imposed byte quota (`set` fails with `QuotaExceeded`)
//!
//! Writers other than the cache go through `ReclaimingStore`, which asks the
//! cache to evict entries before a quota failure reaches them.

mod memory;
mod reclaiming;
pub mod repository;
mod sqlite;

pub use memory::MemoryKeyValueStore;
pub use reclaiming::{ReclaimingStore, SpaceReclaimer};
pub use repository::{Entity, ListQuery, Page, Repository, SortOrder};
pub use sqlite::SqliteKeyValueStore;

use crate::db::DbError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Default quota for the persistent store (10 MiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024;

/// Async key-value store with a byte quota
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove a value, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove everything
    async fn clear(&self) -> Result<(), StorageError>;

    /// List every stored key
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Bytes currently counted against the quota
    async fn bytes_in_use(&self) -> Result<u64, StorageError>;

    /// Configured quota in bytes
    fn quota_bytes(&self) -> u64;
}

impl dyn KeyValueStore {
    /// Read and deserialize a value
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write a value
    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }

    /// Keys starting with `prefix`
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}
