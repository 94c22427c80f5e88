//! SQLite-backed key-value store

use super::{KeyValueStore, StorageError, DEFAULT_QUOTA_BYTES};
use crate::db::{Database, DbError};
use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::params;
use serde_json::Value;
use std::io::{Read, Write};

/// Values larger than this are gzip-compressed before they hit the table
const COMPRESSION_THRESHOLD: usize = 4 * 1024;

/// Key-value store persisted in the `kv_store` table
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    db: Database,
    quota_bytes: u64,
}

impl SqliteKeyValueStore {
    pub fn new(db: Database) -> Self {
        Self::with_quota(db, DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(db: Database, quota_bytes: u64) -> Self {
        Self { db, quota_bytes }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<(Vec<u8>, bool)> = self.db.query_optional(
            "SELECT value, compressed FROM kv_store WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        match row {
            Some((bytes, compressed)) => {
                let raw = if compressed { gunzip(&bytes)? } else { bytes };
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(&value)?;
        let (bytes, compressed) = if raw.len() > COMPRESSION_THRESHOLD {
            (gzip(&raw)?, true)
        } else {
            (raw, false)
        };
        let size = bytes.len() as u64;
        let quota = self.quota_bytes;

        self.db.transaction(|tx| {
            let used: i64 = tx
                .query_row(
                    "SELECT COALESCE(SUM(size), 0) FROM kv_store WHERE key != ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map_err(DbError::from)?;
            let used = used.max(0) as u64;

            if used + size > quota {
                return Err(StorageError::QuotaExceeded {
                    requested: size,
                    available: quota.saturating_sub(used),
                });
            }

            tx.execute(
                "INSERT OR REPLACE INTO kv_store (key, value, size, updated_at, compressed)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key, bytes, size as i64, Utc::now().to_rfc3339(), compressed],
            )
            .map_err(DbError::from)?;

            Ok(())
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let affected = self
            .db
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let deleted = self.db.execute("DELETE FROM kv_store", [])?;
        log::info!("Cleared {} key-value entries", deleted);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .db
            .query("SELECT key FROM kv_store ORDER BY key", [], |row| row.get(0))?)
    }

    async fn bytes_in_use(&self) -> Result<u64, StorageError> {
        let used: i64 = self.db.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM kv_store",
            [],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as u64)
    }

    fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_store(quota: u64) -> SqliteKeyValueStore {
        let db = Database::in_memory().expect("Failed to create test DB");
        SqliteKeyValueStore::with_quota(db, quota)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = create_test_store(DEFAULT_QUOTA_BYTES);

        store.set("a", json!({"x": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_large_values_are_compressed() {
        let store = create_test_store(DEFAULT_QUOTA_BYTES);
        let text = "bookmark ".repeat(2_000);

        store.set("big", json!(text)).await.unwrap();

        let compressed: bool = store
            .db
            .query_row("SELECT compressed FROM kv_store WHERE key = 'big'", [], |row| row.get(0))
            .unwrap();
        assert!(compressed);
        assert!(store.bytes_in_use().await.unwrap() < text.len() as u64);
        assert_eq!(store.get("big").await.unwrap(), Some(json!(text)));
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let store = create_test_store(64);

        store.set("small", json!("ok")).await.unwrap();

        let err = store
            .set("too_big", json!("x".repeat(100)))
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(store.get("too_big").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count() {
        let store = create_test_store(40);

        store.set("k", json!("x".repeat(20))).await.unwrap();
        store.set("k", json!("y".repeat(20))).await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = create_test_store(DEFAULT_QUOTA_BYTES);
        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(store.bytes_in_use().await.unwrap(), 0);
    }
}
