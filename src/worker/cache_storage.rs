//! Named response caches
//!
//! Caches are created lazily by the first `put` and hold one response per
//! request key. All worker state that must outlive the worker lives here.

use super::request::{Request, Response};
use crate::db::{Database, DbError};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::params;

#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn names(&self) -> Result<Vec<String>, CacheStorageError>;

    async fn has(&self, name: &str) -> Result<bool, CacheStorageError>;

    /// Delete a whole cache, returning whether it existed
    async fn delete(&self, name: &str) -> Result<bool, CacheStorageError>;

    async fn put(&self, name: &str, request: &Request, response: &Response) -> Result<(), CacheStorageError>;

    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>, CacheStorageError>;

    /// Most recently stored match across every cache
    async fn match_any(&self, request: &Request) -> Result<Option<Response>, CacheStorageError>;

    async fn len(&self, name: &str) -> Result<usize, CacheStorageError>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Named caches in the `worker_caches` table
#[derive(Clone)]
pub struct SqliteCacheStorage {
    db: Database,
}

impl SqliteCacheStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<(u16, String, Vec<u8>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode(row: Option<(u16, String, Vec<u8>)>) -> Result<Option<Response>, CacheStorageError> {
    match row {
        Some((status, headers, body)) => Ok(Some(Response {
            status,
            headers: serde_json::from_str(&headers)?,
            body,
        })),
        None => Ok(None),
    }
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn names(&self) -> Result<Vec<String>, CacheStorageError> {
        Ok(self.db.query(
            "SELECT DISTINCT cache_name FROM worker_caches ORDER BY cache_name",
            [],
            |row| row.get(0),
        )?)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheStorageError> {
        Ok(self.db.query_row(
            "SELECT COUNT(*) > 0 FROM worker_caches WHERE cache_name = ?1",
            params![name],
            |row| row.get(0),
        )?)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheStorageError> {
        let deleted = self
            .db
            .execute("DELETE FROM worker_caches WHERE cache_name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    async fn put(&self, name: &str, request: &Request, response: &Response) -> Result<(), CacheStorageError> {
        let headers = serde_json::to_string(&response.headers)?;
        self.db.execute(
            "INSERT OR REPLACE INTO worker_caches
                (cache_name, request_key, status, headers, body, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                request.cache_key(),
                response.status,
                headers,
                response.body,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )?;
        Ok(())
    }

    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>, CacheStorageError> {
        let row = self.db.query_optional(
            "SELECT status, headers, body FROM worker_caches
             WHERE cache_name = ?1 AND request_key = ?2",
            params![name, request.cache_key()],
            row_to_response,
        )?;
        decode(row)
    }

    async fn match_any(&self, request: &Request) -> Result<Option<Response>, CacheStorageError> {
        let row = self.db.query_optional(
            "SELECT status, headers, body FROM worker_caches
             WHERE request_key = ?1 ORDER BY stored_at DESC LIMIT 1",
            params![request.cache_key()],
            row_to_response,
        )?;
        decode(row)
    }

    async fn len(&self, name: &str) -> Result<usize, CacheStorageError> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM worker_caches WHERE cache_name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

/// Cache storage for hosts without interception support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCacheStorage;

#[async_trait]
impl CacheStorage for NoopCacheStorage {
    async fn names(&self) -> Result<Vec<String>, CacheStorageError> {
        Ok(Vec::new())
    }

    async fn has(&self, _name: &str) -> Result<bool, CacheStorageError> {
        Ok(false)
    }

    async fn delete(&self, _name: &str) -> Result<bool, CacheStorageError> {
        Ok(false)
    }

    async fn put(&self, _name: &str, _request: &Request, _response: &Response) -> Result<(), CacheStorageError> {
        Err(CacheStorageError::Unavailable)
    }

    async fn match_request(&self, _name: &str, _request: &Request) -> Result<Option<Response>, CacheStorageError> {
        Ok(None)
    }

    async fn match_any(&self, _request: &Request) -> Result<Option<Response>, CacheStorageError> {
        Ok(None)
    }

    async fn len(&self, _name: &str) -> Result<usize, CacheStorageError> {
        Ok(0)
    }

    fn is_available(&self) -> bool {
        false
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheStorageError {
    #[error("Cache storage unavailable")]
    Unavailable,

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
