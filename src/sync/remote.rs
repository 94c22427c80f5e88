//! Remote table backend
//!
//! The sync service talks to the hosted bookmarks table through this trait:
//! row-level reads and writes scoped to one user plus a change stream.
//! `InMemoryBackend` keeps the table in process memory; it also serves tests
//! through its failure injection hooks.

use super::models::{ChangeEvent, ChangeKind};
use crate::models::Bookmark;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Every bookmark owned by `user_id`
    async fn select_bookmarks(&self, user_id: &str) -> Result<Vec<Bookmark>, RemoteError>;

    async fn fetch_bookmark(&self, user_id: &str, id: &str) -> Result<Option<Bookmark>, RemoteError>;

    async fn insert_bookmark(&self, bookmark: &Bookmark) -> Result<(), RemoteError>;

    async fn update_bookmark(&self, bookmark: &Bookmark) -> Result<(), RemoteError>;

    /// Delete a row, returning whether it existed
    async fn delete_bookmark(&self, user_id: &str, id: &str) -> Result<bool, RemoteError>;

    /// Change notifications for rows owned by `user_id`
    async fn subscribe(&self, user_id: &str) -> Result<broadcast::Receiver<ChangeEvent>, RemoteError>;
}

/// Remote table held in memory
pub struct InMemoryBackend {
    rows: StdMutex<HashMap<String, Bookmark>>,
    tx: broadcast::Sender<ChangeEvent>,
    offline: AtomicBool,
    pass_first: AtomicUsize,
    fail_next: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            rows: StdMutex::new(HashMap::new()),
            tx,
            offline: AtomicBool::new(false),
            pass_first: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make every call fail with a network error while `true`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a network error
    pub fn fail_next(&self, count: usize) {
        self.fail_after(0, count);
    }

    /// Let `passing` calls through, then fail the next `count`
    pub fn fail_after(&self, passing: usize, count: usize) {
        self.pass_first.store(passing, Ordering::SeqCst);
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Successful inserts, updates and deletes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn row(&self, id: &str) -> Option<Bookmark> {
        self.lock_rows().get(id).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.lock_rows().len()
    }

    /// Write a row as another device would, notifying subscribers
    pub fn apply_external(&self, bookmark: Bookmark) {
        let kind = if self.lock_rows().contains_key(&bookmark.id) {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.lock_rows().insert(bookmark.id.clone(), bookmark.clone());
        self.notify(kind, &bookmark.user_id, &bookmark.id, bookmark.version, Some(bookmark.clone()));
    }

    /// Delete a row as another device would, notifying subscribers
    pub fn delete_external(&self, user_id: &str, id: &str, version: i64) {
        self.lock_rows().remove(id);
        self.notify(ChangeKind::Delete, user_id, id, version, None);
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bookmark>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }

        if self.fail_next.load(Ordering::SeqCst) > 0 {
            let passed = self
                .pass_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if passed {
                return Ok(());
            }
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Network("injected failure".to_string()));
        }
        Ok(())
    }

    fn notify(&self, kind: ChangeKind, user_id: &str, id: &str, version: i64, record: Option<Bookmark>) {
        // No subscribers is fine
        let _ = self.tx.send(ChangeEvent {
            kind,
            user_id: user_id.to_string(),
            object_id: id.to_string(),
            version,
            record,
        });
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn select_bookmarks(&self, user_id: &str) -> Result<Vec<Bookmark>, RemoteError> {
        self.check_reachable()?;
        let mut rows: Vec<Bookmark> = self
            .lock_rows()
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn fetch_bookmark(&self, user_id: &str, id: &str) -> Result<Option<Bookmark>, RemoteError> {
        self.check_reachable()?;
        Ok(self.lock_rows().get(id).filter(|b| b.user_id == user_id).cloned())
    }

    async fn insert_bookmark(&self, bookmark: &Bookmark) -> Result<(), RemoteError> {
        self.check_reachable()?;
        {
            let mut rows = self.lock_rows();
            if rows.contains_key(&bookmark.id) {
                return Err(RemoteError::Conflict(format!("duplicate key {}", bookmark.id)));
            }
            rows.insert(bookmark.id.clone(), bookmark.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify(
            ChangeKind::Insert,
            &bookmark.user_id,
            &bookmark.id,
            bookmark.version,
            Some(bookmark.clone()),
        );
        Ok(())
    }

    async fn update_bookmark(&self, bookmark: &Bookmark) -> Result<(), RemoteError> {
        self.check_reachable()?;
        {
            let mut rows = self.lock_rows();
            match rows.get_mut(&bookmark.id) {
                Some(row) if row.user_id == bookmark.user_id => *row = bookmark.clone(),
                _ => return Err(RemoteError::NotFound),
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify(
            ChangeKind::Update,
            &bookmark.user_id,
            &bookmark.id,
            bookmark.version,
            Some(bookmark.clone()),
        );
        Ok(())
    }

    async fn delete_bookmark(&self, user_id: &str, id: &str) -> Result<bool, RemoteError> {
        self.check_reachable()?;
        let removed = {
            let mut rows = self.lock_rows();
            match rows.get(id) {
                Some(row) if row.user_id == user_id => rows.remove(id),
                _ => None,
            }
        };

        match removed {
            Some(row) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                self.notify(ChangeKind::Delete, user_id, id, row.version, None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn subscribe(&self, _user_id: &str) -> Result<broadcast::Receiver<ChangeEvent>, RemoteError> {
        Ok(self.tx.subscribe())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Row not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Worth retrying later
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::RateLimited => true,
            RemoteError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rows_are_scoped_to_user() {
        let backend = InMemoryBackend::new();
        backend.insert_bookmark(&Bookmark::new("alice", "A", "https://a.dev")).await.unwrap();
        backend.insert_bookmark(&Bookmark::new("bob", "B", "https://b.dev")).await.unwrap();

        let rows = backend.select_bookmarks("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "A");

        let bob_id = backend.select_bookmarks("bob").await.unwrap()[0].id.clone();
        assert!(backend.fetch_bookmark("alice", &bob_id).await.unwrap().is_none());
        assert!(!backend.delete_bookmark("alice", &bob_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let backend = InMemoryBackend::new();
        let bookmark = Bookmark::new("alice", "A", "https://a.dev");
        backend.insert_bookmark(&bookmark).await.unwrap();

        assert!(matches!(
            backend.insert_bookmark(&bookmark).await,
            Err(RemoteError::Conflict(_))
        ));
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = InMemoryBackend::new();
        backend.fail_next(1);

        let err = backend.select_bookmarks("alice").await.unwrap_err();
        assert!(err.is_transient());
        assert!(backend.select_bookmarks("alice").await.is_ok());

        backend.set_offline(true);
        assert!(backend.select_bookmarks("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_failure_injection() {
        let backend = InMemoryBackend::new();
        backend.fail_after(2, 1);

        assert!(backend.select_bookmarks("alice").await.is_ok());
        assert!(backend.select_bookmarks("alice").await.is_ok());
        assert!(backend.select_bookmarks("alice").await.is_err());
        assert!(backend.select_bookmarks("alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_change_stream() {
        let backend = InMemoryBackend::new();
        let mut rx = backend.subscribe("alice").await.unwrap();

        let mut bookmark = Bookmark::new("alice", "A", "https://a.dev");
        backend.apply_external(bookmark.clone());
        bookmark.version = 2;
        backend.apply_external(bookmark.clone());
        backend.delete_external("alice", &bookmark.id, 3);

        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Insert);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.version, 2);
        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Delete);
        assert_eq!(backend.row_count(), 0);
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Server { status: 503, message: String::new() }.is_transient());
        assert!(!RemoteError::Server { status: 400, message: String::new() }.is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
    }
}
