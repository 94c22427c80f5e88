//! Offline Mutation Queue
//!
//! Buffers local writes while offline and hands them to the drain loop:
//! - Persisted as one JSON array in the key-value store
//! - FIFO by enqueue time; retries keep their original position
//! - Exponential backoff per operation (30 s base, capped at 1 h)
//! - Failed operations are requeued, never dropped

use super::models::{OfflineQueueOperation, QueueStats};
use crate::storage::{KeyValueStore, StorageError};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const QUEUE_KEY: &str = "sync:offline_queue";

/// Durable FIFO of pending mutations
#[derive(Clone)]
pub struct MutationQueue {
    store: Arc<dyn KeyValueStore>,
    lock: Arc<Mutex<()>>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self) -> Result<Vec<OfflineQueueOperation>, QueueError> {
        Ok(self
            .store
            .load::<Vec<OfflineQueueOperation>>(QUEUE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn persist(&self, ops: &[OfflineQueueOperation]) -> Result<(), QueueError> {
        Ok(self.store.save(QUEUE_KEY, ops).await?)
    }

    /// Append an operation
    pub async fn enqueue(&self, op: OfflineQueueOperation) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let mut ops = self.load().await?;

        log::info!(
            "Queueing {} of {} (version {})",
            op.op_type.as_str(),
            op.object_id,
            op.version
        );
        ops.push(op);
        self.persist(&ops).await
    }

    /// Snapshot of every operation in FIFO order
    pub async fn all(&self) -> Result<Vec<OfflineQueueOperation>, QueueError> {
        self.load().await
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.load().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Remove a completed operation
    pub async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let _guard = self.lock.lock().await;
        let mut ops = self.load().await?;
        let before = ops.len();

        ops.retain(|op| op.id != id);
        if ops.len() == before {
            return Ok(false);
        }

        self.persist(&ops).await?;
        Ok(true)
    }

    /// Requeue a failed operation in place with its next retry time
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<OfflineQueueOperation, QueueError> {
        let _guard = self.lock.lock().await;
        let mut ops = self.load().await?;

        let op = ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        op.record_failure(error);
        let updated = op.clone();

        self.persist(&ops).await?;

        if let Some(retry_time) = updated.next_retry_at {
            log::warn!(
                "Queued {} of {} failed: {} (attempt {}, next retry at {})",
                updated.op_type.as_str(),
                updated.object_id,
                error,
                updated.retry_count,
                retry_time
            );
        }
        Ok(updated)
    }

    /// Make every operation eligible right away
    pub async fn reset_backoff(&self) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().await;
        let mut ops = self.load().await?;

        let mut reset = 0;
        for op in ops.iter_mut().filter(|op| op.next_retry_at.is_some()) {
            op.next_retry_at = None;
            reset += 1;
        }

        if reset > 0 {
            self.persist(&ops).await?;
            log::info!("Reset backoff for {} queued operations", reset);
        }
        Ok(reset)
    }

    /// Whether any operation for `object_id` is queued
    pub async fn has_pending_for(&self, object_id: &str) -> Result<bool, QueueError> {
        Ok(self.load().await?.iter().any(|op| op.object_id == object_id))
    }

    /// Highest queued version for `object_id`
    pub async fn pending_version_for(&self, object_id: &str) -> Result<Option<i64>, QueueError> {
        Ok(self
            .load()
            .await?
            .iter()
            .filter(|op| op.object_id == object_id)
            .map(|op| op.version)
            .max())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let ops = self.load().await?;
        let failed = ops.iter().filter(|op| op.retry_count > 0).count();

        Ok(QueueStats {
            pending: ops.len() - failed,
            failed,
            total: ops.len(),
        })
    }

    pub async fn clear(&self) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().await;
        let count = self.load().await?.len();
        self.store.remove(QUEUE_KEY).await?;
        log::info!("Cleared {} queued operations", count);
        Ok(count)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue item not found: {0}")]
    ItemNotFound(String),
}

// ============================================================================
// Tests
// ============================================================================
