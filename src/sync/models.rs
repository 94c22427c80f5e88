//! Sync Data Models
//!
//! Defines the structures shared by the mutation queue, the sync service and
//! the orchestrator:
//! - OfflineQueueOperation: one buffered local write
//! - SyncStatus / SyncProgress: UI-facing state
//! - ChangeEvent: remote push notification
//! - DrainReport / SyncReport: outcome of a drain or full sync

use crate::models::Bookmark;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30; // Initial retry delay: 30 seconds
const MAX_DELAY_SECS: i64 = 3600; // Max retry delay: 1 hour

// ============================================================================
// Configuration
// ============================================================================

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Objects pushed per batch during a full sync
    pub batch_size: usize,
    /// Full resync when the last one is older than this
    pub full_resync_interval_hours: i64,
    pub bookmarks_cache_ttl_minutes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            full_resync_interval_hours: 24,
            bookmarks_cache_ttl_minutes: 60,
        }
    }
}

// ============================================================================
// Offline Queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One buffered local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Full object for create/update, `{"id": ..}` for delete
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub object_id: String,
    pub user_id: String,
    /// Object version this operation writes
    pub version: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OfflineQueueOperation {
    pub fn new(op_type: OperationType, user_id: &str, object_id: &str, version: i64, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            data,
            timestamp: Utc::now(),
            object_id: object_id.to_string(),
            user_id: user_id.to_string(),
            version,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    /// Check if the operation may be attempted at `now`
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |next| now >= next)
    }

    /// Delay before the next attempt: 30 s doubling per failure, capped at 1 h
    pub fn backoff_delay(retry_count: u32) -> Duration {
        let exp = retry_count.min(16);
        let delay_secs = (BASE_DELAY_SECS * 2_i64.pow(exp)).min(MAX_DELAY_SECS);
        Duration::seconds(delay_secs)
    }

    /// Record a failure and schedule the next attempt
    pub fn record_failure(&mut self, error: &str) {
        let delay = Self::backoff_delay(self.retry_count);
        self.retry_count += 1;
        self.next_retry_at = Some(Utc::now() + delay);
        self.last_error = Some(error.to_string());
    }

    pub fn bookmark(&self) -> Result<Bookmark, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Never attempted
    pub pending: usize,
    /// Failed at least once
    pub failed: usize,
    pub total: usize,
}

// ============================================================================
// Status
// ============================================================================

/// Current sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
    Success,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
            SyncState::Success => "success",
        }
    }
}

/// UI-facing sync status; rebuilt from the queue and the connectivity signal
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: SyncState,
    pub last_synced: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub is_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Draining,
    Pushing,
    Pulling,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub processed: usize,
    pub total: usize,
    /// 0-100
    pub percent: u8,
}

impl SyncProgress {
    pub fn new(phase: SyncPhase, processed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((processed.min(total) * 100) / total) as u8
        };
        Self {
            phase,
            processed,
            total,
            percent,
        }
    }
}

// ============================================================================
// Remote Changes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Push notification for one remote row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub user_id: String,
    pub object_id: String,
    pub version: i64,
    /// New row for inserts and updates
    pub record: Option<Bookmark>,
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one queue drain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Skipped because of backoff or an earlier failure on the same object
    pub deferred: usize,
    /// Object ids whose queued write was stale and that were resynced
    pub conflicts: Vec<String>,
    pub remaining: usize,
    pub cancelled: bool,
}

/// Outcome of a full bookmark sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub drain: DrainReport,
    pub pushed: usize,
    pub pulled: usize,
    pub removed: usize,
    pub batches: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}
