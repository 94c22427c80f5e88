//! Sync Module - Offline-first bookmark synchronization
//!
//! Provides local-first bookmark sync against a hosted table:
//! - Durable mutation queue with per-operation backoff
//! - Version-guarded remote writes (strictly higher version wins)
//! - Batched full sync with progress and cancellation
//! - Push stream and connectivity driven orchestration
//!
//! Architecture:
//! - Local repository is the source of truth for reads
//! - Remote backend behind a trait (REST or in-memory)
//! - Remote version ledger per user for replay idempotence

pub mod api;
pub mod auth;
pub mod manager;
pub mod models;
pub mod queue;
pub mod remote;
pub mod service;

// Re-export commonly used types
pub use api::RestBackend;
pub use auth::{PrincipalProvider, StaticPrincipal};
pub use manager::SyncManager;
pub use models::{
    ChangeEvent, ChangeKind, DrainReport, OfflineQueueOperation, OperationType, QueueStats, SyncConfig,
    SyncPhase, SyncProgress, SyncReport, SyncState, SyncStatus,
};
pub use queue::{MutationQueue, QueueError};
pub use remote::{InMemoryBackend, RemoteBackend, RemoteError};
pub use service::{bookmarks_cache_key, SyncError, SyncService};
