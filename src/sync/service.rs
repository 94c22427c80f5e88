//! Bookmark Sync Service
//!
//! Local-first bookmark mutations with deferred remote replay:
//! - Mutations apply to the local repository and cache, then enqueue
//! - Drain replays the queue FIFO, one object blocked per failure
//! - Remote writes must carry a strictly higher version than the remote row
//! - Stale writes are dropped once the object is resynced from remote
//! - Full sync pushes in batches, then pulls and merges newer remote rows

use super::auth::PrincipalProvider;
use super::models::{
    ChangeEvent, ChangeKind, DrainReport, OfflineQueueOperation, OperationType, QueueStats, SyncConfig,
    SyncPhase, SyncProgress, SyncReport,
};
use super::queue::{MutationQueue, QueueError};
use super::remote::{RemoteBackend, RemoteError};
use crate::cache::{CacheError, CacheOptions, CachePriority, TieredCache};
use crate::connectivity::Connectivity;
use crate::models::{Bookmark, BookmarkDraft, BookmarkPatch, Principal};
use crate::storage::{KeyValueStore, ReclaimingStore, Repository, StorageError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Cache key holding the bookmark list of `user_id`
pub fn bookmarks_cache_key(user_id: &str) -> String {
    format!("bookmarks:{}", user_id)
}

fn ledger_key(user_id: &str) -> String {
    format!("sync:remote_versions:{}", user_id)
}

fn last_synced_key(user_id: &str) -> String {
    format!("sync:last_synced:{}", user_id)
}

/// Result of one guarded remote write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Applied,
    Stale { remote_version: i64 },
}

#[derive(Clone)]
pub struct SyncService {
    remote: Arc<dyn RemoteBackend>,
    auth: Arc<dyn PrincipalProvider>,
    store: Arc<dyn KeyValueStore>,
    cache: TieredCache,
    queue: MutationQueue,
    bookmarks: Repository<Bookmark>,
    connectivity: Connectivity,
    config: Arc<SyncConfig>,
    drain_lock: Arc<Mutex<()>>,
    ledger_lock: Arc<Mutex<()>>,
    progress: broadcast::Sender<SyncProgress>,
}

impl SyncService {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        auth: Arc<dyn PrincipalProvider>,
        store: Arc<dyn KeyValueStore>,
        cache: TieredCache,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        let (progress, _rx) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        // Queue, repository and ledger writes fall back on cache eviction
        let store: Arc<dyn KeyValueStore> = Arc::new(ReclaimingStore::new(store, Arc::new(cache.clone())));
        Self {
            queue: MutationQueue::new(Arc::clone(&store)),
            bookmarks: Repository::new(Arc::clone(&store)),
            remote,
            auth,
            store,
            cache,
            connectivity,
            config: Arc::new(config),
            drain_lock: Arc::new(Mutex::new(())),
            ledger_lock: Arc::new(Mutex::new(())),
            progress,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.remote
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub async fn current_principal(&self) -> Result<Principal, SyncError> {
        self.auth.current_user().await.ok_or(SyncError::Unauthenticated)
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    pub async fn create_bookmark(&self, draft: BookmarkDraft) -> Result<Bookmark, SyncError> {
        let principal = self.current_principal().await?;

        let mut bookmark = Bookmark::new(&principal.id, &draft.title, &draft.url);
        bookmark.description = draft.description;
        bookmark.tags = draft.tags;
        bookmark.folder = draft.folder;
        bookmark.favicon_url = draft.favicon_url;

        self.bookmarks.upsert(bookmark.clone()).await?;
        self.refresh_cache(&principal.id).await;

        let op = OfflineQueueOperation::new(
            OperationType::Create,
            &principal.id,
            &bookmark.id,
            bookmark.version,
            serde_json::to_value(&bookmark)?,
        );
        self.queue.enqueue(op).await?;

        Ok(bookmark)
    }

    pub async fn update_bookmark(&self, id: &str, patch: &BookmarkPatch) -> Result<Bookmark, SyncError> {
        let principal = self.current_principal().await?;

        let mut bookmark = self
            .bookmarks
            .get(&principal.id, id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        bookmark.apply(patch);

        self.bookmarks.upsert(bookmark.clone()).await?;
        self.refresh_cache(&principal.id).await;

        let op = OfflineQueueOperation::new(
            OperationType::Update,
            &principal.id,
            &bookmark.id,
            bookmark.version,
            serde_json::to_value(&bookmark)?,
        );
        self.queue.enqueue(op).await?;

        Ok(bookmark)
    }

    pub async fn delete_bookmark(&self, id: &str) -> Result<(), SyncError> {
        let principal = self.current_principal().await?;

        let removed = self
            .bookmarks
            .remove(&principal.id, id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        self.refresh_cache(&principal.id).await;

        let op = OfflineQueueOperation::new(
            OperationType::Delete,
            &principal.id,
            id,
            removed.version + 1,
            serde_json::json!({ "id": id }),
        );
        self.queue.enqueue(op).await?;

        Ok(())
    }

    /// Local bookmark list, newest first
    pub async fn local_bookmarks(&self, user_id: &str) -> Result<Vec<Bookmark>, SyncError> {
        Ok(self.bookmarks.all(user_id).await?)
    }

    fn cache_options(&self) -> CacheOptions {
        CacheOptions::default()
            .ttl_minutes(self.config.bookmarks_cache_ttl_minutes)
            .priority(CachePriority::High)
    }

    /// Mirror the local list into the cache; failures only cost a refetch
    async fn refresh_cache(&self, user_id: &str) {
        let bookmarks = match self.bookmarks.all(user_id).await {
            Ok(bookmarks) => bookmarks,
            Err(e) => {
                log::warn!("Failed to read bookmarks for cache refresh: {}", e);
                return;
            }
        };

        if let Err(e) = self
            .cache
            .set(&bookmarks_cache_key(user_id), &bookmarks, &self.cache_options())
            .await
        {
            log::warn!("Failed to refresh bookmark cache for {}: {}", user_id, e);
        }
    }

    /// Bookmarks of the signed-in user through the tiered cache
    pub async fn cached_bookmarks(&self, force_refresh: bool) -> Result<Vec<Bookmark>, SyncError> {
        let principal = self.current_principal().await?;
        let mut options = self.cache_options();
        if force_refresh {
            options = options.force_refresh();
        }

        let result = self
            .cache
            .get_data(
                &bookmarks_cache_key(&principal.id),
                || self.pull_and_merge(&principal.id),
                &options,
            )
            .await;

        match result {
            Ok(bookmarks) => Ok(bookmarks),
            // The local repository is still authoritative offline
            Err(CacheError::OfflineNoCache { .. }) => self.local_bookmarks(&principal.id).await,
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Queue drain
    // ========================================================================

    pub async fn pending_changes(&self) -> Result<usize, SyncError> {
        Ok(self.queue.len().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        Ok(self.queue.stats().await?)
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Replay queued mutations against the remote in FIFO order
    pub async fn process_offline_queue(&self, cancel: &CancellationToken) -> Result<DrainReport, SyncError> {
        if !self.connectivity.is_online() {
            log::debug!("Offline, skipping queue drain");
            return Ok(DrainReport::default());
        }

        let _guard = self.drain_lock.lock().await;
        let ops = self.queue.all().await?;
        if ops.is_empty() {
            return Ok(DrainReport::default());
        }

        log::info!("Draining {} queued operations", ops.len());
        let now = Utc::now();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut report = DrainReport::default();

        for op in ops {
            if cancel.is_cancelled() {
                log::info!("Queue drain cancelled");
                report.cancelled = true;
                break;
            }

            // Later operations on a blocked object must wait for it
            if blocked.contains(&op.object_id) || !op.is_ready_at(now) {
                blocked.insert(op.object_id.clone());
                report.deferred += 1;
                continue;
            }

            report.processed += 1;
            match self.apply_operation(&op).await {
                Ok(WriteOutcome::Applied) => {
                    self.queue.remove(&op.id).await?;
                    report.succeeded += 1;
                }
                Ok(WriteOutcome::Stale { remote_version }) => {
                    let conflict = SyncError::ConflictStale {
                        object_id: op.object_id.clone(),
                        local_version: op.version,
                        remote_version,
                    };
                    // The local edit stays queued until the remote row replaces it
                    match self.resync_object(&op.user_id, &op.object_id).await {
                        Ok(_) => {
                            log::warn!("Dropping queued {}: {}", op.op_type.as_str(), conflict);
                            self.queue.remove(&op.id).await?;
                            report.conflicts.push(op.object_id.clone());
                        }
                        Err(e) => {
                            log::warn!(
                                "Keeping queued {} after failed resync: {} ({})",
                                op.op_type.as_str(),
                                conflict,
                                e
                            );
                            self.queue.mark_failed(&op.id, &e.to_string()).await?;
                            blocked.insert(op.object_id.clone());
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    self.queue.mark_failed(&op.id, &e.to_string()).await?;
                    blocked.insert(op.object_id.clone());
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.queue.len().await?;
        log::info!(
            "Queue drain finished: {} succeeded, {} failed, {} deferred, {} conflicts, {} remaining",
            report.succeeded,
            report.failed,
            report.deferred,
            report.conflicts.len(),
            report.remaining
        );
        Ok(report)
    }

    async fn apply_operation(&self, op: &OfflineQueueOperation) -> Result<WriteOutcome, SyncError> {
        match op.op_type {
            OperationType::Create | OperationType::Update => {
                let mut bookmark = op.bookmark()?;
                bookmark.version = op.version;
                self.write_bookmark(&bookmark).await
            }
            OperationType::Delete => self.delete_remote(op).await,
        }
    }

    /// Insert or update guarded by the version rule
    async fn write_bookmark(&self, bookmark: &Bookmark) -> Result<WriteOutcome, SyncError> {
        let known = self.known_remote_version(&bookmark.user_id, &bookmark.id).await?;
        let remote = self.remote.fetch_bookmark(&bookmark.user_id, &bookmark.id).await?;
        let remote_version = remote.as_ref().map_or(0, |row| row.version).max(known);

        if bookmark.version <= remote_version {
            return Ok(WriteOutcome::Stale { remote_version });
        }

        if remote.is_some() {
            self.remote.update_bookmark(bookmark).await?;
        } else {
            self.remote.insert_bookmark(bookmark).await?;
        }

        self.record_remote_versions(&bookmark.user_id, [(bookmark.id.clone(), bookmark.version)])
            .await?;
        Ok(WriteOutcome::Applied)
    }

    async fn delete_remote(&self, op: &OfflineQueueOperation) -> Result<WriteOutcome, SyncError> {
        let known = self.known_remote_version(&op.user_id, &op.object_id).await?;
        let remote = self.remote.fetch_bookmark(&op.user_id, &op.object_id).await?;

        let Some(row) = remote else {
            log::debug!("{} already absent remotely", op.object_id);
            self.record_remote_versions(&op.user_id, [(op.object_id.clone(), op.version.max(known))])
                .await?;
            return Ok(WriteOutcome::Applied);
        };

        let remote_version = row.version.max(known);
        if op.version <= remote_version {
            return Ok(WriteOutcome::Stale { remote_version });
        }

        self.remote.delete_bookmark(&op.user_id, &op.object_id).await?;
        self.record_remote_versions(&op.user_id, [(op.object_id.clone(), op.version)])
            .await?;
        Ok(WriteOutcome::Applied)
    }

    /// Replace the local copy of one object with the remote row
    pub async fn resync_object(&self, user_id: &str, object_id: &str) -> Result<Option<Bookmark>, SyncError> {
        let remote = self.remote.fetch_bookmark(user_id, object_id).await?;

        match &remote {
            Some(row) => {
                self.bookmarks.upsert(row.clone()).await?;
                self.record_remote_versions(user_id, [(row.id.clone(), row.version)])
                    .await?;
                log::info!("Resynced {} from remote (version {})", object_id, row.version);
            }
            None => {
                self.bookmarks.remove(user_id, object_id).await?;
                log::info!("Resynced {}: deleted remotely", object_id);
            }
        }

        self.refresh_cache(user_id).await;
        Ok(remote)
    }

    // ========================================================================
    // Remote push
    // ========================================================================

    /// Apply a pushed remote change; the pushed version wins unless it is
    /// older than what the remote already acknowledged or what is queued locally
    pub async fn apply_pushed_change(&self, event: &ChangeEvent) -> Result<(), SyncError> {
        let user_id = event.user_id.as_str();

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let known = self.known_remote_version(user_id, &event.object_id).await?;
                let pending = self.queue.pending_version_for(&event.object_id).await?;
                if event.version < known || pending.is_some_and(|v| v > event.version) {
                    log::debug!(
                        "Ignoring late remote {:?} of {} (version {}, known {}, queued {:?})",
                        event.kind,
                        event.object_id,
                        event.version,
                        known,
                        pending
                    );
                    return Ok(());
                }

                let row = match &event.record {
                    Some(record) => Some(record.clone()),
                    None => self.bookmarks.get(user_id, &event.object_id).await?,
                };
                if let Some(mut row) = row {
                    row.version = event.version;
                    self.bookmarks.upsert(row).await?;
                }
                self.record_remote_versions(user_id, [(event.object_id.clone(), event.version)])
                    .await?;
            }
            ChangeKind::Delete => {
                self.bookmarks.remove(user_id, &event.object_id).await?;
                let known = self.known_remote_version(user_id, &event.object_id).await?;
                self.record_remote_versions(user_id, [(event.object_id.clone(), event.version.max(known))])
                    .await?;
            }
        }

        self.cache.invalidate(&bookmarks_cache_key(user_id)).await?;
        log::debug!(
            "Applied remote {:?} of {} (version {})",
            event.kind,
            event.object_id,
            event.version
        );
        Ok(())
    }

    // ========================================================================
    // Full sync
    // ========================================================================

    fn emit_progress(&self, phase: SyncPhase, processed: usize, total: usize) {
        // Nobody listening is fine
        let _ = self.progress.send(SyncProgress::new(phase, processed, total));
    }

    /// Push every unsynced local bookmark, then pull newer remote rows
    pub async fn sync_all_bookmarks(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let principal = self.current_principal().await?;
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        let user_id = principal.id.as_str();

        let mut report = SyncReport::default();
        self.emit_progress(SyncPhase::Draining, 0, 1);
        report.drain = self.process_offline_queue(cancel).await?;
        if report.drain.cancelled || cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        // Push
        let local = self.bookmarks.all(user_id).await?;
        let ledger = self.load_ledger(user_id).await?;
        let total = local.len();
        let batch_size = self.config.batch_size.max(1);
        let mut processed = 0;

        for batch in local.chunks(batch_size) {
            if cancel.is_cancelled() {
                log::info!("Bookmark sync cancelled after {} of {}", processed, total);
                report.cancelled = true;
                return Ok(report);
            }

            for bookmark in batch {
                let synced = ledger.get(&bookmark.id).map_or(false, |v| bookmark.version <= *v);
                if synced || self.queue.has_pending_for(&bookmark.id).await? {
                    continue;
                }

                match self.write_bookmark(bookmark).await {
                    Ok(WriteOutcome::Applied) => report.pushed += 1,
                    Ok(WriteOutcome::Stale { .. }) => {
                        if let Err(e) = self.resync_object(user_id, &bookmark.id).await {
                            report.errors.push(format!("{}: {}", bookmark.id, e));
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to push bookmark {}: {}", bookmark.id, e);
                        report.errors.push(format!("{}: {}", bookmark.id, e));
                    }
                }
            }

            processed += batch.len();
            report.batches += 1;
            self.emit_progress(SyncPhase::Pushing, processed, total);
        }

        // Pull
        self.emit_progress(SyncPhase::Pulling, 0, 1);
        match self.remote.select_bookmarks(user_id).await {
            Ok(rows) => {
                let (pulled, removed) = self.merge_remote(user_id, rows).await?;
                report.pulled = pulled;
                report.removed = removed;
            }
            Err(e) => {
                log::warn!("Failed to pull bookmarks: {}", e);
                report.errors.push(format!("pull: {}", e));
            }
        }

        self.refresh_cache(user_id).await;

        if report.errors.is_empty() {
            self.store.save(&last_synced_key(user_id), &Utc::now()).await?;
        }
        self.emit_progress(SyncPhase::Done, 1, 1);

        log::info!(
            "Bookmark sync finished: {} pushed, {} pulled, {} removed, {} errors",
            report.pushed,
            report.pulled,
            report.removed,
            report.errors.len()
        );
        Ok(report)
    }

    /// Fetch the remote list, merge it and return the local result
    pub async fn pull_and_merge(&self, user_id: &str) -> Result<Vec<Bookmark>, SyncError> {
        let rows = self.remote.select_bookmarks(user_id).await?;
        self.merge_remote(user_id, rows).await?;
        self.local_bookmarks(user_id).await
    }

    /// Adopt newer remote rows and drop rows deleted remotely
    async fn merge_remote(&self, user_id: &str, rows: Vec<Bookmark>) -> Result<(usize, usize), SyncError> {
        let local: HashMap<String, Bookmark> = self
            .bookmarks
            .all(user_id)
            .await?
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();
        let ledger = self.load_ledger(user_id).await?;

        let mut pulled = 0;
        let mut seen = HashSet::new();
        let mut versions = Vec::with_capacity(rows.len());

        for row in rows {
            seen.insert(row.id.clone());
            versions.push((row.id.clone(), row.version));

            let newer = local.get(&row.id).map_or(true, |l| row.version > l.version);
            if newer {
                self.bookmarks.upsert(row).await?;
                pulled += 1;
            }
        }

        let mut removed = 0;
        for (id, bookmark) in &local {
            if seen.contains(id) {
                continue;
            }
            // Only objects the remote has acknowledged can have been deleted there
            let acknowledged = ledger.get(id).map_or(false, |v| bookmark.version <= *v);
            if acknowledged && !self.queue.has_pending_for(id).await? {
                self.bookmarks.remove(user_id, id).await?;
                removed += 1;
            }
        }

        self.record_remote_versions(user_id, versions).await?;
        Ok((pulled, removed))
    }

    pub async fn last_synced(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.store.load(&last_synced_key(user_id)).await?)
    }

    // ========================================================================
    // Remote version ledger
    // ========================================================================

    async fn load_ledger(&self, user_id: &str) -> Result<HashMap<String, i64>, SyncError> {
        Ok(self.store.load(&ledger_key(user_id)).await?.unwrap_or_default())
    }

    /// Last remote version seen for `object_id`, 0 when unknown
    pub async fn known_remote_version(&self, user_id: &str, object_id: &str) -> Result<i64, SyncError> {
        Ok(self.load_ledger(user_id).await?.get(object_id).copied().unwrap_or(0))
    }

    async fn record_remote_versions(
        &self,
        user_id: &str,
        versions: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<(), SyncError> {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = self.load_ledger(user_id).await?;
        ledger.extend(versions);
        self.store.save(&ledger_key(user_id), &ledger).await?;
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Not signed in")]
    Unauthenticated,

    #[error("Bookmark not found: {0}")]
    NotFound(String),

    #[error("Stale write to {object_id}: local version {local_version}, remote version {remote_version}")]
    ConflictStale {
        object_id: String,
        local_version: i64,
        remote_version: i64,
    },

    #[error("Offline")]
    Offline,

    #[error("Remote request failed: {0}")]
    TransientNetwork(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Offline => true,
            SyncError::TransientNetwork(e) => e.is_transient(),
            _ => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
