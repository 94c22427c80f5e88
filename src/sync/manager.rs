//! Sync Manager - Orchestrates bookmark synchronization
//!
//! Wires the sync service to its triggers and publishes status:
//! - Remote push stream of the signed-in user
//! - Connectivity changes (online triggers a drain and a due full resync)
//! - Status via `watch`, progress via `broadcast`
//! - Every running operation holds a child of one cancellable parent token

use super::models::{ChangeEvent, DrainReport, SyncProgress, SyncReport, SyncState, SyncStatus};
use super::service::{SyncError, SyncService};
use crate::models::Bookmark;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    service: SyncService,
    status: Arc<watch::Sender<SyncStatus>>,
    /// Parent of every running operation's token; replaced on cancel
    operations: Arc<StdMutex<CancellationToken>>,
    shutdown: Arc<StdMutex<CancellationToken>>,
    running: Arc<AtomicBool>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl SyncManager {
    pub fn new(service: SyncService) -> Self {
        let initial = SyncStatus {
            is_online: service.connectivity().is_online(),
            ..Default::default()
        };
        let (status, _rx) = watch::channel(initial);

        Self {
            service,
            status: Arc::new(status),
            operations: Arc::new(StdMutex::new(CancellationToken::new())),
            shutdown: Arc::new(StdMutex::new(CancellationToken::new())),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn service(&self) -> &SyncService {
        &self.service
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Subscribe to remote pushes and connectivity changes
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Sync manager already running");
            return Ok(());
        }

        let principal = match self.service.current_principal().await {
            Ok(principal) => principal,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        *lock(&self.shutdown) = shutdown.clone();
        let mut handles = Vec::new();

        match self.service.remote().subscribe(&principal.id).await {
            Ok(rx) => handles.push(tokio::spawn(self.clone().change_loop(rx, shutdown.clone()))),
            // Pull-based sync still works without pushes
            Err(e) => log::warn!("Remote change stream unavailable: {}", e),
        }

        let connectivity = self.service.connectivity().subscribe();
        handles.push(tokio::spawn(self.clone().connectivity_loop(connectivity, shutdown)));

        lock(&self.tasks).extend(handles);
        self.refresh_status().await;

        log::info!("Sync manager started for {}", principal.email);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        lock(&self.shutdown).cancel();
        self.cancel_sync();

        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::warn!("Sync task ended abnormally: {}", e);
                }
            }
        }

        log::info!("Sync manager stopped");
    }

    async fn change_loop(self, mut rx: broadcast::Receiver<ChangeEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.apply_remote_change(&event).await {
                            log::warn!("Failed to apply remote change to {}: {}", event.object_id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Missed {} remote changes, running full sync", missed);
                        if let Err(e) = self.sync_all_bookmarks().await {
                            log::warn!("Catch-up sync failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::info!("Remote change stream closed");
                        break;
                    }
                },
            }
        }
    }

    async fn connectivity_loop(self, mut rx: watch::Receiver<bool>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *rx.borrow_and_update();
                    self.on_connectivity_change(online).await;
                }
            }
        }
    }

    async fn on_connectivity_change(&self, online: bool) {
        self.status.send_modify(|status| status.is_online = online);
        if !online {
            return;
        }

        if let Err(e) = self.process_offline_queue().await {
            log::warn!("Queue drain after reconnect failed: {}", e);
        }

        match self.is_full_resync_due().await {
            Ok(true) => {
                if let Err(e) = self.sync_all_bookmarks().await {
                    log::warn!("Full resync after reconnect failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => log::debug!("Skipping resync check: {}", e),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Apply a pushed change for the signed-in user; other users are ignored
    pub async fn apply_remote_change(&self, event: &ChangeEvent) -> Result<bool, SyncError> {
        let principal = self.service.current_principal().await?;
        if event.user_id != principal.id {
            return Ok(false);
        }

        self.service.apply_pushed_change(event).await?;
        self.refresh_status().await;
        Ok(true)
    }

    /// Never synced, or the last full sync is older than the configured interval
    pub async fn is_full_resync_due(&self) -> Result<bool, SyncError> {
        let principal = self.service.current_principal().await?;
        let interval = Duration::hours(self.service.config().full_resync_interval_hours);

        Ok(match self.service.last_synced(&principal.id).await? {
            Some(last) => Utc::now() - last >= interval,
            None => true,
        })
    }

    pub async fn get_bookmarks(&self) -> Result<Vec<Bookmark>, SyncError> {
        self.service.cached_bookmarks(false).await
    }

    pub async fn sync_all_bookmarks(&self) -> Result<SyncReport, SyncError> {
        let token = self.begin_operation();
        let result = self.service.sync_all_bookmarks(&token).await;

        let state = match &result {
            Ok(report) if report.cancelled => SyncState::Idle,
            Ok(report) if report.is_success() => SyncState::Success,
            _ => SyncState::Error,
        };
        self.finish_operation(state).await;
        result
    }

    pub async fn process_offline_queue(&self) -> Result<DrainReport, SyncError> {
        let token = self.begin_operation();
        let result = self.service.process_offline_queue(&token).await;

        let state = match &result {
            Ok(report) if report.cancelled => SyncState::Idle,
            Ok(report) if report.failed == 0 => SyncState::Success,
            _ => SyncState::Error,
        };
        self.finish_operation(state).await;
        result
    }

    /// Cancel every running drain and full sync; later operations start uncancelled
    pub fn cancel_sync(&self) {
        let parent = std::mem::replace(&mut *lock(&self.operations), CancellationToken::new());
        log::info!("Cancelling running sync operations");
        parent.cancel();
    }

    fn begin_operation(&self) -> CancellationToken {
        let token = lock(&self.operations).child_token();
        self.status.send_modify(|status| status.status = SyncState::Syncing);
        token
    }

    async fn finish_operation(&self, state: SyncState) {
        self.status.send_modify(|status| status.status = state);
        self.refresh_status().await;
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.service.subscribe_progress()
    }

    /// Rebuild the derived fields from the queue and connectivity
    async fn refresh_status(&self) {
        let pending = match self.service.pending_changes().await {
            Ok(pending) => pending,
            Err(e) => {
                log::warn!("Failed to count pending changes: {}", e);
                self.status.borrow().pending_changes
            }
        };

        let last_synced = match self.service.current_principal().await {
            Ok(principal) => self.service.last_synced(&principal.id).await.unwrap_or_else(|e| {
                log::warn!("Failed to read last sync time: {}", e);
                None
            }),
            Err(_) => None,
        };

        let is_online = self.service.connectivity().is_online();
        self.status.send_modify(|status| {
            status.pending_changes = pending;
            status.last_synced = last_synced;
            status.is_online = is_online;
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::connectivity::Connectivity;
    use crate::models::{BookmarkDraft, Principal};
    use crate::storage::{KeyValueStore, MemoryKeyValueStore};
    use crate::sync::auth::StaticPrincipal;
    use crate::sync::models::{ChangeKind, SyncConfig};
    use crate::sync::remote::InMemoryBackend;
    use std::future::Future;

    const USER: &str = "user-1";

    fn principal() -> Principal {
        Principal {
            id: USER.to_string(),
            email: "ada@example.com".to_string(),
            display_name: "Ada".to_string(),
        }
    }

    fn create_manager(signed_in: bool) -> (SyncManager, Arc<InMemoryBackend>, Connectivity) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let connectivity = Connectivity::new(true);
        let cache = TieredCache::new(Arc::clone(&store), connectivity.clone());
        let backend = Arc::new(InMemoryBackend::new());
        let auth = Arc::new(StaticPrincipal::new(signed_in.then(principal)));

        let service = SyncService::new(
            backend.clone(),
            auth,
            store,
            cache,
            connectivity.clone(),
            SyncConfig::default(),
        );
        (SyncManager::new(service), backend, connectivity)
    }

    fn draft(title: &str) -> BookmarkDraft {
        BookmarkDraft {
            title: title.to_string(),
            url: format!("https://example.com/{}", title),
            ..Default::default()
        }
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_requires_principal() {
        let (manager, _, _) = create_manager(false);
        assert!(matches!(manager.start().await, Err(SyncError::Unauthenticated)));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_push_updates_local_copy() {
        let (manager, backend, _) = create_manager(true);
        manager.start().await.unwrap();

        let remote = Bookmark::new(USER, "pushed", "https://example.com/p");
        backend.apply_external(remote.clone());

        let service = manager.service().clone();
        assert!(
            eventually(|| {
                let service = service.clone();
                async move { service.local_bookmarks(USER).await.unwrap().len() == 1 }
            })
            .await
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_changes_for_other_users_are_ignored() {
        let (manager, _, _) = create_manager(true);
        let event = ChangeEvent {
            kind: ChangeKind::Insert,
            user_id: "someone-else".to_string(),
            object_id: "b1".to_string(),
            version: 1,
            record: Some(Bookmark::new("someone-else", "x", "https://x.dev")),
        };

        assert!(!manager.apply_remote_change(&event).await.unwrap());
        assert!(manager.service().local_bookmarks("someone-else").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue() {
        let (manager, backend, connectivity) = create_manager(true);
        manager.start().await.unwrap();

        connectivity.set_online(false);
        let created = manager.service().create_bookmark(draft("offline")).await.unwrap();
        assert!(backend.row(&created.id).is_none());

        connectivity.set_online(true);
        let id = created.id.clone();
        assert!(eventually(|| {
            let found = backend.row(&id).is_some();
            async move { found }
        })
        .await);

        let manager_ref = manager.clone();
        assert!(eventually(|| {
            let status = manager_ref.status();
            async move { status.pending_changes == 0 && status.is_online }
        })
        .await);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_full_resync_due() {
        let (manager, _, _) = create_manager(true);
        assert!(manager.is_full_resync_due().await.unwrap());

        manager.sync_all_bookmarks().await.unwrap();
        assert!(!manager.is_full_resync_due().await.unwrap());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (manager, _, _) = create_manager(true);
        let mut status_rx = manager.subscribe_status();
        assert_eq!(manager.status().status, SyncState::Idle);

        manager.service().create_bookmark(draft("a")).await.unwrap();
        manager.sync_all_bookmarks().await.unwrap();

        let status = manager.status();
        assert_eq!(status.status, SyncState::Success);
        assert_eq!(status.pending_changes, 0);
        assert!(status.last_synced.is_some());
        assert!(status_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_failed_drain_reports_error_state() {
        let (manager, backend, _) = create_manager(true);
        manager.service().create_bookmark(draft("a")).await.unwrap();

        backend.fail_next(1);
        let report = manager.process_offline_queue().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(manager.status().status, SyncState::Error);
        assert_eq!(manager.status().pending_changes, 1);
    }

    #[tokio::test]
    async fn test_cancel_reaches_every_running_operation() {
        let (manager, _, _) = create_manager(true);
        let drain = manager.begin_operation();
        let full_sync = manager.begin_operation();

        manager.cancel_sync();

        assert!(drain.is_cancelled());
        assert!(full_sync.is_cancelled());
        assert!(!manager.begin_operation().is_cancelled());
    }

    #[tokio::test]
    async fn test_get_bookmarks_reads_through_cache() {
        let (manager, backend, connectivity) = create_manager(true);
        backend.apply_external(Bookmark::new(USER, "remote", "https://example.com/r"));

        let first = manager.get_bookmarks().await.unwrap();
        assert_eq!(first.len(), 1);

        connectivity.set_online(false);
        let offline = manager.get_bookmarks().await.unwrap();
        assert_eq!(offline, first);
    }

    #[tokio::test]
    async fn test_stop_detaches_push_stream() {
        let (manager, backend, _) = create_manager(true);
        manager.start().await.unwrap();
        manager.stop().await;
        assert!(!manager.is_running());

        backend.apply_external(Bookmark::new(USER, "late", "https://example.com/l"));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(manager.service().local_bookmarks(USER).await.unwrap().is_empty());
    }
}
