//! # Tabkeep
//!
//! Offline-first caching and synchronization engine for a bookmarks app.
//!
//! The `Engine` wires the modules together:
//! - `storage` + `cache`: tiered cache over a quota-limited key-value store
//! - `sync`: local-first bookmark mutations, offline queue, remote reconciliation
//! - `scheduler`: alarm-backed periodic maintenance (`CLEANUP`, `SYNC_QUEUE`)
//! - `worker`: request interception with per-route caching strategies
//!
//! UI-facing operations return `bool` and report their outcome as a
//! `Notification` on a broadcast channel.

pub mod ai;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod models;
pub mod platform;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod worker;

use cache::{CacheInfo, TieredCache};
use config::{ConfigError, EngineConfig};
use connectivity::Connectivity;
use db::{Database, DbError};
use platform::Capabilities;
use scheduler::{handler_fn, MaintenanceConfig, ScheduleOptions, ScheduledTask, SchedulerError, TaskScheduler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use storage::{KeyValueStore, SqliteKeyValueStore};
use sync::{
    InMemoryBackend, RemoteBackend, RemoteError, RestBackend, StaticPrincipal, SyncError, SyncManager,
    SyncService, SyncStatus,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{FetchError, HttpNetwork, ServiceWorker, WorkerError};

/// Purges expired cache entries
pub const TASK_CLEANUP: &str = "CLEANUP";
/// Drains the offline mutation queue
pub const TASK_SYNC_QUEUE: &str = "SYNC_QUEUE";

// Fixed ids so a restart replaces the maintenance alarms instead of stacking them
const CLEANUP_TASK_ID: &str = "maintenance-cleanup";
const SYNC_QUEUE_TASK_ID: &str = "maintenance-sync-queue";

const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Notifications & Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// User-visible outcome of an engine operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_active: bool,
    pub status: SyncStatus,
    pub pending_tasks: Vec<ScheduledTask>,
    pub cache_info: Option<CacheInfo>,
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    db: Database,
    store: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    cache: TieredCache,
    scheduler: TaskScheduler,
    sync: SyncManager,
    worker: ServiceWorker,
    auth: Arc<StaticPrincipal>,
    notifications: broadcast::Sender<Notification>,
    active: Arc<AtomicBool>,
    shutdown: Arc<StdMutex<CancellationToken>>,
    background: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl Engine {
    /// Open the database under `config.data_dir` and pick the remote backend
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.database_path();
        log::info!("Database path: {:?}", db_path);
        let db = Database::new(db_path)?;

        let remote: Arc<dyn RemoteBackend> = match (&config.remote.url, &config.remote.api_key) {
            (Some(url), Some(api_key)) => Arc::new(RestBackend::new(
                url,
                api_key,
                Duration::from_secs(config.remote.poll_interval_secs),
            )?),
            _ => {
                log::warn!("No remote configured, bookmarks stay on this device");
                Arc::new(InMemoryBackend::new())
            }
        };

        Self::with_parts(config, db, remote)
    }

    /// Assemble an engine over an existing database and remote
    pub fn with_parts(
        config: EngineConfig,
        db: Database,
        remote: Arc<dyn RemoteBackend>,
    ) -> Result<Self, EngineError> {
        let capabilities = Capabilities::detect(&config, &db);
        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteKeyValueStore::with_quota(db.clone(), config.storage_quota_bytes));
        let connectivity = Connectivity::new(true);
        let cache = TieredCache::with_config(Arc::clone(&store), connectivity.clone(), config.cache.clone());

        let auth = Arc::new(StaticPrincipal::new(config.principal.clone()));
        let service = SyncService::new(
            remote,
            auth.clone(),
            Arc::clone(&store),
            cache.clone(),
            connectivity.clone(),
            config.sync.clone(),
        );

        let network = HttpNetwork::new(Duration::from_secs(config.worker.network_timeout_secs))?;
        let worker = ServiceWorker::new(
            config.worker.clone(),
            Arc::new(network),
            capabilities.cache_storage.clone(),
            connectivity.clone(),
        )?;

        let (notifications, _rx) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            db,
            store,
            connectivity,
            cache,
            scheduler: TaskScheduler::new(capabilities.alarms),
            sync: SyncManager::new(service),
            worker,
            auth,
            notifications,
            active: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(StdMutex::new(CancellationToken::new())),
            background: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn worker(&self) -> &ServiceWorker {
        &self.worker
    }

    pub fn auth(&self) -> &StaticPrincipal {
        &self.auth
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NotificationLevel::Error => log::error!("{}", message),
            _ => log::info!("{}", message),
        }
        // No subscribers is fine
        let _ = self.notifications.send(Notification { level, message });
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self) -> Result<(), EngineError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        *lock(&self.shutdown) = shutdown.clone();

        self.register_handlers().await;
        if self.scheduler.is_available() {
            if let Err(e) = self.scheduler.start().await {
                self.active.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            self.schedule_maintenance().await;
        } else {
            log::warn!("Alarms unavailable, periodic maintenance disabled");
        }

        match self.sync.start().await {
            Ok(()) => {}
            Err(SyncError::Unauthenticated) => log::info!("No signed-in user, sync idle"),
            Err(e) => log::warn!("Sync manager failed to start: {}", e),
        }

        let mut handles = Vec::new();
        if let Some(url) = &self.config.probe_url {
            handles.push(self.connectivity.spawn_probe(
                url.clone(),
                Duration::from_secs(self.config.probe_interval_secs),
                shutdown.child_token(),
            ));
        }

        if self.worker.is_available() {
            handles.push(self.worker.spawn_status_relay(shutdown.child_token()));
            let worker = self.worker.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.install().await {
                    log::error!("Worker install failed: {}", e);
                    return;
                }
                match worker.activate().await {
                    Ok(deleted) if !deleted.is_empty() => {
                        log::info!("Deleted outdated caches: {:?}", deleted)
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Worker activation failed: {}", e),
                }
            }));
        }
        lock(&self.background).extend(handles);

        self.notify(NotificationLevel::Info, "Tabkeep engine started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        lock(&self.shutdown).cancel();
        self.sync.stop().await;
        if self.scheduler.is_running() {
            if let Err(e) = self.scheduler.stop().await {
                log::warn!("Failed to stop scheduler: {}", e);
            }
        }

        let handles: Vec<_> = lock(&self.background).drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        log::info!("Tabkeep engine stopped");
    }

    async fn register_handlers(&self) {
        let cache = self.cache.clone();
        let db = self.db.clone();
        let maintenance = self.config.maintenance.clone();
        self.scheduler
            .register_handler(
                TASK_CLEANUP,
                handler_fn(move |_data| {
                    let cache = cache.clone();
                    let db = db.clone();
                    let maintenance = maintenance.clone();
                    async move { run_cleanup(&cache, &db, &maintenance).await.map(|_| ()) }
                }),
            )
            .await;

        let sync = self.sync.clone();
        self.scheduler
            .register_handler(
                TASK_SYNC_QUEUE,
                handler_fn(move |_data| {
                    let sync = sync.clone();
                    async move {
                        sync.process_offline_queue()
                            .await
                            .map(|_| ())
                            .map_err(|e| e.to_string())
                    }
                }),
            )
            .await;
    }

    async fn schedule_maintenance(&self) {
        let maintenance = match MaintenanceConfig::load_or(&self.db, &self.config.maintenance) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load maintenance schedule, using defaults: {}", e);
                self.config.maintenance.clone()
            }
        };
        if !maintenance.enabled {
            log::info!("Periodic maintenance disabled");
            return;
        }
        if let Err(e) = maintenance.validate() {
            log::warn!("Invalid maintenance schedule: {}", e);
            return;
        }

        let periodic = [
            (TASK_CLEANUP, CLEANUP_TASK_ID, maintenance.cleanup_interval_minutes),
            (TASK_SYNC_QUEUE, SYNC_QUEUE_TASK_ID, maintenance.queue_drain_interval_minutes),
        ];
        for (task_type, id, minutes) in periodic {
            let options = ScheduleOptions::period(minutes as f64).with_id(id);
            if self.scheduler.schedule_task(task_type, Value::Null, options).await.is_none() {
                log::warn!("Failed to schedule {} every {} minutes", task_type, minutes);
            }
        }
    }

    // ========================================================================
    // UI-facing operations
    // ========================================================================

    pub async fn status(&self) -> EngineStatus {
        let cache_info = match self.cache.info().await {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("Failed to read cache info: {}", e);
                None
            }
        };

        EngineStatus {
            is_active: self.is_active(),
            status: self.sync.status(),
            pending_tasks: self.scheduler.pending_tasks().await,
            cache_info,
        }
    }

    pub async fn schedule_task(&self, task_type: &str, data: Value, options: ScheduleOptions) -> bool {
        match self.scheduler.schedule_task(task_type, data, options).await {
            Some(task) => {
                self.notify(NotificationLevel::Success, format!("Scheduled {} ({})", task_type, task.id));
                true
            }
            None => {
                self.notify(NotificationLevel::Error, format!("Could not schedule {}", task_type));
                false
            }
        }
    }

    /// Run the maintenance tasks now instead of waiting for their alarms
    pub async fn process_tasks(&self) -> bool {
        let drained = self.sync.process_offline_queue().await;
        let cleaned = run_cleanup(&self.cache, &self.db, &self.config.maintenance).await;

        match (drained, cleaned) {
            (Ok(drain), Ok(purged)) => {
                self.notify(
                    NotificationLevel::Success,
                    format!(
                        "Processed {} queued changes, purged {} expired entries",
                        drain.succeeded, purged
                    ),
                );
                true
            }
            (Err(e), _) => {
                self.notify(NotificationLevel::Error, format!("Offline queue failed: {}", e));
                false
            }
            (_, Err(e)) => {
                self.notify(NotificationLevel::Error, format!("Cache cleanup failed: {}", e));
                false
            }
        }
    }

    /// Flush the tiered cache and every named worker cache
    pub async fn clear_cache(&self) -> bool {
        let entries = match self.cache.clear().await {
            Ok(n) => n,
            Err(e) => {
                self.notify(NotificationLevel::Error, format!("Failed to clear cache: {}", e));
                return false;
            }
        };

        let mut named = 0;
        if self.worker.is_available() {
            match self.worker.clear_caches().await {
                Ok(n) => named = n,
                Err(e) => {
                    self.notify(NotificationLevel::Error, format!("Failed to clear worker caches: {}", e));
                    return false;
                }
            }
        }

        self.notify(
            NotificationLevel::Success,
            format!("Cleared {} cache entries and {} named caches", entries, named),
        );
        true
    }

    pub async fn sync_all_bookmarks(&self) -> bool {
        match self.sync.sync_all_bookmarks().await {
            Ok(report) if report.is_success() => {
                self.notify(
                    NotificationLevel::Success,
                    format!("Synced bookmarks: {} pushed, {} pulled", report.pushed, report.pulled),
                );
                true
            }
            Ok(report) if report.cancelled => {
                self.notify(NotificationLevel::Info, "Bookmark sync cancelled");
                false
            }
            Ok(report) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Bookmark sync finished with {} errors", report.errors.len()),
                );
                false
            }
            Err(e) => {
                self.notify(NotificationLevel::Error, format!("Bookmark sync failed: {}", e));
                false
            }
        }
    }
}

async fn run_cleanup(
    cache: &TieredCache,
    db: &Database,
    maintenance: &MaintenanceConfig,
) -> Result<usize, String> {
    let purged = cache.cleanup_expired().await.map_err(|e| e.to_string())?;
    MaintenanceConfig::touch(db, maintenance).map_err(|e| e.to_string())?;
    Ok(purged)
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

// ============================================================================
// Entry point
// ============================================================================

/// Run the engine until Ctrl+C
pub async fn run() -> Result<(), EngineError> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from_env()?;
    let engine = Engine::new(config)?;
    engine.start().await?;
    log::info!("Tabkeep running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    engine.stop().await;
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
