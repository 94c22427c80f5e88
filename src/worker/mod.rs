//! Request Interception Worker
//!
//! Background worker that answers intercepted fetches through named caches:
//! - install: pre-cache the app shell into the static cache
//! - activate: drop caches from other versions, then claim clients
//! - fetch: network-first for API calls, stale-while-revalidate for HTML,
//!   cache-first for static assets
//! - messages: `SKIP_WAITING`, `CLEAR_CACHE`; clients hear `CACHE_CLEARED`
//!   and `ONLINE_STATUS_UPDATE`
//!
//! Nothing in memory is relied on across events; the named caches are the
//! only durable state.

mod cache_storage;
mod network;
mod request;
pub mod strategy;

pub use cache_storage::{CacheStorage, CacheStorageError, NoopCacheStorage, SqliteCacheStorage};
pub use network::{FetchError, HttpNetwork, Network};
pub use request::{Request, RequestDestination, RequestMode, Response};

use crate::connectivity::Connectivity;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strategy::{HostRules, RequestClass};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

const CACHE_PREFIX: &str = "tabkeep";
const CLIENT_CHANNEL_CAPACITY: usize = 32;

/// Interception worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Cache version tag; caches of any other version are deleted on activate
    pub version: String,

    /// Origin the app shell paths are resolved against
    pub origin: String,

    /// Paths pre-cached on install
    pub app_shell: Vec<String>,

    /// Path of the offline page (part of the app shell)
    pub offline_page: String,

    /// Regular expressions matched against request hosts to detect API calls
    pub api_host_patterns: Vec<String>,

    /// Path prefixes never intercepted
    pub excluded_paths: Vec<String>,

    /// Regular expressions matched against request hosts that always go to the network
    pub excluded_host_patterns: Vec<String>,

    /// Network timeout (seconds)
    pub network_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            origin: "http://localhost:3000".to_string(),
            app_shell: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/offline.html".to_string(),
                "/manifest.json".to_string(),
            ],
            offline_page: "/offline.html".to_string(),
            api_host_patterns: vec![r"^generativelanguage\.googleapis\.com$".to_string()],
            excluded_paths: vec!["/auth/".to_string(), "/webhooks/".to_string()],
            excluded_host_patterns: vec![r"\.supabase\.co$".to_string()],
            network_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn static_cache(&self) -> String {
        format!("{}-static-{}", CACHE_PREFIX, self.version)
    }

    pub fn dynamic_cache(&self) -> String {
        format!("{}-dynamic-{}", CACHE_PREFIX, self.version)
    }

    pub fn api_cache(&self) -> String {
        format!("{}-api-{}", CACHE_PREFIX, self.version)
    }

    pub fn current_caches(&self) -> [String; 3] {
        [self.static_cache(), self.dynamic_cache(), self.api_cache()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting for activation
    Installed,
    Activating,
    Activated,
    Redundant,
}

/// Messages from pages to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
    ClearCache,
}

/// Broadcasts from the worker to every page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    CacheCleared,
    OnlineStatusUpdate {
        #[serde(rename = "isOnline")]
        is_online: bool,
    },
    Activated { version: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub cached: usize,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct ServiceWorker {
    config: Arc<WorkerConfig>,
    origin: Url,
    hosts: Arc<HostRules>,
    network: Arc<dyn Network>,
    caches: Arc<dyn CacheStorage>,
    connectivity: Connectivity,
    state: Arc<RwLock<WorkerState>>,
    clients: broadcast::Sender<ClientMessage>,
}

impl ServiceWorker {
    pub fn new(
        config: WorkerConfig,
        network: Arc<dyn Network>,
        caches: Arc<dyn CacheStorage>,
        connectivity: Connectivity,
    ) -> Result<Self, WorkerError> {
        let origin = Url::parse(&config.origin)?;
        let hosts = HostRules {
            api: compile_patterns(&config.api_host_patterns)?,
            excluded: compile_patterns(&config.excluded_host_patterns)?,
        };
        let (clients, _rx) = broadcast::channel(CLIENT_CHANNEL_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            origin,
            hosts: Arc::new(hosts),
            network,
            caches,
            connectivity,
            state: Arc::new(RwLock::new(WorkerState::Parsed)),
            clients,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn is_available(&self) -> bool {
        self.caches.is_available()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
        self.clients.subscribe()
    }

    fn broadcast(&self, message: ClientMessage) {
        // No clients is fine
        let _ = self.clients.send(message);
    }

    fn resolve(&self, path: &str) -> Result<Request, WorkerError> {
        Ok(Request::get(self.origin.join(path)?.as_str())?)
    }

    /// Pre-cache the app shell; individual failures are reported, not fatal
    pub async fn install(&self) -> Result<InstallReport, WorkerError> {
        *self.state.write().await = WorkerState::Installing;
        log::info!("Installing worker {}", self.config.version);

        let mut report = InstallReport::default();
        if !self.caches.is_available() {
            log::warn!("Cache storage unavailable, skipping app shell pre-cache");
            *self.state.write().await = WorkerState::Installed;
            return Ok(report);
        }

        let static_cache = self.config.static_cache();
        for path in &self.config.app_shell {
            let request = self.resolve(path)?;
            match self.network.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    match self.caches.put(&static_cache, &request, &response).await {
                        Ok(()) => report.cached += 1,
                        Err(e) => {
                            log::warn!("Failed to pre-cache {}: {}", path, e);
                            report.failed.push(path.clone());
                        }
                    }
                }
                Ok(response) => {
                    log::warn!("Failed to pre-cache {}: status {}", path, response.status);
                    report.failed.push(path.clone());
                }
                Err(e) => {
                    log::warn!("Failed to pre-cache {}: {}", path, e);
                    report.failed.push(path.clone());
                }
            }
        }

        *self.state.write().await = WorkerState::Installed;
        log::info!(
            "Worker installed: {} cached, {} failed",
            report.cached,
            report.failed.len()
        );
        Ok(report)
    }

    /// Delete caches of other versions, then claim clients
    pub async fn activate(&self) -> Result<Vec<String>, WorkerError> {
        {
            let mut state = self.state.write().await;
            match *state {
                WorkerState::Installed => *state = WorkerState::Activating,
                WorkerState::Activated => return Ok(Vec::new()),
                other => return Err(WorkerError::InvalidState(other)),
            }
        }

        let current = self.config.current_caches();
        let mut deleted = Vec::new();
        for name in self.caches.names().await? {
            if current.contains(&name) {
                continue;
            }
            if self.caches.delete(&name).await? {
                log::info!("Deleted stale cache {}", name);
                deleted.push(name);
            }
        }

        *self.state.write().await = WorkerState::Activated;
        self.broadcast(ClientMessage::Activated {
            version: self.config.version.clone(),
        });
        log::info!("Worker {} activated", self.config.version);
        Ok(deleted)
    }

    /// Answer an intercepted request; always produces a response
    pub async fn handle_fetch(&self, request: &Request) -> Response {
        let network = self.network.as_ref();

        if self.state().await != WorkerState::Activated || !self.caches.is_available() {
            return strategy::network_only(network, request).await;
        }

        let caches = self.caches.as_ref();
        match strategy::classify(request, &self.config, &self.hosts) {
            RequestClass::Bypass => strategy::network_only(network, request).await,
            RequestClass::Api => {
                strategy::network_first(network, caches, &self.config.api_cache(), request).await
            }
            RequestClass::Navigation => {
                let offline_page = match self.resolve(&self.config.offline_page) {
                    Ok(page) => page,
                    Err(e) => {
                        log::error!("Invalid offline page path: {}", e);
                        return strategy::fallback_offline_page();
                    }
                };
                strategy::stale_while_revalidate(
                    self.network.clone(),
                    self.caches.clone(),
                    &self.config.dynamic_cache(),
                    &offline_page,
                    request,
                )
                .await
            }
            RequestClass::Static => {
                strategy::cache_first(network, caches, &self.config.dynamic_cache(), request).await
            }
        }
    }

    pub async fn handle_message(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        match message {
            WorkerMessage::SkipWaiting => {
                if self.state().await == WorkerState::Installed {
                    self.activate().await?;
                }
                Ok(())
            }
            WorkerMessage::ClearCache => {
                self.clear_caches().await?;
                Ok(())
            }
        }
    }

    /// Flush every named cache and tell the clients
    pub async fn clear_caches(&self) -> Result<usize, WorkerError> {
        let mut cleared = 0;
        for name in self.caches.names().await? {
            if self.caches.delete(&name).await? {
                cleared += 1;
            }
        }

        log::info!("Cleared {} named caches", cleared);
        self.broadcast(ClientMessage::CacheCleared);
        Ok(cleared)
    }

    pub fn set_online_status(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Relay connectivity changes to clients until `cancel` fires
    pub fn spawn_status_relay(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.connectivity.subscribe();
        let clients = self.clients.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_online = *rx.borrow_and_update();
                        let _ = clients.send(ClientMessage::OnlineStatusUpdate { is_online });
                    }
                }
            }
        })
    }

    pub async fn mark_redundant(&self) {
        *self.state.write().await = WorkerState::Redundant;
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, WorkerError> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(|e| WorkerError::InvalidPattern(format!("{}: {}", pattern, e))))
        .collect()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid API host pattern: {0}")]
    InvalidPattern(String),

    #[error("Cannot activate from state {0:?}")]
    InvalidState(WorkerState),

    #[error("Cache storage error: {0}")]
    CacheStorage(#[from] CacheStorageError),
}

// ============================================================================
// Tests
// ============================================================================
