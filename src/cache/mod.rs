//! Tiered object cache
//!
//! Two tiers with per-entry TTL, version and priority metadata:
//! - Memory tier: moka future cache with per-entry expiry and a capacity bound
//! - Persistent tier: the host key-value store (`cache:<key>`), survives restarts
//! - Remembered failures suppress retry storms for a short window
//! - Quota pressure evicts expired entries first, then by priority and age
//!
//! The memory tier is only ever a copy of the persistent tier. Write-backs
//! hold the invalidation gate shared and invalidations hold it exclusively,
//! so no write started before an invalidation lands after it.

mod entry;

pub use entry::{CacheEntry, CachePriority, CacheSource};

use crate::connectivity::Connectivity;
use crate::storage::{KeyValueStore, SpaceReclaimer, StorageError};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const STORE_PREFIX: &str = "cache:";

/// Length of the hex digest kept in prompt keys
const PROMPT_HASH_LEN: usize = 16;

/// Tiered cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in the memory tier
    pub memory_capacity: u64,

    /// TTL used when `CacheOptions::ttl` is left at its default (minutes)
    pub default_ttl_minutes: u64,

    /// Lifetime of a remembered failure (minutes)
    pub error_ttl_minutes: u64,

    /// Version tag applied when a call does not pass one
    pub default_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1000,
            default_ttl_minutes: 60,
            error_ttl_minutes: 5,
            default_version: "1".to_string(),
        }
    }
}

/// Per-call options for `get_data` and `set`
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// `None` uses the configured default TTL
    pub ttl: Option<Duration>,
    pub priority: CachePriority,
    /// Skip the lookup and always fetch
    pub force_refresh: bool,
    /// Mirror the entry into the memory tier
    pub cache_in_memory: bool,
    /// Remember fetch failures for the error TTL
    pub cache_errors: bool,
    /// Cache-busting tag; a mismatch is a miss
    pub version: Option<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            priority: CachePriority::Normal,
            force_refresh: false,
            cache_in_memory: true,
            cache_errors: false,
            version: None,
        }
    }
}

impl CacheOptions {
    pub fn ttl_minutes(mut self, minutes: u64) -> Self {
        self.ttl = Some(Duration::from_secs(minutes * 60));
        self
    }

    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn cache_errors(mut self) -> Self {
        self.cache_errors = true;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Per-entry expiry for the memory tier
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        value.remaining_ttl()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining_ttl()
    }
}

enum Lookup {
    Hit(CacheEntry),
    Failure(String),
    Miss,
}

/// Memory + persistent cache keyed by opaque strings
#[derive(Clone)]
pub struct TieredCache {
    memory: Arc<Cache<String, CacheEntry>>,
    store: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    config: Arc<CacheConfig>,
    /// Bumped by every invalidation; fetches started under an older epoch do not write back
    epoch: Arc<AtomicU64>,
    gate: Arc<RwLock<()>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl TieredCache {
    pub fn new(store: Arc<dyn KeyValueStore>, connectivity: Connectivity) -> Self {
        Self::with_config(store, connectivity, CacheConfig::default())
    }

    pub fn with_config(store: Arc<dyn KeyValueStore>, connectivity: Connectivity, config: CacheConfig) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.memory_capacity)
            .expire_after(EntryExpiry)
            .support_invalidation_closures()
            .build();

        Self {
            memory: Arc::new(memory),
            store,
            connectivity,
            config: Arc::new(config),
            epoch: Arc::new(AtomicU64::new(0)),
            gate: Arc::new(RwLock::new(())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn store_key(key: &str) -> String {
        format!("{}{}", STORE_PREFIX, key)
    }

    fn requested_version<'a>(&'a self, options: &'a CacheOptions) -> &'a str {
        options
            .version
            .as_deref()
            .unwrap_or(self.config.default_version.as_str())
    }

    fn ttl_for(&self, options: &CacheOptions) -> Duration {
        options
            .ttl
            .unwrap_or(Duration::from_secs(self.config.default_ttl_minutes * 60))
    }

    /// Return a usable cached value or fetch, store and return a fresh one
    pub async fn get_data<T, F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
        options: &CacheOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let version = self.requested_version(options).to_string();
        let online = self.connectivity.is_online();

        // Offline force-refresh still serves whatever is usable
        if !options.force_refresh || !online {
            match self.lookup(key, &version).await? {
                Lookup::Hit(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(serde_json::from_value(entry.data)?);
                }
                Lookup::Failure(message) => {
                    log::debug!("Serving remembered failure for {}", key);
                    return Err(CacheError::CachedFailure {
                        key: key.to_string(),
                        message,
                    });
                }
                Lookup::Miss => {}
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        if !online {
            return Err(CacheError::OfflineNoCache { key: key.to_string() });
        }

        let epoch = self.epoch.load(Ordering::SeqCst);

        match fetch().await {
            Ok(data) => {
                let entry = CacheEntry::new(
                    serde_json::to_value(&data)?,
                    Some(self.ttl_for(options)),
                    options.priority,
                    &version,
                );
                match self.write_entry(key, entry, options.cache_in_memory, Some(epoch)).await {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Cache invalidated during fetch of {}, skipping write-back", key),
                    Err(e) => log::warn!("Failed to cache {}: {}", key, e),
                }
                Ok(data)
            }
            Err(e) => {
                let message = e.to_string();
                if options.cache_errors {
                    let ttl = Duration::from_secs(self.config.error_ttl_minutes * 60);
                    let entry = CacheEntry::failure(&message, ttl, &version);
                    if let Err(e) = self.write_entry(key, entry, true, Some(epoch)).await {
                        log::warn!("Failed to remember failure for {}: {}", key, e);
                    }
                }
                Err(CacheError::Fetch(message))
            }
        }
    }

    /// Cached value without fetching
    pub async fn get<T: DeserializeOwned>(&self, key: &str, version: Option<&str>) -> Result<Option<T>, CacheError> {
        let version = version.unwrap_or(self.config.default_version.as_str());
        match self.lookup(key, version).await? {
            Lookup::Hit(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(serde_json::from_value(entry.data)?))
            }
            Lookup::Failure(_) | Lookup::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Raw entry, including which tier served it
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.memory.get(key).await {
            if !entry.is_expired() {
                return Ok(Some(entry.with_source(CacheSource::Memory)));
            }
        }

        let stored: Option<CacheEntry> = self.store.load(&Self::store_key(key)).await?;
        Ok(stored
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.with_source(CacheSource::Persistent)))
    }

    /// Store a value; quota failures surface after one eviction retry
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, options: &CacheOptions) -> Result<(), CacheError> {
        let entry = CacheEntry::new(
            serde_json::to_value(data)?,
            Some(self.ttl_for(options)),
            options.priority,
            self.requested_version(options),
        );
        self.write_entry(key, entry, options.cache_in_memory, None).await?;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let _gate = self.gate.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.memory.invalidate(key).await;
        self.store.remove(&Self::store_key(key)).await?;
        log::debug!("Invalidated cache entry {}", key);
        Ok(())
    }

    /// Remove every entry whose key starts with `prefix`, returning the persistent count
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let _gate = self.gate.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let owned = prefix.to_string();
        if let Err(e) = self
            .memory
            .invalidate_entries_if(move |key, _| key.starts_with(&owned))
        {
            log::warn!("Prefix invalidation unsupported ({}), flushing memory tier", e);
            self.memory.invalidate_all();
        }

        let keys = self.store.keys_with_prefix(&Self::store_key(prefix)).await?;
        for key in &keys {
            self.store.remove(key).await?;
        }

        log::info!("Invalidated {} cache entries with prefix '{}'", keys.len(), prefix);
        Ok(keys.len())
    }

    /// Flush both tiers; other store keys are untouched
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let _gate = self.gate.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.memory.invalidate_all();
        self.memory.run_pending_tasks().await;

        let keys = self.store.keys_with_prefix(STORE_PREFIX).await?;
        for key in &keys {
            self.store.remove(key).await?;
        }

        log::info!("Cleared {} cache entries", keys.len());
        Ok(keys.len())
    }

    /// Purge expired persistent entries
    pub async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        self.memory.run_pending_tasks().await;

        let mut removed = 0;
        for key in self.store.keys_with_prefix(STORE_PREFIX).await? {
            let expired = match self.store.load::<CacheEntry>(&key).await {
                Ok(Some(entry)) => entry.is_expired(),
                Ok(None) => false,
                // Unreadable entries are garbage
                Err(StorageError::Serialization(_)) => true,
                Err(e) => return Err(e.into()),
            };
            if expired && self.store.remove(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Removed {} expired cache entries", removed);
        }
        Ok(removed)
    }

    pub async fn info(&self) -> Result<CacheInfo, CacheError> {
        self.memory.run_pending_tasks().await;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Ok(CacheInfo {
            memory_entries: self.memory.entry_count(),
            persistent_entries: self.store.keys_with_prefix(STORE_PREFIX).await?.len() as u64,
            bytes_in_use: self.store.bytes_in_use().await?,
            quota_bytes: self.store.quota_bytes(),
            hits,
            misses,
            hit_rate,
        })
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    // ========================================================================
    // Tier plumbing
    // ========================================================================

    async fn lookup(&self, key: &str, version: &str) -> Result<Lookup, CacheError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if let Some(entry) = self.memory.get(key).await {
            match self.classify(key, entry, version).await? {
                Lookup::Miss => {}
                found => return Ok(found),
            }
        }

        let stored: Option<CacheEntry> = match self.store.load(&Self::store_key(key)).await {
            Ok(stored) => stored,
            Err(StorageError::Serialization(e)) => {
                log::warn!("Dropping unreadable cache entry {}: {}", key, e);
                self.store.remove(&Self::store_key(key)).await?;
                None
            }
            Err(e) => return Err(e.into()),
        };

        let Some(entry) = stored else {
            return Ok(Lookup::Miss);
        };

        let found = self.classify(key, entry, version).await?;
        if let Lookup::Hit(entry) = &found {
            let _gate = self.gate.read().await;
            if self.epoch.load(Ordering::SeqCst) == epoch {
                self.memory
                    .insert(key.to_string(), entry.clone().with_source(CacheSource::Memory))
                    .await;
            }
        }
        Ok(found)
    }

    /// Expired and version-mismatched entries are purged from both tiers
    async fn classify(&self, key: &str, entry: CacheEntry, version: &str) -> Result<Lookup, CacheError> {
        if entry.is_expired() {
            self.purge(key).await?;
            return Ok(Lookup::Miss);
        }

        if entry.version != version {
            log::debug!(
                "Cache version mismatch for {} ({} != {}), dropping",
                key,
                entry.version,
                version
            );
            self.purge(key).await?;
            return Ok(Lookup::Miss);
        }

        if entry.error {
            return Ok(Lookup::Failure(entry.error_message.unwrap_or_default()));
        }

        Ok(Lookup::Hit(entry))
    }

    async fn purge(&self, key: &str) -> Result<(), CacheError> {
        self.memory.invalidate(key).await;
        self.store.remove(&Self::store_key(key)).await?;
        Ok(())
    }

    /// Write both tiers; with `expected_epoch`, skip (returning `false`) if an invalidation ran since
    async fn write_entry(
        &self,
        key: &str,
        entry: CacheEntry,
        in_memory: bool,
        expected_epoch: Option<u64>,
    ) -> Result<bool, CacheError> {
        let _gate = self.gate.read().await;
        if expected_epoch.is_some_and(|epoch| epoch != self.epoch.load(Ordering::SeqCst)) {
            return Ok(false);
        }

        let store_key = Self::store_key(key);
        let value = serde_json::to_value(entry.clone().with_source(CacheSource::Persistent))?;

        match self.store.set(&store_key, value.clone()).await {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded { requested, available }) => {
                let shortfall = requested.saturating_sub(available);
                log::warn!(
                    "Storage quota exceeded caching {} (short {} bytes), evicting",
                    key,
                    shortfall
                );
                self.evict(shortfall, &store_key).await?;
                self.store.set(&store_key, value).await?;
            }
            Err(e) => return Err(e.into()),
        }

        if in_memory {
            self.memory.insert(key.to_string(), entry.with_source(CacheSource::Memory)).await;
        } else {
            self.memory.invalidate(key).await;
        }
        Ok(true)
    }

    /// Free at least `shortfall` bytes: expired first, then low to high priority, oldest first
    pub async fn evict(&self, shortfall: u64, keep: &str) -> Result<u64, StorageError> {
        let mut candidates = Vec::new();
        for key in self.store.keys_with_prefix(STORE_PREFIX).await? {
            if key == keep {
                continue;
            }
            if let Ok(Some(entry)) = self.store.load::<CacheEntry>(&key).await {
                candidates.push((key, entry));
            }
        }

        let now = chrono::Utc::now();
        candidates.sort_by(|(_, a), (_, b)| {
            b.is_expired_at(now)
                .cmp(&a.is_expired_at(now))
                .then(a.priority.cmp(&b.priority))
                .then(a.timestamp.cmp(&b.timestamp))
        });

        let before = self.store.bytes_in_use().await?;
        let mut freed = 0;
        let mut evicted = 0;

        for (store_key, _) in candidates {
            if freed >= shortfall {
                break;
            }
            self.store.remove(&store_key).await?;
            if let Some(key) = store_key.strip_prefix(STORE_PREFIX) {
                self.memory.invalidate(key).await;
            }
            evicted += 1;
            freed = before.saturating_sub(self.store.bytes_in_use().await?);
        }

        log::info!("Evicted {} cache entries, freed {} bytes", evicted, freed);
        Ok(freed)
    }
}

/// Cache entries are what gets dropped when another store writer hits the quota
#[async_trait]
impl SpaceReclaimer for TieredCache {
    async fn reclaim(&self, shortfall: u64, keep: &str) -> Result<u64, StorageError> {
        self.evict(shortfall, keep).await
    }
}

/// Build a `namespace:<hash>` key for a free-text prompt
pub fn prompt_key(namespace: &str, prompt: &str) -> String {
    let digest = hex::encode(Sha256::digest(prompt.as_bytes()));
    format!("{}:{}", namespace, &digest[..PROMPT_HASH_LEN])
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    pub memory_entries: u64,
    pub persistent_entries: u64,
    pub bytes_in_use: u64,
    pub quota_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Percentage
    pub hit_rate: f64,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Offline and no cached data for {key}")]
    OfflineNoCache { key: String },

    #[error("Recent failure cached for {key}: {message}")]
    CachedFailure { key: String, message: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_offline(&self) -> bool {
        matches!(self, CacheError::OfflineNoCache { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    fn create_cache() -> (TieredCache, Arc<dyn KeyValueStore>, Connectivity) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let connectivity = Connectivity::new(true);
        let cache = TieredCache::new(Arc::clone(&store), connectivity.clone());
        (cache, store, connectivity)
    }

    async fn counted_fetch(counter: &AtomicUsize, value: i32) -> Result<i32, String> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    #[tokio::test]
    async fn test_fetch_runs_once_within_ttl() {
        let (cache, _, _) = create_cache();
        let calls = AtomicUsize::new(0);
        let options = CacheOptions::default();

        let first: i32 = cache.get_data("k", || counted_fetch(&calls, 7), &options).await.unwrap();
        let second: i32 = cache.get_data("k", || counted_fetch(&calls, 8), &options).await.unwrap();

        assert_eq!(first, 7);
        assert_eq!(second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let (cache, _, _) = create_cache();
        let calls = AtomicUsize::new(0);
        let options = CacheOptions {
            ttl: Some(Duration::from_millis(50)),
            ..Default::default()
        };

        let _: i32 = cache.get_data("k", || counted_fetch(&calls, 1), &options).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let value: i32 = cache.get_data("k", || counted_fetch(&calls, 2), &options).await.unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_a_miss() {
        let (cache, store, _) = create_cache();
        let calls = AtomicUsize::new(0);

        let _: i32 = cache
            .get_data("k", || counted_fetch(&calls, 1), &CacheOptions::default().version("v1"))
            .await
            .unwrap();
        let value: i32 = cache
            .get_data("k", || counted_fetch(&calls, 2), &CacheOptions::default().version("v2"))
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stored: CacheEntry = store.load("cache:k").await.unwrap().unwrap();
        assert_eq!(stored.version, "v2");
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let (cache, _, _) = create_cache();
        let calls = AtomicUsize::new(0);

        let _: i32 = cache.get_data("k", || counted_fetch(&calls, 1), &CacheOptions::default()).await.unwrap();
        let value: i32 = cache
            .get_data("k", || counted_fetch(&calls, 2), &CacheOptions::default().force_refresh())
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(cache.get::<i32>("k", None).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_offline_without_cache_fails_fast() {
        let (cache, _, connectivity) = create_cache();
        let calls = AtomicUsize::new(0);
        connectivity.set_online(false);

        let err = cache
            .get_data::<i32, _, _, _>("k", || counted_fetch(&calls, 1), &CacheOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_offline());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_offline_serves_cached_even_with_force_refresh() {
        let (cache, _, connectivity) = create_cache();
        let calls = AtomicUsize::new(0);

        let _: i32 = cache.get_data("k", || counted_fetch(&calls, 5), &CacheOptions::default()).await.unwrap();
        connectivity.set_online(false);

        let value: i32 = cache
            .get_data("k", || counted_fetch(&calls, 6), &CacheOptions::default().force_refresh())
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_errors_suppress_retries() {
        let (cache, _, _) = create_cache();
        let calls = AtomicUsize::new(0);
        let options = CacheOptions::default().cache_errors();

        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>("upstream 503")
        };

        let first = cache.get_data("ai", failing, &options).await.unwrap_err();
        assert!(matches!(first, CacheError::Fetch(_)));

        let second = cache.get_data("ai", failing, &options).await.unwrap_err();
        assert!(matches!(second, CacheError::CachedFailure { ref message, .. } if message == "upstream 503"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A remembered failure is never returned as data
        assert_eq!(cache.get::<String>("ai", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_by_prefix_keeps_other_entries() {
        let (cache, _, _) = create_cache();
        let options = CacheOptions::default();

        cache.set("gemini:summarize:abc", &"summary", &options).await.unwrap();
        cache.set("gemini:translate:def", &"traduction", &options).await.unwrap();
        cache.set("bookmarks:user-1", &vec!["a"], &options).await.unwrap();

        let removed = cache.invalidate_by_prefix("gemini").await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(cache.get::<String>("gemini:summarize:abc", None).await.unwrap(), None);
        assert_eq!(
            cache.get::<Vec<String>>("bookmarks:user-1", None).await.unwrap(),
            Some(vec!["a".to_string()])
        );
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_skips_write_back() {
        let (cache, _, _) = create_cache();
        let other = cache.clone();

        let value: i32 = cache
            .get_data(
                "k",
                || async move {
                    other.invalidate("k").await.unwrap();
                    Ok::<_, String>(1)
                },
                &CacheOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(cache.get::<i32>("k", None).await.unwrap(), None);
    }

    /// Store whose next `set` blocks until released
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryKeyValueStore,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl KeyValueStore for GatedStore {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.remove(key).await
        }

        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }

        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys().await
        }

        async fn bytes_in_use(&self) -> Result<u64, StorageError> {
            self.inner.bytes_in_use().await
        }

        fn quota_bytes(&self) -> u64 {
            self.inner.quota_bytes()
        }
    }

    #[tokio::test]
    async fn test_invalidation_waits_for_in_flight_write_back() {
        let gated = Arc::new(GatedStore::default());
        let store: Arc<dyn KeyValueStore> = gated.clone();
        let cache = TieredCache::new(store, Connectivity::new(true));
        gated.armed.store(true, Ordering::SeqCst);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_data::<i32, _, _, _>("k", || async { Ok::<_, String>(1) }, &CacheOptions::default())
                    .await
            })
        };

        // Write-back has passed its epoch check and is parked inside the store
        gated.entered.notified().await;
        let invalidator = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.invalidate("k").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gated.release.notify_one();

        assert_eq!(writer.await.unwrap().unwrap(), 1);
        invalidator.await.unwrap().unwrap();
        assert_eq!(cache.get::<i32>("k", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_uncached_write_drops_stale_memory_copy() {
        let (cache, _, _) = create_cache();
        cache.set("k", &1, &CacheOptions::default()).await.unwrap();

        let persistent_only = CacheOptions {
            cache_in_memory: false,
            ..CacheOptions::default()
        };
        cache.set("k", &2, &persistent_only).await.unwrap();

        assert_eq!(cache.get::<i32>("k", None).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_persistent_hit_is_promoted() {
        let (cache, store, connectivity) = create_cache();
        cache.set("k", &json!({"a": 1}), &CacheOptions::default()).await.unwrap();

        // Fresh process over the same store
        let restarted = TieredCache::new(store, connectivity);
        let entry = restarted.get_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.source, CacheSource::Persistent);

        let value: Option<serde_json::Value> = restarted.get("k", None).await.unwrap();
        assert_eq!(value, Some(json!({"a": 1})));

        let entry = restarted.get_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.source, CacheSource::Memory);
    }

    #[tokio::test]
    async fn test_quota_evicts_low_priority_first() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::with_quota(2_000));
        let cache = TieredCache::new(Arc::clone(&store), Connectivity::new(true));
        let payload = "x".repeat(400);

        cache
            .set("high", &payload, &CacheOptions::default().priority(CachePriority::High))
            .await
            .unwrap();
        cache
            .set("low", &payload, &CacheOptions::default().priority(CachePriority::Low))
            .await
            .unwrap();
        cache
            .set("normal", &payload, &CacheOptions::default())
            .await
            .unwrap();

        cache.set("incoming", &payload, &CacheOptions::default()).await.unwrap();

        assert!(store.get("cache:low").await.unwrap().is_none());
        assert!(store.get("cache:high").await.unwrap().is_some());
        assert!(store.get("cache:incoming").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_surfaces_quota_when_eviction_is_not_enough() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::with_quota(100));
        let cache = TieredCache::new(store, Connectivity::new(true));

        let err = cache
            .set("huge", &"x".repeat(500), &CacheOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Storage(ref e) if e.is_quota_exceeded()));
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (cache, store, _) = create_cache();
        let short = CacheOptions {
            ttl: Some(Duration::from_millis(20)),
            ..Default::default()
        };

        cache.set("old", &1, &short).await.unwrap();
        cache.set("fresh", &2, &CacheOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert!(store.get("cache:old").await.unwrap().is_none());
        assert!(store.get("cache:fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_leaves_foreign_keys() {
        let (cache, store, _) = create_cache();
        store.set("sync:offline_queue", json!([])).await.unwrap();
        cache.set("k", &1, &CacheOptions::default()).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(store.get("sync:offline_queue").await.unwrap().is_some());
        assert_eq!(cache.get::<i32>("k", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_info_hit_rate() {
        let (cache, _, _) = create_cache();
        cache.set("k", &1, &CacheOptions::default()).await.unwrap();

        let _ = cache.get::<i32>("k", None).await.unwrap();
        let _ = cache.get::<i32>("missing", None).await.unwrap();

        let info = cache.info().await.unwrap();
        assert_eq!(info.hits, 1);
        assert_eq!(info.misses, 1);
        assert_eq!(info.hit_rate, 50.0);
        assert_eq!(info.persistent_entries, 1);
    }

    #[test]
    fn test_prompt_key() {
        let a = prompt_key("gemini:summarize", "hello");
        let b = prompt_key("gemini:summarize", "hello");
        let c = prompt_key("gemini:summarize", "world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("gemini:summarize:"));
        assert_eq!(a.len(), "gemini:summarize:".len() + PROMPT_HASH_LEN);
    }
}
