//! Host capability detection
//!
//! Alarms and request interception are optional host features. The engine
//! picks a real or no-op implementation for each once at startup and every
//! consumer degrades through `is_available()`.

use crate::config::EngineConfig;
use crate::db::Database;
use crate::scheduler::{AlarmPlatform, NoopAlarms, SqliteAlarms};
use crate::worker::{CacheStorage, NoopCacheStorage, SqliteCacheStorage};
use std::sync::Arc;

#[derive(Clone)]
pub struct Capabilities {
    pub alarms: Arc<dyn AlarmPlatform>,
    pub cache_storage: Arc<dyn CacheStorage>,
}

impl Capabilities {
    /// SQLite-backed capabilities unless disabled in the config
    pub fn detect(config: &EngineConfig, db: &Database) -> Self {
        let alarms: Arc<dyn AlarmPlatform> = if config.disable_alarms {
            Arc::new(NoopAlarms)
        } else {
            Arc::new(SqliteAlarms::with_config(db.clone(), config.alarms.clone()))
        };

        let cache_storage: Arc<dyn CacheStorage> = if config.disable_interception {
            Arc::new(NoopCacheStorage)
        } else {
            Arc::new(SqliteCacheStorage::new(db.clone()))
        };

        let capabilities = Self { alarms, cache_storage };
        log::info!(
            "Host capabilities: alarms={}, cache storage={}",
            capabilities.alarms.is_available(),
            capabilities.cache_storage.is_available()
        );
        capabilities
    }

    /// Nothing available
    pub fn unavailable() -> Self {
        Self {
            alarms: Arc::new(NoopAlarms),
            cache_storage: Arc::new(NoopCacheStorage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_respects_flags() {
        let db = Database::in_memory().expect("Failed to create test DB");

        let full = Capabilities::detect(&EngineConfig::default(), &db);
        assert!(full.alarms.is_available());
        assert!(full.cache_storage.is_available());

        let config = EngineConfig {
            disable_alarms: true,
            disable_interception: true,
            ..Default::default()
        };
        let degraded = Capabilities::detect(&config, &db);
        assert!(!degraded.alarms.is_available());
        assert!(!degraded.cache_storage.is_available());
    }

    #[test]
    fn test_unavailable() {
        let none = Capabilities::unavailable();
        assert!(!none.alarms.is_available());
        assert!(!none.cache_storage.is_available());
    }
}
