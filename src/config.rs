//! Engine configuration
//!
//! Aggregates the per-module configs and fills them from `TABKEEP_*`
//! environment variables (a `.env` file is honoured). Every field has a
//! default, so an empty environment yields a working local-only engine.

use crate::cache::CacheConfig;
use crate::models::Principal;
use crate::scheduler::{AlarmConfig, MaintenanceConfig};
use crate::storage::DEFAULT_QUOTA_BYTES;
use crate::sync::SyncConfig;
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

const DATABASE_FILE: &str = "tabkeep.db";

/// Hosted table settings; sync stays local-only without a URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Change feed poll interval (seconds)
    pub poll_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            poll_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub storage_quota_bytes: u64,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub alarms: AlarmConfig,
    pub worker: WorkerConfig,
    pub remote: RemoteConfig,
    /// Used until a schedule has been stored in the settings table
    pub maintenance: MaintenanceConfig,
    pub principal: Option<Principal>,
    /// HEAD-probed to drive the connectivity signal
    pub probe_url: Option<String>,
    pub probe_interval_secs: u64,
    pub disable_alarms: bool,
    pub disable_interception: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            storage_quota_bytes: DEFAULT_QUOTA_BYTES,
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            alarms: AlarmConfig::default(),
            worker: WorkerConfig::default(),
            remote: RemoteConfig::default(),
            maintenance: MaintenanceConfig::default(),
            principal: None,
            probe_url: None,
            probe_interval_secs: 30,
            disable_alarms: false,
            disable_interception: false,
        }
    }
}

impl EngineConfig {
    /// Load `.env`, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        config.data_dir = match var("TABKEEP_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => directories::ProjectDirs::from("dev", "tabkeep", "tabkeep")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(ConfigError::NoDataDir)?,
        };

        if let Some(quota) = parse(&var, "TABKEEP_STORAGE_QUOTA_BYTES")? {
            config.storage_quota_bytes = quota;
        }
        if let Some(version) = var("TABKEEP_CACHE_VERSION") {
            config.cache.default_version = version;
        }
        if let Some(origin) = var("TABKEEP_ORIGIN") {
            url::Url::parse(&origin).map_err(|e| ConfigError::Invalid {
                name: "TABKEEP_ORIGIN".to_string(),
                message: e.to_string(),
            })?;
            config.worker.origin = origin;
        }

        config.remote.url = var("TABKEEP_REMOTE_URL");
        config.remote.api_key = var("TABKEEP_REMOTE_API_KEY");
        if let Some(remote) = &config.remote.url {
            if config.remote.api_key.is_none() {
                return Err(ConfigError::Missing("TABKEEP_REMOTE_API_KEY".to_string()));
            }
            let parsed = url::Url::parse(remote).map_err(|e| ConfigError::Invalid {
                name: "TABKEEP_REMOTE_URL".to_string(),
                message: e.to_string(),
            })?;
            // Backend traffic is never served from the interception caches
            if let Some(host) = parsed.host_str() {
                config
                    .worker
                    .excluded_host_patterns
                    .push(format!("^{}$", regex_lite::escape(host)));
            }
        }

        config.principal = var("TABKEEP_USER_ID").map(|id| Principal {
            email: var("TABKEEP_USER_EMAIL").unwrap_or_default(),
            display_name: var("TABKEEP_USER_NAME").unwrap_or_else(|| id.clone()),
            id,
        });

        config.probe_url = var("TABKEEP_PROBE_URL");
        config.disable_alarms = flag(&var, "TABKEEP_DISABLE_ALARMS");
        config.disable_interception = flag(&var, "TABKEEP_DISABLE_INTERCEPTION");

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn parse<T, V>(var: &V, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            name: name.to_string(),
            message: e.to_string(),
        }),
        None => Ok(None),
    }
}

fn flag<V: Fn(&str) -> Option<String>>(var: &V, name: &str) -> bool {
    matches!(
        var(name).map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine a data directory; set TABKEEP_DATA_DIR")]
    NoDataDir,

    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_vars(&[("TABKEEP_DATA_DIR", "/tmp/tabkeep")]).unwrap();

        assert_eq!(config.database_path(), PathBuf::from("/tmp/tabkeep/tabkeep.db"));
        assert_eq!(config.storage_quota_bytes, DEFAULT_QUOTA_BYTES);
        assert_eq!(config.sync.batch_size, 25);
        assert!(config.remote.url.is_none());
        assert!(config.principal.is_none());
        assert!(!config.disable_alarms);
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("TABKEEP_DATA_DIR", "/data"),
            ("TABKEEP_STORAGE_QUOTA_BYTES", "5000"),
            ("TABKEEP_CACHE_VERSION", "7"),
            ("TABKEEP_REMOTE_URL", "https://project.supabase.co"),
            ("TABKEEP_REMOTE_API_KEY", "anon"),
            ("TABKEEP_USER_ID", "user-1"),
            ("TABKEEP_USER_EMAIL", "ada@example.com"),
            ("TABKEEP_DISABLE_ALARMS", "true"),
            ("TABKEEP_DISABLE_INTERCEPTION", "0"),
            ("TABKEEP_ORIGIN", "https://app.tabkeep.dev"),
        ])
        .unwrap();

        assert_eq!(config.storage_quota_bytes, 5000);
        assert_eq!(config.cache.default_version, "7");
        assert_eq!(config.remote.api_key.as_deref(), Some("anon"));
        assert_eq!(config.worker.origin, "https://app.tabkeep.dev");
        assert!(config
            .worker
            .excluded_host_patterns
            .contains(&r"^project\.supabase\.co$".to_string()));
        assert!(config.disable_alarms);
        assert!(!config.disable_interception);

        let principal = config.principal.unwrap();
        assert_eq!(principal.email, "ada@example.com");
        assert_eq!(principal.display_name, "user-1");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            from_vars(&[("TABKEEP_DATA_DIR", "/d"), ("TABKEEP_STORAGE_QUOTA_BYTES", "lots")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            from_vars(&[("TABKEEP_DATA_DIR", "/d"), ("TABKEEP_REMOTE_URL", "https://x.dev")]),
            Err(ConfigError::Missing(_))
        ));
        assert!(matches!(
            from_vars(&[
                ("TABKEEP_DATA_DIR", "/d"),
                ("TABKEEP_REMOTE_URL", "not a url"),
                ("TABKEEP_REMOTE_API_KEY", "anon"),
            ]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            from_vars(&[("TABKEEP_DATA_DIR", "/d"), ("TABKEEP_ORIGIN", "not a url")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
