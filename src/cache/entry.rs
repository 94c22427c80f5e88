//! Cache entry metadata shared by both tiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Eviction class; lower priorities are evicted first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Tier an entry was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Memory,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// `None` never expires
    pub expiry: Option<DateTime<Utc>>,
    pub priority: CachePriority,
    pub source: CacheSource,
    pub version: String,
    /// Remembered failure; never returned as data
    #[serde(default)]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CacheEntry {
    pub fn new(data: Value, ttl: Option<Duration>, priority: CachePriority, version: &str) -> Self {
        let now = Utc::now();
        Self {
            data,
            timestamp: now,
            expiry: ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .and_then(|ttl| now.checked_add_signed(ttl)),
            priority,
            source: CacheSource::Memory,
            version: version.to_string(),
            error: false,
            error_message: None,
        }
    }

    pub fn failure(message: &str, ttl: Duration, version: &str) -> Self {
        let mut entry = Self::new(Value::Null, Some(ttl), CachePriority::Low, version);
        entry.error = true;
        entry.error_message = Some(message.to_string());
        entry
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map_or(false, |expiry| now >= expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry, `None` when the entry never expires
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expiry
            .map(|expiry| (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub(crate) fn with_source(mut self, source: CacheSource) -> Self {
        self.source = source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry() {
        let entry = CacheEntry::new(json!(1), Some(Duration::from_secs(60)), CachePriority::Normal, "1");
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(Utc::now() + chrono::Duration::minutes(2)));
        assert!(entry.remaining_ttl().unwrap() <= Duration::from_secs(60));

        let forever = CacheEntry::new(json!(1), None, CachePriority::Normal, "1");
        assert!(!forever.is_expired_at(Utc::now() + chrono::Duration::days(365)));
        assert!(forever.remaining_ttl().is_none());
    }

    #[test]
    fn test_priority_order() {
        assert!(CachePriority::Low < CachePriority::Normal);
        assert!(CachePriority::Normal < CachePriority::High);
        assert_eq!(serde_json::to_value(CachePriority::High).unwrap(), json!("high"));
    }

    #[test]
    fn test_failure_entry() {
        let entry = CacheEntry::failure("upstream 503", Duration::from_secs(300), "1");
        assert!(entry.error);
        assert_eq!(entry.error_message.as_deref(), Some("upstream 503"));
        assert_eq!(entry.priority, CachePriority::Low);
    }
}
