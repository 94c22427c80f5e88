//! Host alarm primitive
//!
//! Alarms are named, fire once or periodically, and carry no payload besides
//! their name. `SqliteAlarms` persists them in the `alarms` table and fires
//! them from a poll loop, so an alarm outlives the process that created it.

use crate::db::{Database, DbError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const ALARM_CHANNEL_CAPACITY: usize = 64;

/// When an alarm should fire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmSpec {
    /// Absolute fire time; wins over `delay_in_minutes`
    pub when: Option<DateTime<Utc>>,
    pub delay_in_minutes: Option<f64>,
    /// Repeat interval; without `when`/`delay` the first fire is one period out
    pub period_in_minutes: Option<f64>,
}

impl AlarmSpec {
    pub fn delay(minutes: f64) -> Self {
        Self {
            delay_in_minutes: Some(minutes),
            ..Default::default()
        }
    }

    pub fn period(minutes: f64) -> Self {
        Self {
            period_in_minutes: Some(minutes),
            ..Default::default()
        }
    }

    fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AlarmError> {
        if let Some(when) = self.when {
            return Ok(when);
        }
        let minutes = self
            .delay_in_minutes
            .or(self.period_in_minutes)
            .ok_or_else(|| AlarmError::InvalidSpec("one of when, delay or period is required".to_string()))?;
        let first = after_minutes(now, minutes)?;
        if let Some(period) = self.period_in_minutes {
            after_minutes(first, period)?;
        }
        Ok(first)
    }
}

/// `start` plus `minutes`, rejecting negative, non-finite and out-of-range values
fn after_minutes(start: DateTime<Utc>, minutes: f64) -> Result<DateTime<Utc>, AlarmError> {
    if !minutes.is_finite() || minutes < 0.0 {
        return Err(AlarmError::InvalidSpec(format!("invalid minutes: {}", minutes)));
    }
    chrono::Duration::try_milliseconds((minutes * 60_000.0) as i64)
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or_else(|| AlarmError::InvalidSpec(format!("{} minutes is out of range", minutes)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub period_in_minutes: Option<f64>,
}

/// Host alarm API
#[async_trait]
pub trait AlarmPlatform: Send + Sync {
    /// Create or replace the alarm called `name`
    async fn create(&self, name: &str, spec: AlarmSpec) -> Result<(), AlarmError>;

    /// Clear an alarm, returning whether it existed
    async fn clear(&self, name: &str) -> Result<bool, AlarmError>;

    async fn get_all(&self) -> Result<Vec<Alarm>, AlarmError>;

    /// Receiver for fired alarms
    fn on_alarm(&self) -> Result<broadcast::Receiver<Alarm>, AlarmError>;

    /// Begin firing alarms
    fn start(&self) -> Result<(), AlarmError>;

    fn stop(&self);

    fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// SQLite alarms
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// How often the poll loop checks for due alarms (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1_000 }
    }
}

#[derive(Clone)]
pub struct SqliteAlarms {
    db: Database,
    config: AlarmConfig,
    tx: broadcast::Sender<Alarm>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl SqliteAlarms {
    pub fn new(db: Database) -> Self {
        Self::with_config(db, AlarmConfig::default())
    }

    pub fn with_config(db: Database, config: AlarmConfig) -> Self {
        let (tx, _rx) = broadcast::channel(ALARM_CHANNEL_CAPACITY);
        Self {
            db,
            config,
            tx,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Fire every alarm due at `now`; returns the fired alarms
    ///
    /// Nothing fires while no listener is subscribed, so alarms created
    /// before a restart wait for the new listener.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<Alarm>, AlarmError> {
        if self.tx.receiver_count() == 0 {
            return Ok(Vec::new());
        }

        let now_ms = now.timestamp_millis();
        let due: Vec<Alarm> = self.db.transaction(|tx| {
            let mut stmt = tx
                .prepare(
                    "SELECT name, scheduled_time, period_minutes FROM alarms
                     WHERE scheduled_time <= ?1 ORDER BY scheduled_time",
                )
                .map_err(DbError::from)?;
            let due = stmt
                .query_map(params![now_ms], row_to_alarm)
                .map_err(DbError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DbError::from)?;

            for alarm in &due {
                match alarm.period_in_minutes {
                    Some(period) => match after_minutes(now, period) {
                        Ok(next) => {
                            tx.execute(
                                "UPDATE alarms SET scheduled_time = ?1 WHERE name = ?2",
                                params![next.timestamp_millis(), alarm.name],
                            )
                            .map_err(DbError::from)?;
                        }
                        Err(e) => {
                            log::warn!("Dropping periodic alarm {}: {}", alarm.name, e);
                            tx.execute("DELETE FROM alarms WHERE name = ?1", params![alarm.name])
                                .map_err(DbError::from)?;
                        }
                    },
                    None => {
                        tx.execute("DELETE FROM alarms WHERE name = ?1", params![alarm.name])
                            .map_err(DbError::from)?;
                    }
                }
            }
            Ok::<_, AlarmError>(due)
        })?;

        for alarm in &due {
            log::debug!("Alarm fired: {}", alarm.name);
            let _ = self.tx.send(alarm.clone());
        }
        Ok(due)
    }

    async fn poll_loop(self) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        log::info!("Alarm poll loop started (every {} ms)", self.config.poll_interval_ms);

        loop {
            interval.tick().await;

            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            if let Err(e) = self.fire_due(Utc::now()) {
                log::error!("Failed to fire due alarms: {}", e);
            }
        }

        log::info!("Alarm poll loop exited");
    }
}

fn row_to_alarm(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alarm> {
    let millis: i64 = row.get(1)?;
    Ok(Alarm {
        name: row.get(0)?,
        scheduled_time: Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now),
        period_in_minutes: row.get(2)?,
    })
}

#[async_trait]
impl AlarmPlatform for SqliteAlarms {
    async fn create(&self, name: &str, spec: AlarmSpec) -> Result<(), AlarmError> {
        let now = Utc::now();
        let first = spec.first_fire(now)?;

        self.db.execute(
            "INSERT OR REPLACE INTO alarms (name, scheduled_time, period_minutes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, first.timestamp_millis(), spec.period_in_minutes, now.to_rfc3339()],
        )?;
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool, AlarmError> {
        let affected = self.db.execute("DELETE FROM alarms WHERE name = ?1", params![name])?;
        Ok(affected > 0)
    }

    async fn get_all(&self) -> Result<Vec<Alarm>, AlarmError> {
        Ok(self.db.query(
            "SELECT name, scheduled_time, period_minutes FROM alarms ORDER BY scheduled_time",
            [],
            row_to_alarm,
        )?)
    }

    fn on_alarm(&self) -> Result<broadcast::Receiver<Alarm>, AlarmError> {
        Ok(self.tx.subscribe())
    }

    fn start(&self) -> Result<(), AlarmError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let handle = tokio::spawn(self.clone().poll_loop());
        *self
            .task_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

// ============================================================================
// Unavailable platform
// ============================================================================

/// Alarm platform for hosts without alarms; every call is `Unavailable`
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAlarms;

#[async_trait]
impl AlarmPlatform for NoopAlarms {
    async fn create(&self, _name: &str, _spec: AlarmSpec) -> Result<(), AlarmError> {
        Err(AlarmError::Unavailable)
    }

    async fn clear(&self, _name: &str) -> Result<bool, AlarmError> {
        Err(AlarmError::Unavailable)
    }

    async fn get_all(&self) -> Result<Vec<Alarm>, AlarmError> {
        Err(AlarmError::Unavailable)
    }

    fn on_alarm(&self) -> Result<broadcast::Receiver<Alarm>, AlarmError> {
        Err(AlarmError::Unavailable)
    }

    fn start(&self) -> Result<(), AlarmError> {
        Err(AlarmError::Unavailable)
    }

    fn stop(&self) {}

    fn is_available(&self) -> bool {
        false
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    #[error("Alarm platform unavailable")]
    Unavailable,

    #[error("Invalid alarm: {0}")]
    InvalidSpec(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_alarms() -> SqliteAlarms {
        SqliteAlarms::new(Database::in_memory().expect("Failed to create test DB"))
    }

    #[tokio::test]
    async fn test_create_and_get_all() {
        let alarms = create_alarms();
        alarms.create("one-shot", AlarmSpec::delay(2.0)).await.unwrap();
        alarms.create("periodic", AlarmSpec::period(60.0)).await.unwrap();

        let all = alarms.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "one-shot");
        assert_eq!(all[1].period_in_minutes, Some(60.0));
    }

    #[tokio::test]
    async fn test_create_replaces_same_name() {
        let alarms = create_alarms();
        alarms.create("a", AlarmSpec::delay(1.0)).await.unwrap();
        alarms.create("a", AlarmSpec::delay(5.0)).await.unwrap();

        assert_eq!(alarms.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_spec() {
        let alarms = create_alarms();
        let err = alarms.create("a", AlarmSpec::default()).await.unwrap_err();
        assert!(matches!(err, AlarmError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_minutes_are_rejected() {
        let alarms = create_alarms();

        let err = alarms.create("far", AlarmSpec::delay(1e15)).await.unwrap_err();
        assert!(matches!(err, AlarmError::InvalidSpec(_)));

        let err = alarms.create("far-period", AlarmSpec::period(1e15)).await.unwrap_err();
        assert!(matches!(err, AlarmError::InvalidSpec(_)));

        let spec = AlarmSpec {
            delay_in_minutes: Some(1.0),
            period_in_minutes: Some(f64::MAX),
            ..Default::default()
        };
        assert!(alarms.create("huge-period", spec).await.is_err());
        assert!(alarms.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fire_due_one_shot_and_periodic() {
        let alarms = create_alarms();
        let mut rx = alarms.on_alarm().unwrap();
        alarms.create("once", AlarmSpec::delay(2.0)).await.unwrap();
        alarms.create("every", AlarmSpec::period(1.0)).await.unwrap();

        assert!(alarms.fire_due(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::minutes(3);
        let fired = alarms.fire_due(later).unwrap();
        assert_eq!(fired.len(), 2);

        let remaining = alarms.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "every");
        assert!(remaining[0].scheduled_time > later);

        assert_eq!(rx.recv().await.unwrap().name, "every");
        assert_eq!(rx.recv().await.unwrap().name, "once");
    }

    #[tokio::test]
    async fn test_nothing_fires_without_listener() {
        let alarms = create_alarms();
        alarms.create("once", AlarmSpec::delay(0.0)).await.unwrap();

        assert!(alarms.fire_due(Utc::now()).unwrap().is_empty());
        assert_eq!(alarms.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_loop_fires_overdue() {
        let alarms = SqliteAlarms::with_config(
            Database::in_memory().unwrap(),
            AlarmConfig { poll_interval_ms: 20 },
        );
        let mut rx = alarms.on_alarm().unwrap();
        alarms.create("now", AlarmSpec::delay(0.0)).await.unwrap();

        alarms.start().unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        alarms.stop();

        assert_eq!(fired.name, "now");
    }

    #[tokio::test]
    async fn test_noop_alarms_are_unavailable() {
        let alarms = NoopAlarms;
        assert!(!alarms.is_available());
        assert!(matches!(
            alarms.create("a", AlarmSpec::delay(1.0)).await,
            Err(AlarmError::Unavailable)
        ));
        assert!(alarms.on_alarm().is_err());
    }
}
