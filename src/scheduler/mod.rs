//! Background Task Scheduler
//!
//! Fires named tasks after a delay or on a period, independent of any open UI:
//! - Tasks are host alarms whose name is a `{type, taskId, data}` JSON envelope
//! - One listener decodes fired alarms and dispatches by task type
//! - Periods shorter than one minute are clamped
//! - Without an alarm platform every call degrades to a no-op
//!
//! The maintenance schedule (cache cleanup and queue drain intervals) is
//! persisted in the settings table.

mod alarm;

pub use alarm::{Alarm, AlarmConfig, AlarmError, AlarmPlatform, AlarmSpec, NoopAlarms, SqliteAlarms};

use crate::db::{Database, DbError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Shortest period the alarm platform honors
pub const MIN_PERIOD_MINUTES: f64 = 1.0;

const MAINTENANCE_CONFIG_KEY: &str = "scheduler_config";

/// Alarm name payload; the platform has no side channel for data
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlarmEnvelope {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(rename = "taskId")]
    task_id: String,
    data: Value,
}

impl AlarmEnvelope {
    fn decode(name: &str) -> Option<Self> {
        serde_json::from_str(name).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Schedule {
    /// One-shot, minutes from now
    Delay(f64),
    /// Repeating, every N minutes
    Period(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleOptions {
    pub schedule: Schedule,
    /// Stable id; scheduling the same id again replaces the task
    pub id: Option<String>,
}

impl ScheduleOptions {
    pub fn delay(minutes: f64) -> Self {
        Self {
            schedule: Schedule::Delay(minutes),
            id: None,
        }
    }

    pub fn period(minutes: f64) -> Self {
        Self {
            schedule: Schedule::Period(minutes),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub data: Value,
    pub alarm_name: String,
    pub period_in_minutes: Option<f64>,
    pub delay_in_minutes: Option<f64>,
}

/// Handler for one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, data: Value) -> Result<(), String>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync,
{
    async fn handle(&self, data: Value) -> Result<(), String> {
        (self.0)(data).await
    }
}

/// Wrap an async closure as a `TaskHandler`
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(FnHandler(move |data| -> BoxFuture<'static, Result<(), String>> {
        Box::pin(f(data))
    }))
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>;

/// Alarm-backed task scheduler
#[derive(Clone)]
pub struct TaskScheduler {
    alarms: Arc<dyn AlarmPlatform>,
    handlers: HandlerMap,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl TaskScheduler {
    pub fn new(alarms: Arc<dyn AlarmPlatform>) -> Self {
        Self {
            alarms,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_available(&self) -> bool {
        self.alarms.is_available()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Register the handler for a task type, replacing any previous one
    pub async fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(task_type.to_string(), handler);
    }

    /// Schedule a task; `None` when the alarm platform is unavailable or refuses it
    pub async fn schedule_task(&self, task_type: &str, data: Value, options: ScheduleOptions) -> Option<ScheduledTask> {
        if !self.alarms.is_available() {
            log::debug!("Alarms unavailable, not scheduling {}", task_type);
            return None;
        }

        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Same id scheduled again replaces the old alarm
        self.cancel_scheduled_task(&id).await;

        let envelope = AlarmEnvelope {
            task_type: task_type.to_string(),
            task_id: id.clone(),
            data: data.clone(),
        };
        let alarm_name = match serde_json::to_string(&envelope) {
            Ok(name) => name,
            Err(e) => {
                log::error!("Failed to encode task {}: {}", task_type, e);
                return None;
            }
        };

        let (spec, period, delay) = match options.schedule {
            Schedule::Delay(minutes) => (AlarmSpec::delay(minutes.max(0.0)), None, Some(minutes.max(0.0))),
            Schedule::Period(minutes) => {
                let minutes = if minutes < MIN_PERIOD_MINUTES {
                    log::warn!(
                        "Period of {} minutes for {} is below the minimum, clamping to {}",
                        minutes,
                        task_type,
                        MIN_PERIOD_MINUTES
                    );
                    MIN_PERIOD_MINUTES
                } else {
                    minutes
                };
                (AlarmSpec::period(minutes), Some(minutes), None)
            }
        };

        if let Err(e) = self.alarms.create(&alarm_name, spec).await {
            log::error!("Failed to schedule task {}: {}", task_type, e);
            return None;
        }

        log::info!("Scheduled task {} ({})", task_type, id);
        Some(ScheduledTask {
            id,
            task_type: task_type.to_string(),
            data,
            alarm_name,
            period_in_minutes: period,
            delay_in_minutes: delay,
        })
    }

    /// Clear every alarm carrying task id `id`
    pub async fn cancel_scheduled_task(&self, id: &str) -> bool {
        let alarms = match self.alarms.get_all().await {
            Ok(alarms) => alarms,
            Err(AlarmError::Unavailable) => return false,
            Err(e) => {
                log::error!("Failed to list alarms: {}", e);
                return false;
            }
        };

        let mut cleared = false;
        for alarm in alarms {
            let matches = AlarmEnvelope::decode(&alarm.name).map_or(false, |env| env.task_id == id);
            if !matches {
                continue;
            }
            match self.alarms.clear(&alarm.name).await {
                Ok(existed) => cleared |= existed,
                Err(e) => log::error!("Failed to clear alarm for task {}: {}", id, e),
            }
        }

        if cleared {
            log::info!("Cancelled scheduled task {}", id);
        }
        cleared
    }

    /// Decoded scheduled tasks; foreign alarms are skipped
    pub async fn pending_tasks(&self) -> Vec<ScheduledTask> {
        let alarms = match self.alarms.get_all().await {
            Ok(alarms) => alarms,
            Err(AlarmError::Unavailable) => return Vec::new(),
            Err(e) => {
                log::error!("Failed to list alarms: {}", e);
                return Vec::new();
            }
        };

        alarms
            .into_iter()
            .filter_map(|alarm| {
                let env = AlarmEnvelope::decode(&alarm.name)?;
                Some(ScheduledTask {
                    id: env.task_id,
                    task_type: env.task_type,
                    data: env.data,
                    alarm_name: alarm.name,
                    period_in_minutes: alarm.period_in_minutes,
                    delay_in_minutes: None,
                })
            })
            .collect()
    }

    /// Start the alarm listener
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let rx = match self.alarms.on_alarm() {
            Ok(rx) => rx,
            Err(AlarmError::Unavailable) => {
                log::warn!("Alarm platform unavailable, scheduled tasks will not fire");
                self.running.store(true, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.running.store(true, Ordering::Relaxed);

        let handlers = self.handlers.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            Self::listener_loop(rx, handlers, running).await;
        });

        *self
            .task_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        // Listener is subscribed before alarms start firing
        if let Err(e) = self.alarms.start() {
            self.stop_inner();
            return Err(e.into());
        }

        log::info!("Task scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        self.stop_inner();
        log::info!("Task scheduler stopped");
        Ok(())
    }

    fn stop_inner(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.alarms.stop();

        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Decode a fired alarm and run its handler
    pub async fn dispatch(&self, alarm: &Alarm) -> bool {
        Self::dispatch_with(&self.handlers, alarm).await
    }

    async fn dispatch_with(handlers: &HandlerMap, alarm: &Alarm) -> bool {
        let Some(env) = AlarmEnvelope::decode(&alarm.name) else {
            log::debug!("Ignoring foreign alarm {}", alarm.name);
            return false;
        };

        let handler = handlers.read().await.get(&env.task_type).cloned();
        let Some(handler) = handler else {
            log::warn!("No handler registered for task type {}", env.task_type);
            return false;
        };

        log::info!("Running scheduled task {} ({})", env.task_type, env.task_id);
        match handler.handle(env.data).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Scheduled task {} failed: {}", env.task_type, e);
                false
            }
        }
    }

    async fn listener_loop(mut rx: broadcast::Receiver<Alarm>, handlers: HandlerMap, running: Arc<AtomicBool>) {
        log::info!("Alarm listener started");

        loop {
            match rx.recv().await {
                Ok(alarm) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    Self::dispatch_with(&handlers, &alarm).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Alarm listener lagged, {} alarms skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        log::info!("Alarm listener exited");
    }
}

// ============================================================================
// Maintenance schedule
// ============================================================================

/// Periodic maintenance configuration stored in the settings table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub cleanup_interval_minutes: u64,
    pub queue_drain_interval_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval_minutes: 60,
            queue_drain_interval_minutes: 5,
            last_run: None,
        }
    }
}

impl MaintenanceConfig {
    pub fn load(db: &Database) -> Result<Self, SchedulerError> {
        Self::load_or(db, &Self::default())
    }

    /// Stored schedule, or `fallback` when none has been saved yet
    pub fn load_or(db: &Database, fallback: &MaintenanceConfig) -> Result<Self, SchedulerError> {
        Ok(db
            .get_setting(MAINTENANCE_CONFIG_KEY)?
            .unwrap_or_else(|| fallback.clone()))
    }

    pub fn save(&self, db: &Database) -> Result<(), SchedulerError> {
        self.validate()?;
        db.set_setting(MAINTENANCE_CONFIG_KEY, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        for (name, minutes) in [
            ("cleanup", self.cleanup_interval_minutes),
            ("queue drain", self.queue_drain_interval_minutes),
        ] {
            if !(1..=1440).contains(&minutes) {
                return Err(SchedulerError::InvalidInterval(format!(
                    "{} interval must be 1-1440 minutes, got {}",
                    name, minutes
                )));
            }
        }
        Ok(())
    }

    /// Record a maintenance run
    pub fn touch(db: &Database, fallback: &MaintenanceConfig) -> Result<(), SchedulerError> {
        let mut config = Self::load_or(db, fallback)?;
        config.last_run = Some(chrono::Utc::now().to_rfc3339());
        config.save(db)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Alarm error: {0}")]
    Alarm(#[from] AlarmError),
}

// ============================================================================
// Tests
// ============================================================================
