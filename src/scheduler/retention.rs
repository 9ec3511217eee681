//! Retention manager for cleaning up old data.

use crate::config::CleanupTimezone;
use crate::db::{DbError, StorageStats, Store};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Milliseconds in one retention day.
pub const DAY_MS: i64 = 86_400_000;

/// Rows strictly older than this timestamp are eligible for deletion.
pub fn cleanup_cutoff(now_ms: i64, retention_days: u32) -> i64 {
    now_ms - i64::from(retention_days) * DAY_MS
}

/// The first `hour:00` strictly after `now`, in `now`'s timezone.
///
/// Days where DST skips that hour fall through to the following day.
pub fn next_cleanup_at<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    for offset in 0..=2 {
        let Some(naive) = (today + ChronoDuration::days(offset)).and_hms_opt(hour, 0, 0) else {
            break;
        };
        if let Some(at) = tz.from_local_datetime(&naive).earliest() {
            if at > *now {
                return at;
            }
        }
    }
    now.clone() + ChronoDuration::days(1)
}

/// Outcome of a cleanup run.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted_count: usize,
    pub cutoff: i64,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot reported by the cleanup-status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    pub running: bool,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub last_deleted: Option<usize>,
    pub last_vacuum: Option<DateTime<Utc>>,
    pub next_cleanup: DateTime<Utc>,
    pub retention_days: u32,
    pub cleanup_hour: u32,
    pub storage: Option<StorageStats>,
}

#[derive(Debug, Default)]
struct History {
    last_cleanup: Option<CleanupReport>,
    last_vacuum: Option<DateTime<Utc>>,
}

/// Manager for deleting data past the retention window.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: u32,
    cleanup_hour: u32,
    timezone: CleanupTimezone,
    running: AtomicBool,
    history: Mutex<History>,
}

impl RetentionManager {
    pub fn new(
        store: Arc<Store>,
        retention_days: u32,
        cleanup_hour: u32,
        timezone: CleanupTimezone,
    ) -> Self {
        Self {
            store,
            retention_days,
            cleanup_hour,
            timezone,
            running: AtomicBool::new(false),
            history: Mutex::new(History::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Delete results older than `retention_days`. Returns the number of
    /// rows removed; an immediate second call removes nothing.
    pub fn run_cleanup(&self, retention_days: u32) -> Result<usize, DbError> {
        self.cleanup(retention_days).map(|report| report.deleted_count)
    }

    /// Cleanup with the configured retention window.
    pub fn cleanup_now(&self) -> Result<CleanupReport, DbError> {
        self.cleanup(self.retention_days)
    }

    fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, DbError> {
        let now = Utc::now();
        let cutoff = cleanup_cutoff(now.timestamp_millis(), retention_days);
        let deleted_count = self.store.delete_older_than(cutoff)?;

        let report = CleanupReport {
            deleted_count,
            cutoff,
            timestamp: now,
        };
        self.history().last_cleanup = Some(report.clone());
        Ok(report)
    }

    /// Reclaim space freed by earlier deletes.
    pub fn vacuum_now(&self) -> Result<DateTime<Utc>, DbError> {
        self.store.vacuum()?;
        let at = Utc::now();
        self.history().last_vacuum = Some(at);
        Ok(at)
    }

    pub fn status(&self) -> CleanupStatus {
        let storage = match self.store.storage_stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!("RetentionManager: Failed to read storage stats: {}", e);
                None
            }
        };
        let (next_cleanup, _) = self.next_fire(Utc::now());
        let history = self.history();
        CleanupStatus {
            running: self.is_running(),
            last_cleanup: history.last_cleanup.as_ref().map(|r| r.timestamp),
            last_deleted: history.last_cleanup.as_ref().map(|r| r.deleted_count),
            last_vacuum: history.last_vacuum,
            next_cleanup,
            retention_days: self.retention_days,
            cleanup_hour: self.cleanup_hour,
            storage,
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next scheduled cleanup after `after`, and whether it falls on the
    /// first of the month (when a VACUUM follows the cleanup).
    fn next_fire(&self, after: DateTime<Utc>) -> (DateTime<Utc>, bool) {
        match self.timezone {
            CleanupTimezone::Utc => {
                let at = next_cleanup_at(&after, self.cleanup_hour);
                (at, at.day() == 1)
            }
            CleanupTimezone::Local => {
                let at = next_cleanup_at(&after.with_timezone(&Local), self.cleanup_hour);
                (at.with_timezone(&Utc), at.day() == 1)
            }
        }
    }

    /// Start the daily cleanup timer. The task exits when `shutdown` flips
    /// to true or its sender is dropped.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        manager.running.store(true, Ordering::Release);

        tokio::spawn(async move {
            tracing::info!(
                "Starting cleanup service (runs daily at {:02}:00 {:?})",
                manager.cleanup_hour,
                manager.timezone
            );
            let mut last_fire: Option<DateTime<Utc>> = None;

            while !*shutdown.borrow() {
                let now = Utc::now();
                // Never schedule the same slot twice, even if we woke early.
                let after = match last_fire {
                    Some(prev) if prev + ChronoDuration::minutes(1) > now => prev + ChronoDuration::minutes(1),
                    _ => now,
                };
                let (fire_at, with_vacuum) = manager.next_fire(after);
                let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!("Next cleanup at {} (in {:?})", fire_at, wait);

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(wait) => {
                        last_fire = Some(fire_at);
                        manager.scheduled_run(with_vacuum);
                    }
                }
            }

            manager.running.store(false, Ordering::Release);
            tracing::info!("Cleanup service stopped");
        })
    }

    fn scheduled_run(&self, with_vacuum: bool) {
        tracing::info!(
            "Starting cleanup: deleting pings older than {} days",
            self.retention_days
        );
        match self.run_cleanup(self.retention_days) {
            Ok(deleted) => tracing::info!("Cleanup completed: deleted {} old ping records", deleted),
            Err(e) => tracing::error!("RetentionManager: Cleanup failed: {}", e),
        }

        if with_vacuum {
            tracing::info!("Starting monthly database VACUUM");
            match self.vacuum_now() {
                Ok(_) => tracing::info!("Database VACUUM completed"),
                Err(e) => tracing::error!("RetentionManager: VACUUM failed: {}", e),
            }
        }
    }
}
