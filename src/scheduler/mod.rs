//! Scheduler module for running probe cycles and daily cleanup.

mod retention;

pub use retention::*;

use crate::config::{CleanupTimezone, ServerConfig};
use crate::db::{DbError, ProbeResult, Store};
use crate::probe::{ProbeError, Prober};

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("scheduler is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Tally of one completed probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub hosts: usize,
    pub successful: usize,
    pub failed: usize,
    /// Probes that produced no stored row (fatal probe error, storage
    /// failure or a panicked task).
    pub errors: usize,
    /// Hosts left unprobed because shutdown began mid-cycle.
    pub cancelled: usize,
    pub started_at: i64,
    pub completed_at: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// A previous cycle was still in flight.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    pub state: SchedulerState,
    pub last_cycle_completed_at: Option<i64>,
    pub last_cycle: Option<CycleReport>,
    pub cleanup_running: bool,
}

/// Timing and limits for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub ping_interval: Duration,
    pub max_concurrent_probes: usize,
    pub retention_days: u32,
    pub cleanup_hour: u32,
    pub cleanup_timezone: CleanupTimezone,
    /// Extra time granted on shutdown beyond the prober's worst case.
    pub shutdown_margin: Duration,
}

impl From<&ServerConfig> for SchedulerConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            ping_interval: cfg.ping_interval_duration(),
            max_concurrent_probes: cfg.max_concurrent_probes,
            retention_days: cfg.retention_days,
            cleanup_hour: cfg.cleanup_hour,
            cleanup_timezone: cfg.cleanup_timezone,
            shutdown_margin: Duration::from_secs(2),
        }
    }
}

enum ProbeOutcome {
    Success,
    Failure,
    Error,
}

/// Clears the in-cycle flag when a cycle ends, including on early return.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The main scheduler that orchestrates probe cycles and retention.
pub struct Scheduler {
    store: Arc<Store>,
    prober: Prober,
    config: SchedulerConfig,
    retention: Arc<RetentionManager>,
    state: Mutex<SchedulerState>,
    cycle_running: AtomicBool,
    last_cycle: Mutex<Option<CycleReport>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, prober: Prober, config: SchedulerConfig) -> Self {
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            config.retention_days,
            config.cleanup_hour,
            config.cleanup_timezone,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store,
            prober,
            config,
            retention,
            state: Mutex::new(SchedulerState::Stopped),
            cycle_running: AtomicBool::new(false),
            last_cycle: Mutex::new(None),
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    pub fn health(&self) -> SchedulerHealth {
        let last_cycle = lock(&self.last_cycle).clone();
        SchedulerHealth {
            state: self.state(),
            last_cycle_completed_at: last_cycle.as_ref().map(|c| c.completed_at),
            last_cycle,
            cleanup_running: self.retention.is_running(),
        }
    }

    /// Spawn the probe timer and the cleanup timer. The first probe cycle
    /// runs immediately.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let hosts = self.store.list_hosts(true)?;
        {
            let mut state = lock(&self.state);
            if *state == SchedulerState::Running {
                return Err(SchedulerError::AlreadyRunning);
            }
            *state = SchedulerState::Running;
        }
        self.shutdown_tx.send_replace(false);

        tracing::info!(
            "Starting scheduler with {} hosts (every {:?}, timeout {:?}, {} retries)",
            hosts.len(),
            self.config.ping_interval,
            self.prober.timeout(),
            self.prober.retries()
        );

        let probe_task = tokio::spawn(self.clone().run_probe_loop(self.shutdown_tx.subscribe()));
        let cleanup_task = self.retention.start(self.shutdown_tx.subscribe());

        let mut tasks = self.tasks.lock().await;
        tasks.push(probe_task);
        tasks.push(cleanup_task);
        Ok(())
    }

    /// Stop accepting timer fires and wait for in-flight work, bounded by
    /// the prober's worst case plus the shutdown margin.
    pub async fn shutdown(&self) {
        if self.state() == SchedulerState::Stopped {
            return;
        }
        tracing::info!("Scheduler: shutting down");
        self.shutdown_tx.send_replace(true);

        let mut handles = std::mem::take(&mut *self.tasks.lock().await);
        let grace = self.prober.worst_case() + self.config.shutdown_margin;
        let drained = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    tracing::error!("Scheduler task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Scheduler: in-flight work did not finish within {:?}, aborting", grace);
            for handle in &handles {
                handle.abort();
            }
        }

        *lock(&self.state) = SchedulerState::Stopped;
        tracing::info!("Scheduler stopped");
    }

    async fn run_probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_probe_cycle().await {
                        tracing::error!("Probe cycle failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Probe loop stopped");
    }

    /// Probe every enabled host once, storing each result as it arrives.
    ///
    /// At most `max_concurrent_probes` probes are in flight. Returns
    /// [`CycleOutcome::Skipped`] if another cycle is still running.
    pub async fn run_probe_cycle(&self) -> Result<CycleOutcome, DbError> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Skipping probe cycle: previous cycle still running");
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = CycleGuard(&self.cycle_running);

        let started = Instant::now();
        let started_at = Utc::now().timestamp_millis();
        let hosts = self.store.list_hosts(true)?;

        let mut report = CycleReport {
            hosts: hosts.len(),
            started_at,
            ..Default::default()
        };

        let mut shutdown = self.shutdown_tx.subscribe();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_probes.max(1)));
        let mut set = JoinSet::new();
        for host in hosts {
            // After shutdown only the probes already in flight may finish.
            if *shutdown.borrow() {
                report.cancelled += 1;
                continue;
            }
            // Acquire before spawning so at most N probe tasks exist.
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    report.cancelled += 1;
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                report.errors += 1;
                continue;
            };
            let prober = self.prober.clone();
            let store = self.store.clone();
            set.spawn(async move {
                let _permit = permit;
                probe_and_store(&prober, &store, &host.hostname).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(ProbeOutcome::Success) => report.successful += 1,
                Ok(ProbeOutcome::Failure) => report.failed += 1,
                Ok(ProbeOutcome::Error) => report.errors += 1,
                Err(e) => {
                    tracing::error!("Probe task panicked: {}", e);
                    report.errors += 1;
                }
            }
        }

        report.completed_at = Utc::now().timestamp_millis();
        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.cancelled > 0 {
            tracing::info!("Shutdown: skipped {} hosts in the current round", report.cancelled);
        }
        tracing::info!(
            "Ping round completed: {} successful, {} failed, {} errors in {}ms",
            report.successful,
            report.failed,
            report.errors,
            report.duration_ms
        );

        *lock(&self.last_cycle) = Some(report.clone());
        Ok(CycleOutcome::Completed(report))
    }

    /// Probe one host right away and store the result.
    pub async fn ping_now(&self, hostname: &str) -> Result<ProbeResult, SchedulerError> {
        let result = self.prober.probe(hostname).await?;
        self.store.insert_result(&result)?;
        Ok(result)
    }
}

async fn probe_and_store(prober: &Prober, store: &Store, hostname: &str) -> ProbeOutcome {
    let result = match prober.probe(hostname).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Probe for {} aborted: {}", hostname, e);
            return ProbeOutcome::Error;
        }
    };

    if let Err(e) = store.insert_result(&result) {
        tracing::error!("Failed to store result for {}: {}", hostname, e);
        return ProbeOutcome::Error;
    }

    match (result.success, result.latency) {
        (true, Some(latency)) => {
            tracing::debug!("Ping to {}: {:.2}ms", hostname, latency);
            ProbeOutcome::Success
        }
        _ => {
            tracing::warn!(
                "Ping to {} failed: {}",
                hostname,
                result.error.as_deref().unwrap_or("unknown error")
            );
            ProbeOutcome::Failure
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
