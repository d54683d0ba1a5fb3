//! Periodic refresh loop.
//!
//! One cycle at a time: a tick or manual trigger that finds a cycle already
//! running is dropped and reported as [`TriggerOutcome::AlreadyRunning`].
//! Nothing is queued behind a running cycle.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::updater::{CycleResult, CycleSummary, Scope, Updater};

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(CycleResult),
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub cycle_in_progress: bool,
    pub interval_secs: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub cycles_completed: u64,
    pub ticks_skipped: u64,
    pub last_cycle: Option<CycleSummary>,
}

#[derive(Default)]
struct Stats {
    cycles_completed: u64,
    ticks_skipped: u64,
    next_run_at: Option<DateTime<Utc>>,
    last_cycle: Option<CycleSummary>,
}

struct Shared {
    updater: Arc<Updater>,
    cycle_guard: Arc<Mutex<()>>,
    stats: Mutex<Stats>,
}

impl Shared {
    /// Claims the cycle slot and spawns the cycle, or returns `None` if the
    /// slot is taken. The slot is held until the cycle has been recorded.
    fn try_begin(self: &Arc<Self>, scope: Scope) -> Option<JoinHandle<CycleResult>> {
        let permit = Arc::clone(&self.cycle_guard).try_lock_owned().ok()?;
        let shared = Arc::clone(self);
        Some(tokio::spawn(async move {
            let result = shared.execute(scope).await;
            drop(permit);
            result
        }))
    }

    async fn execute(&self, scope: Scope) -> CycleResult {
        let started_at = Utc::now();
        let result = match AssertUnwindSafe(self.updater.run_cycle(scope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%scope, fault = %message, "Refresh cycle aborted");
                CycleResult::aborted(scope, started_at, message)
            }
        };

        let mut stats = self.stats.lock().await;
        stats.cycles_completed += 1;
        stats.last_cycle = Some(result.summary());
        result
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("cycle panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("cycle panicked: {message}")
    } else {
        "cycle panicked".to_string()
    }
}

struct LoopControl {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    interval: Duration,
}

/// Drives an [`Updater`] on a fixed interval and serves manual triggers
/// through the same single-cycle slot.
pub struct Scheduler {
    shared: Arc<Shared>,
    control: Mutex<Option<LoopControl>>,
}

impl Scheduler {
    pub fn new(updater: Arc<Updater>) -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                updater,
                cycle_guard: Arc::new(Mutex::new(())),
                stats: Mutex::new(Stats::default()),
            }),
            control: Mutex::new(None),
        }
    }

    /// Starts the loop; the first cycle runs immediately. Returns `false` if
    /// the loop was already running.
    pub async fn start(&self, interval: Duration) -> Result<bool> {
        if interval.is_zero() {
            anyhow::bail!("Refresh interval must be greater than zero");
        }
        let mut control = self.control.lock().await;
        if control.as_ref().is_some_and(|c| !c.handle.is_finished()) {
            debug!("Scheduler already running");
            return Ok(false);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.shared), interval, stop_rx));
        *control = Some(LoopControl {
            stop_tx,
            handle,
            interval,
        });
        info!(interval_secs = interval.as_secs(), "Scheduler started");
        Ok(true)
    }

    /// Stops the loop, interrupting a pending wait. A cycle already running
    /// finishes in the background; use [`Scheduler::wait_idle`] to wait for
    /// it. Returns `false` if the loop wasn't running.
    pub async fn stop(&self) -> bool {
        let Some(control) = self.control.lock().await.take() else {
            return false;
        };
        let _ = control.stop_tx.send(());
        if let Err(e) = control.handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
        self.shared.stats.lock().await.next_run_at = None;
        info!("Scheduler stopped");
        true
    }

    /// Runs one cycle now unless one is already running.
    pub async fn trigger_now(&self, scope: Scope) -> TriggerOutcome {
        let started_at = Utc::now();
        let Some(handle) = self.shared.try_begin(scope) else {
            info!(%scope, "Refresh already in progress, trigger ignored");
            return TriggerOutcome::AlreadyRunning;
        };
        match handle.await {
            Ok(result) => TriggerOutcome::Completed(result),
            Err(e) => {
                error!(error = %e, "Refresh task failed");
                TriggerOutcome::Completed(CycleResult::aborted(scope, started_at, e.to_string()))
            }
        }
    }

    /// Waits until no cycle is running.
    pub async fn wait_idle(&self) {
        let _slot = self.shared.cycle_guard.lock().await;
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (running, interval_secs) = match self.control.lock().await.as_ref() {
            Some(control) if !control.handle.is_finished() => {
                (true, Some(control.interval.as_secs()))
            }
            _ => (false, None),
        };
        let cycle_in_progress = self.shared.cycle_guard.try_lock().is_err();
        let stats = self.shared.stats.lock().await;
        SchedulerStatus {
            running,
            cycle_in_progress,
            interval_secs,
            next_run_at: if running { stats.next_run_at } else { None },
            cycles_completed: stats.cycles_completed,
            ticks_skipped: stats.ticks_skipped,
            last_cycle: stats.last_cycle.clone(),
        }
    }
}

async fn run_loop(shared: Arc<Shared>, period: Duration, mut stop_rx: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let step = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("Scheduler received stop signal");
                break;
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                let skipped = shared.try_begin(Scope::All).is_none();
                let mut stats = shared.stats.lock().await;
                stats.next_run_at = now.checked_add_signed(step);
                if skipped {
                    stats.ticks_skipped += 1;
                    warn!("Previous refresh still running, skipping tick");
                }
            }
        }
    }
}
