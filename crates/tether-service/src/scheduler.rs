//! Periodic unattended extraction.
//!
//! The loop runs as one tokio task per enable. Each iteration is spawned as
//! its own task so a panic inside the pipeline surfaces as a `JoinError` and
//! is backed off instead of ending the loop. Shutdown is a `watch` channel
//! observed between iterations and while sleeping. A run in flight is never
//! cancelled: it always reaches its staging cleanup and its recorded result.

use crate::extractor::Extractor;
use crate::state::SharedState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tether_core::pipeline::Outcome;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Wait before re-checking when no device is online.
pub const NO_DEVICE_BACKOFF: Duration = Duration::from_secs(60);
/// Wait after an iteration failed unexpectedly.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60);
/// Upper bound on waiting for the loop to exit on stop.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("no device connected")]
    NoDeviceConnected,
}

struct LoopHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

enum Iteration {
    Ran(Outcome),
    NoDevice,
}

pub struct Scheduler {
    state: Arc<SharedState>,
    extractor: Arc<Extractor>,
    /// Held for the whole of start/stop, including the connectivity probe
    /// and the join.
    lifecycle: AsyncMutex<Option<LoopHandle>>,
}

impl Scheduler {
    pub fn new(state: Arc<SharedState>, extractor: Arc<Extractor>) -> Self {
        Self {
            state,
            extractor,
            lifecycle: AsyncMutex::new(None),
        }
    }

    /// Enable and start the loop. Returns `Ok(false)` when a loop was
    /// already running.
    pub async fn start(&self) -> Result<bool, SchedulerError> {
        let mut slot = self.lifecycle.lock().await;
        if let Some(handle) = slot.take() {
            let enabled = self.state.read(|s| s.config.scheduler.enabled);
            if !handle.task.is_finished() && enabled {
                *slot = Some(handle);
                return Ok(false);
            }
            // Finished, or disabled out-of-band and still winding down.
            join_loop(handle).await;
        }

        if !self.any_registered_device_connected().await {
            info!("enable rejected: no registered device connected");
            return Err(SchedulerError::NoDeviceConnected);
        }

        self.state.update(|s| s.config.scheduler.enabled = true);
        *slot = Some(self.spawn_loop());
        self.state.activity().record("auto-update enabled");
        Ok(true)
    }

    /// Disable and stop the loop. Idempotent.
    pub async fn stop(&self) {
        let mut slot = self.lifecycle.lock().await;
        let was_enabled = self.state.update(|s| {
            let was = s.config.scheduler.enabled;
            s.config.scheduler.enabled = false;
            was
        });
        if let Some(handle) = slot.take() {
            join_loop(handle).await;
        }
        self.state.update_transient(|s| {
            s.running = false;
            s.next_run_at = None;
        });
        if was_enabled {
            self.state.activity().record("auto-update disabled");
        }
    }

    /// Start the loop at boot if the persisted document says it was enabled.
    /// No connectivity gate: the loop backs off on its own while no device is
    /// online.
    pub async fn resume(&self) -> bool {
        let mut slot = self.lifecycle.lock().await;
        if slot.is_some() || !self.state.read(|s| s.config.scheduler.enabled) {
            return false;
        }
        *slot = Some(self.spawn_loop());
        self.state.activity().record("auto-update resumed from saved settings");
        true
    }

    /// Persist `enabled=false` and signal the loop without waiting for it.
    pub async fn force_disable(&self) {
        let slot = self.lifecycle.lock().await;
        self.state.update(|s| s.config.scheduler.enabled = false);
        if let Some(handle) = slot.as_ref() {
            let _ = handle.shutdown.send(true);
        }
        self.state.update_transient(|s| s.next_run_at = None);
        self.state
            .activity()
            .record("auto-update disabled: no device connected");
    }

    /// Stop the loop for process exit, leaving the persisted flag alone.
    pub async fn shutdown(&self) {
        let mut slot = self.lifecycle.lock().await;
        if let Some(handle) = slot.take() {
            join_loop(handle).await;
        }
    }

    pub async fn is_loop_alive(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    async fn any_registered_device_connected(&self) -> bool {
        let addresses = self.state.read(|s| s.config.addresses());
        let probe = self.extractor.probe();
        for address in &addresses {
            if probe.probe(address).await.connected {
                return true;
            }
        }
        false
    }

    fn spawn_loop(&self) -> LoopHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self.state.clone(), self.extractor.clone(), rx));
        LoopHandle { task, shutdown }
    }
}

async fn join_loop(handle: LoopHandle) {
    let LoopHandle { mut task, shutdown } = handle;
    let _ = shutdown.send(true);
    match tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => debug!("scheduler loop joined"),
        Ok(Err(err)) => warn!(error = %err, "scheduler loop ended abnormally"),
        Err(_) => {
            warn!("scheduler loop did not stop in time; detaching the run in flight");
            task.abort();
        }
    }
}

async fn run_loop(state: Arc<SharedState>, extractor: Arc<Extractor>, mut shutdown: watch::Receiver<bool>) {
    state.update_transient(|s| s.running = true);
    info!("scheduler loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let (enabled, interval_minutes) = state.read(|s| {
            (
                s.config.scheduler.enabled,
                s.config.scheduler.interval_minutes,
            )
        });
        if !enabled {
            info!("auto-update disabled; scheduler loop exiting");
            break;
        }

        // If a stop gives up waiting and aborts this task, dropping the
        // handle detaches the iteration rather than cancelling it.
        let iteration = tokio::spawn(run_iteration(state.clone(), extractor.clone()));
        let wait = match iteration.await {
            Ok(Iteration::Ran(outcome)) => {
                debug!(?outcome, "scheduled run finished");
                Duration::from_secs(u64::from(interval_minutes) * 60)
            }
            Ok(Iteration::NoDevice) => NO_DEVICE_BACKOFF,
            Err(err) => {
                error!(error = %err, "scheduled run failed unexpectedly");
                state.activity().record(format!("scheduled run crashed: {err}"));
                ERROR_BACKOFF
            }
        };
        if *shutdown.borrow() {
            break;
        }

        let next = chrono::Duration::from_std(wait)
            .ok()
            .map(|d| Utc::now() + d);
        state.update_transient(|s| s.next_run_at = next);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
    }

    state.update_transient(|s| {
        s.running = false;
        s.next_run_at = None;
    });
    info!("scheduler loop stopped");
}

async fn run_iteration(state: Arc<SharedState>, extractor: Arc<Extractor>) -> Iteration {
    if !extractor.any_device_online().await {
        let addresses = state.read(|s| s.config.addresses());
        match extractor.probe().reconnect_any(&addresses).await {
            Some(address) => {
                state
                    .activity()
                    .record(format!("reconnected to {address}"));
            }
            None => {
                debug!("no device online; backing off");
                state.activity().record(format!(
                    "no device online; retrying in {}s",
                    NO_DEVICE_BACKOFF.as_secs()
                ));
                return Iteration::NoDevice;
            }
        }
    }
    Iteration::Ran(extractor.run_once().await.outcome)
}
