//! Periodic expiry sweep, independent of request volume.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use cadence_agent::runtime::DialogueRuntime;

pub fn spawn(
    runtime: Arc<DialogueRuntime>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(runtime, every, shutdown))
}

pub async fn run(runtime: Arc<DialogueRuntime>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(every.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        event_name = "system.sweeper.started",
        correlation_id = "sweeper",
        interval_ms = every.as_millis() as u64,
        "expiry sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(event_name = "system.sweeper.stopped", correlation_id = "sweeper", "expiry sweeper stopped");
                    return;
                }
            }
            _ = interval.tick() => {
                match runtime.sweep(Utc::now()).await {
                    Ok(report) => debug!(
                        event_name = "system.sweeper.pass",
                        correlation_id = "sweeper",
                        pending_evicted = report.pending_evicted,
                        tasks_expired = report.tasks_expired,
                        locks_pruned = report.locks_pruned,
                        "sweep pass finished"
                    ),
                    Err(sweep_error) => error!(
                        event_name = "system.sweeper.error",
                        correlation_id = "sweeper",
                        error = %sweep_error,
                        "sweep pass failed"
                    ),
                }
            }
        }
    }
}
