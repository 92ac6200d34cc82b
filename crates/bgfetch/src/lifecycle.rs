//! # Process Lifecycle Signals
//!
//! The coordinator reacts to two lifecycle signals, both by cleaning up
//! cached files no active transfer refers to. [`ClockWatcher`] produces
//! [`LifecycleEvent::SignificantTimeChange`] by comparing wall-clock and
//! monotonic time, and [`watch_termination_signals`] turns Ctrl-C or SIGTERM
//! into [`LifecycleEvent::Terminating`].

use std::time::{Duration, Instant, SystemTime};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The process is about to exit
    Terminating,
    /// The wall clock jumped relative to elapsed time
    SignificantTimeChange,
}

/// How far the wall clock moved away from elapsed monotonic time between two
/// samples
pub fn clock_drift(wall_before: SystemTime, wall_after: SystemTime, elapsed: Duration) -> Duration {
    match wall_after.duration_since(wall_before) {
        Ok(wall_elapsed) => wall_elapsed.abs_diff(elapsed),
        // Wall clock went backwards
        Err(e) => e.duration() + elapsed,
    }
}

/// Periodically samples the wall clock and reports jumps
#[derive(Debug, Clone, Copy)]
pub struct ClockWatcher {
    interval: Duration,
    threshold: Duration,
}

impl ClockWatcher {
    pub fn new(interval: Duration, threshold: Duration) -> Self {
        Self {
            interval,
            threshold,
        }
    }

    pub fn is_significant(&self, drift: Duration) -> bool {
        drift >= self.threshold
    }

    /// Run the watcher on `runtime`. `on_change` is called for every
    /// significant jump; returning false stops the watcher.
    pub fn spawn<F>(self, runtime: &Handle, on_change: F) -> JoinHandle<()>
    where
        F: Fn() -> bool + Send + 'static,
    {
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut wall = SystemTime::now();
            let mut monotonic = Instant::now();

            loop {
                ticker.tick().await;

                let wall_now = SystemTime::now();
                let monotonic_now = Instant::now();
                let drift = clock_drift(wall, wall_now, monotonic_now - monotonic);
                wall = wall_now;
                monotonic = monotonic_now;

                if self.is_significant(drift) {
                    info!(drift = ?drift, "Significant wall clock change detected");
                    if !on_change() {
                        break;
                    }
                }
            }
            debug!("Clock watcher stopped");
        })
    }
}

/// Deliver [`LifecycleEvent::Terminating`] to `coordinator` when the process
/// receives Ctrl-C (or SIGTERM on unix)
pub fn watch_termination_signals(coordinator: Coordinator) -> JoinHandle<()> {
    let runtime = coordinator.runtime().clone();
    runtime.spawn(async move {
        wait_for_termination().await;
        info!("Termination signal received");
        coordinator.notify_lifecycle(LifecycleEvent::Terminating);
    })
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to listen for Ctrl-C");
                        let _ = terminate.recv().await;
                    }
                }
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            wait_for_ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
