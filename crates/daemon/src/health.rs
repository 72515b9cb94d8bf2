//! Health monitoring for the live stream
//!
//! The monitor never decides that a stream is unhealthy by itself; the
//! health flag is flipped false by encoder `Failed`/`Ended` transitions.
//! The monitor only acts on an already-unhealthy flag once the check
//! interval has elapsed, and then requests a supervisor-level restart.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

/// Request for a supervisor-level restart, sent when a health check fails
#[derive(Debug)]
pub struct RestartRequest;

/// Liveness belief about the current session
#[derive(Debug, Clone)]
pub struct HealthState {
    /// Whether the session is believed to be producing output
    pub healthy: bool,
    /// When the monitor last evaluated this state
    pub last_check: Instant,
}

impl HealthState {
    /// State for a session that just reached started
    pub fn live_now() -> Self {
        Self {
            healthy: true,
            last_check: Instant::now(),
        }
    }

    /// State with no live session behind it
    pub fn down() -> Self {
        Self {
            healthy: false,
            last_check: Instant::now(),
        }
    }
}

/// Shared health state; written by the supervisor on lifecycle transitions
/// and read by the monitor task.
pub type SharedHealth = Arc<Mutex<HealthState>>;

/// Restart is warranted only when the flag is already false AND the check
/// interval has elapsed since the last evaluation.
pub fn should_restart(state: &HealthState, now: Instant, interval: Duration) -> bool {
    !state.healthy && now.duration_since(state.last_check) >= interval
}

/// Periodic health evaluation tied to one session
pub struct HealthMonitor {
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawn the monitoring task.
    ///
    /// The returned handle is owned by the supervisor alongside the session
    /// handle and must be aborted whenever that session is terminated or
    /// superseded.
    pub fn spawn(
        &self,
        state: SharedHealth,
        restart_tx: mpsc::Sender<RestartRequest>,
    ) -> JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // real evaluation happens one full interval after start.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let now = Instant::now();
                let fire = {
                    let mut state = state.lock().await;
                    let fire = should_restart(&state, now, interval);
                    state.last_check = now;
                    fire
                };
                if fire {
                    warn!("health check failed, requesting restart");
                    if restart_tx.send(RestartRequest).await.is_err() {
                        break; // supervisor is gone
                    }
                }
            }
        })
    }
}
