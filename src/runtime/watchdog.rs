//! Resilience watchdog.
//!
//! Two halves share one [`Watchdog`]. Heartbeats run as a task on the
//! connector loop and announce liveness on every session when due. The
//! health check runs on its own thread and terminates the process when no
//! telemetry was published successfully for longer than the health timeout.
//! Publishing is synchronous, so a wedged transport blocks the loop; the
//! health check must keep ticking regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::context::FleetContext;
use crate::config::WatchdogConfig;
use crate::sync::lock;
use crate::transport::RobotSession;

/// Exit code used when the health check fails.
pub const UNHEALTHY_EXIT_CODE: i32 = 1;

/// Terminates the process when the watchdog decides the connector is wedged.
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Exits the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

pub struct Watchdog {
    config: WatchdogConfig,
    last_publish: Mutex<Instant>,
    last_heartbeat: Mutex<Instant>,
    terminator: Arc<dyn Terminator>,
    fired: AtomicBool,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, terminator: Arc<dyn Terminator>) -> Self {
        for warning in config.warnings() {
            tracing::warn!("{}", warning);
        }
        let now = Instant::now();
        Self {
            config,
            last_publish: Mutex::new(now),
            last_heartbeat: Mutex::new(now),
            terminator,
            fired: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Restart both clocks at `now`. Called once the connect phase finished.
    pub fn reset(&self, now: Instant) {
        *lock(&self.last_publish) = now;
        *lock(&self.last_heartbeat) = now;
    }

    pub fn record_publish(&self) {
        self.record_publish_at(Instant::now());
    }

    pub fn record_publish_at(&self, now: Instant) {
        *lock(&self.last_publish) = now;
    }

    pub fn since_last_publish(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_publish))
    }

    /// Whether the terminator has been invoked.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Announce liveness on every session if a heartbeat is due at `now`.
    pub fn heartbeat(&self, now: Instant, sessions: &[Arc<dyn RobotSession>]) {
        let Some(interval) = self.config.heartbeat_interval() else {
            return;
        };
        let last = *lock(&self.last_heartbeat);
        if now.saturating_duration_since(last) < interval {
            return;
        }

        let mut all_ok = true;
        for session in sessions {
            if let Err(e) = session.announce_liveness() {
                all_ok = false;
                tracing::debug!(
                    robot_id = session.robot_id(),
                    error = %e,
                    "Heartbeat failed, retrying next tick"
                );
            }
        }
        if all_ok {
            *lock(&self.last_heartbeat) = now;
        }
    }

    /// Terminate the process when publishing has been silent too long.
    ///
    /// Returns `true` when this call invoked the terminator.
    pub fn check_health(&self, now: Instant) -> bool {
        let Some(timeout) = self.config.health_timeout() else {
            return false;
        };
        let elapsed = self.since_last_publish(now);
        if elapsed <= timeout {
            return false;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        tracing::error!(
            elapsed_secs = elapsed.as_secs_f64(),
            timeout_secs = timeout.as_secs_f64(),
            "No successful publish within the health timeout, terminating"
        );
        self.terminator.terminate(UNHEALTHY_EXIT_CODE);
        true
    }

    /// Send heartbeats until the task is aborted.
    pub(crate) async fn run_heartbeats(self: Arc<Self>, ctx: FleetContext) {
        if self.config.heartbeat_interval().is_none() {
            return;
        }
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.heartbeat(Instant::now(), &ctx.sessions());
        }
    }

    /// Check health on a dedicated thread until `stop_rx` fires or the
    /// terminator was invoked. Does nothing when the health check is off.
    pub(crate) fn spawn_health_monitor(
        self: Arc<Self>,
        stop_rx: watch::Receiver<bool>,
        thread_name: String,
    ) -> std::io::Result<()> {
        if self.config.health_timeout().is_none() {
            return Ok(());
        }
        let tick = self.config.tick_interval();
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                loop {
                    std::thread::sleep(tick);
                    if *stop_rx.borrow() || stop_rx.has_changed().is_err() {
                        break;
                    }
                    if self.check_health(Instant::now()) {
                        break;
                    }
                }
                tracing::debug!("Health monitor exited");
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}
