//! Bounded teardown of the broker session
//!
//! Every broker call that may block runs on its own detached worker thread.
//! The caller polls a completion flag and gives up after a fixed timeout, so
//! shutdown finishes even when the broker or the network thread is wedged.

use super::connection::ConnectionManager;
use super::services::{join_workers, ServiceRunner};
use crate::error::MqttError;
use crate::observability::metrics::metrics;
use crate::transport::BrokerSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeouts applied to each teardown step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Upper bound for each guarded broker call
    pub step_timeout: Duration,
    /// How often the completion flag is checked
    pub poll_interval: Duration,
    /// Upper bound for acquiring the connection lock
    pub lock_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// How teardown went; never an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Clean,
    /// Steps that did not finish in time; their workers were abandoned
    Degraded { timed_out: Vec<&'static str> },
}

impl ShutdownOutcome {
    fn from_timeouts(timed_out: Vec<&'static str>) -> Self {
        if timed_out.is_empty() {
            ShutdownOutcome::Clean
        } else {
            ShutdownOutcome::Degraded { timed_out }
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ShutdownOutcome::Clean)
    }
}

/// Run `f` on a detached worker and wait at most `timeout` for it
///
/// Returns true if `f` finished in time. A worker that overruns keeps running
/// in the background and is never joined.
pub fn run_with_timeout<F>(name: &'static str, timeout: Duration, poll: Duration, f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let _span = crate::shutdown_span!(operation = name).entered();
    let done = Arc::new(AtomicBool::new(false));
    let worker_done = done.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("mqtt-{name}"))
        .spawn(move || {
            f();
            worker_done.store(true, Ordering::Release);
        });
    if let Err(e) = spawned {
        warn!(operation = name, error = %e, "Failed to spawn teardown worker");
        return false;
    }

    let deadline = Instant::now() + timeout;
    loop {
        if done.load(Ordering::Acquire) {
            debug!(operation = name, "Teardown step completed");
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            let err = MqttError::Timeout {
                operation: name,
                timeout,
            };
            warn!(operation = name, error = %err, "Teardown step abandoned");
            metrics().shutdown_step_timed_out();
            return false;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Orders and bounds the teardown of services, session and library
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownController {
    policy: ShutdownPolicy,
}

impl ShutdownController {
    pub fn new(policy: ShutdownPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.policy
    }

    fn guarded<F>(&self, name: &'static str, timed_out: &mut Vec<&'static str>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !run_with_timeout(name, self.policy.step_timeout, self.policy.poll_interval, f) {
            timed_out.push(name);
        }
    }

    fn disconnect_steps(
        &self,
        session: &Arc<dyn BrokerSession>,
        timed_out: &mut Vec<&'static str>,
    ) {
        let s = session.clone();
        self.guarded("disconnect", timed_out, move || {
            if let Err(e) = s.disconnect() {
                debug!(error = %e, "Broker disconnect reported an error");
            }
        });

        let s = session.clone();
        self.guarded("loop_stop", timed_out, move || {
            if let Err(e) = s.loop_stop() {
                debug!(error = %e, "Stopping the network loop reported an error");
            }
        });
    }

    /// Gracefully disconnect without destroying the session
    pub fn disconnect(&self, connection: &ConnectionManager) -> ShutdownOutcome {
        let mut timed_out = Vec::new();
        let session =
            connection.mark_disconnected(self.policy.lock_timeout, self.policy.poll_interval);

        if let Some(session) = session {
            info!("Disconnecting from MQTT broker");
            self.disconnect_steps(&session, &mut timed_out);
        }
        ShutdownOutcome::from_timeouts(timed_out)
    }

    /// Full teardown: services, flag, session, library
    pub fn shutdown(
        &self,
        connection: &ConnectionManager,
        services: &ServiceRunner,
    ) -> ShutdownOutcome {
        let started = Instant::now();
        info!("MQTT shutdown started");

        let mut timed_out = Vec::new();
        let workers = services.halt();
        if !workers.is_empty() {
            self.guarded("services", &mut timed_out, move || join_workers(workers));
        }
        connection.begin_shutdown();

        let session = match connection
            .detach_session(self.policy.lock_timeout, self.policy.poll_interval)
        {
            Ok(session) => session,
            Err(fallback) => {
                warn!("Connection lock not acquired, tearing down without it");
                metrics().shutdown_step_timed_out();
                timed_out.push("connection_lock");
                fallback
            }
        };

        if let Some(session) = session {
            self.disconnect_steps(&session, &mut timed_out);
            let s = session.clone();
            self.guarded("destroy", &mut timed_out, move || s.destroy());
        }

        if !connection.was_initialized() {
            debug!("No broker session was created, skipping library cleanup");
        } else if timed_out.is_empty() {
            let backend = connection.backend();
            self.guarded("library_cleanup", &mut timed_out, move || backend.cleanup());
        } else {
            warn!(timed_out = ?timed_out, "Skipping library cleanup after incomplete teardown");
        }

        let outcome = ShutdownOutcome::from_timeouts(timed_out);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            clean = outcome.is_clean(),
            "MQTT shutdown finished"
        );
        outcome
    }
}
