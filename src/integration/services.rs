//! Background snapshot publisher and motion-timeout watchdog
//!
//! Both workers are plain threads coordinated by one `running` flag that they
//! check at least once per tick.

use super::connection::ConnectionManager;
use super::motion::{publish_motion_off, MotionTracker};
use crate::collaborators::{SnapshotSource, StreamStore};
use crate::observability::metrics::metrics;
use crate::topics::TopicBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default polling granularity of both workers
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Everything the workers need, shared with the owning integration
#[derive(Clone)]
pub struct ServiceContext {
    pub connection: Arc<ConnectionManager>,
    pub motion: Arc<MotionTracker>,
    pub streams: Arc<dyn StreamStore>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub topics: TopicBuilder,
    pub snapshot_interval: Duration,
    pub motion_timeout: Duration,
}

/// Starts and stops the background workers
pub struct ServiceRunner {
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tick: Duration,
}

impl Default for ServiceRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl ServiceRunner {
    pub fn new(tick: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            tick,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn one worker per loop with a non-zero interval
    ///
    /// Returns the number of workers started; 0 if already running.
    pub fn start(&self, context: ServiceContext) -> usize {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Background services already running");
            return 0;
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        if !context.snapshot_interval.is_zero() {
            let ctx = context.clone();
            let running = self.running.clone();
            let tick = self.tick;
            match std::thread::Builder::new()
                .name("mqtt-snapshots".to_string())
                .spawn(move || snapshot_loop(ctx, running, tick))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, "Failed to start snapshot service"),
            }
        }

        if !context.motion_timeout.is_zero() {
            let ctx = context;
            let running = self.running.clone();
            let tick = self.tick;
            match std::thread::Builder::new()
                .name("mqtt-motion-timeout".to_string())
                .spawn(move || motion_timeout_loop(ctx, running, tick))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, "Failed to start motion timeout service"),
            }
        }

        info!(workers = workers.len(), "Background services started");
        workers.len()
    }

    /// Clear the running flag and join every worker
    pub fn stop(&self) {
        let was_running = self.running.load(Ordering::SeqCst);
        join_workers(self.halt());
        if was_running {
            info!("Background services stopped");
        }
    }

    /// Clear the running flag and hand back the workers without joining them
    pub(crate) fn halt(&self) -> Vec<JoinHandle<()>> {
        self.running.store(false, Ordering::SeqCst);
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Join `workers`, logging any that panicked
pub(crate) fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            warn!("Background service worker panicked");
        }
    }
}

impl Drop for ServiceRunner {
    fn drop(&mut self) {
        // Workers notice within one tick; they are not joined here
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Sleep up to `total` in `tick` slices; false if `running` was cleared
fn sleep_while_running(running: &AtomicBool, total: Duration, tick: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(tick.min(deadline - now));
    }
}

fn snapshot_loop(ctx: ServiceContext, running: Arc<AtomicBool>, tick: Duration) {
    info!(interval_secs = ctx.snapshot_interval.as_secs(), "Snapshot service started");
    while running.load(Ordering::SeqCst) {
        if ctx.connection.is_connected() {
            let published = publish_snapshots(&ctx, &running);
            debug!(published, "Snapshot cycle finished");
        }
        if !sleep_while_running(&running, ctx.snapshot_interval, tick) {
            break;
        }
    }
    info!("Snapshot service stopped");
}

/// Publish one snapshot per enabled stream; returns how many were sent
fn publish_snapshots(ctx: &ServiceContext, running: &AtomicBool) -> usize {
    let mut published = 0;
    for stream in ctx.streams.list_streams() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if !stream.enabled || stream.name.is_empty() {
            continue;
        }
        let Some(image) = ctx.snapshots.get_snapshot(&stream.name) else {
            continue;
        };
        let topic = ctx.topics.snapshot(&stream.name);
        match ctx.connection.publish(&topic, &image, false) {
            Ok(()) => {
                metrics().snapshot_published();
                published += 1;
            }
            Err(e) => {
                metrics().snapshot_failed();
                debug!(stream = %stream.name, error = %e, "Failed to publish snapshot");
            }
        }
    }
    published
}

fn motion_timeout_loop(ctx: ServiceContext, running: Arc<AtomicBool>, tick: Duration) {
    info!(timeout_secs = ctx.motion_timeout.as_secs(), "Motion timeout service started");
    while running.load(Ordering::SeqCst) {
        for expired in ctx.motion.expire_idle(Instant::now(), ctx.motion_timeout) {
            publish_motion_off(&ctx.connection, &ctx.topics, &expired);
        }
        if !sleep_while_running(&running, tick, tick) {
            break;
        }
    }
    info!("Motion timeout service stopped");
}
