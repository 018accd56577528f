//! Lifecycle controller for the backend cluster
//!
//! Owns the Down/Starting/Up state shared by every route, collapses concurrent
//! start requests into one in-flight startup operation, and stops the cluster
//! after a period without traffic.

use crate::cluster::ClusterControl;
use crate::config::LifecycleConfig;
use crate::error::{CommandError, StartupError};
use crate::probe::HealthCheck;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// State of the backend cluster as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not running (or assumed not running)
    Down,
    /// A startup operation is in flight
    Starting,
    /// A probe succeeded since the last start command
    Up,
}

/// The single in-flight "bring the cluster up" operation, awaited by every coalesced caller
type StartupOperation = Shared<BoxFuture<'static, Result<(), StartupError>>>;

/// Timing knobs for the controller
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Overall deadline for one startup operation
    pub startup_timeout: Duration,
    /// Delay between probe attempts while starting
    pub probe_interval: Duration,
    /// Idle period before the cluster is stopped; `None` disables idle shutdown
    pub idle_timeout: Option<Duration>,
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            probe_interval: config.probe_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Counters for lifecycle events
#[derive(Debug, Default)]
pub struct LifecycleStats {
    start_commands: AtomicU64,
    stop_commands: AtomicU64,
    stop_failures: AtomicU64,
    startup_failures: AtomicU64,
    fast_path_hits: AtomicU64,
}

impl LifecycleStats {
    pub fn start_commands(&self) -> u64 {
        self.start_commands.load(Ordering::Relaxed)
    }

    pub fn stop_commands(&self) -> u64 {
        self.stop_commands.load(Ordering::Relaxed)
    }

    pub fn stop_failures(&self) -> u64 {
        self.stop_failures.load(Ordering::Relaxed)
    }

    pub fn startup_failures(&self) -> u64 {
        self.startup_failures.load(Ordering::Relaxed)
    }

    /// Startups that found the cluster already healthy and skipped the start command
    pub fn fast_path_hits(&self) -> u64 {
        self.fast_path_hits.load(Ordering::Relaxed)
    }

    fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct Inner {
    state: LifecycleState,
    startup: Option<StartupOperation>,
    /// Time of the last request accepted by any route
    last_activity: Instant,
}

/// Shared controller for the backend cluster.
///
/// Like the routes that use it, the controller lives behind an `Arc`: the
/// startup operation runs on its own task so that it completes even if the
/// request that triggered it goes away.
///
/// All writes to the state, the startup handle and the activity clock happen
/// under one mutex. Start and stop commands are additionally serialized
/// through `command_gate`, so neither is ever issued while the other (or
/// another instance of itself) is outstanding.
pub struct LifecycleController {
    inner: Mutex<Inner>,
    command_gate: Arc<tokio::sync::Mutex<()>>,
    control: Arc<dyn ClusterControl>,
    health: Arc<dyn HealthCheck>,
    settings: LifecycleSettings,
    stats: LifecycleStats,
}

impl LifecycleController {
    pub fn new(
        control: Arc<dyn ClusterControl>,
        health: Arc<dyn HealthCheck>,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Down,
                startup: None,
                last_activity: Instant::now(),
            }),
            command_gate: Arc::new(tokio::sync::Mutex::new(())),
            control,
            health,
            settings,
            stats: LifecycleStats::default(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> &LifecycleStats {
        &self.stats
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Record that a request was accepted. Returns the recorded timestamp.
    ///
    /// Timestamps are strictly increasing across calls.
    pub fn record_activity(&self) -> Instant {
        let mut inner = self.inner.lock();
        let now = Instant::now().max(inner.last_activity + Duration::from_nanos(1));
        inner.last_activity = now;
        now
    }

    /// Make sure the cluster is up, starting it if needed.
    ///
    /// Concurrent callers share one startup operation and all observe its outcome.
    pub async fn ensure_up(self: &Arc<Self>) -> Result<(), StartupError> {
        let operation = {
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::Up {
                return Ok(());
            }
            if let Some(operation) = inner.startup.clone() {
                debug!("Joining in-flight startup");
                operation
            } else {
                info!(from = ?inner.state, "Cluster starting");
                let operation = self.spawn_startup();
                inner.state = LifecycleState::Starting;
                inner.startup = Some(operation.clone());
                operation
            }
        };

        operation.await
    }

    fn spawn_startup(self: &Arc<Self>) -> StartupOperation {
        let handle = tokio::spawn(Arc::clone(self).run_startup());
        let controller = Arc::clone(self);

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The task never reached its own state update.
                    error!(error = %e, "Startup task failed");
                    let mut inner = controller.inner.lock();
                    inner.state = LifecycleState::Down;
                    inner.startup = None;
                    Err(StartupError::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn run_startup(self: Arc<Self>) -> Result<(), StartupError> {
        let started = Instant::now();
        let _gate = self.command_gate.lock().await;

        let outcome = self.bring_up().await;

        {
            let mut inner = self.inner.lock();
            inner.startup = None;
            match outcome {
                Ok(()) => {
                    inner.state = LifecycleState::Up;
                    // Idle time counts from readiness, not from the request that waited on it
                    inner.last_activity = Instant::now().max(inner.last_activity);
                }
                Err(_) => inner.state = LifecycleState::Down,
            }
        }

        match outcome {
            Ok(()) => {
                info!(elapsed_ms = started.elapsed().as_millis(), "Cluster is up");
            }
            Err(ref e) => {
                let failures = LifecycleStats::incr(&self.stats.startup_failures);
                error!(error = %e, failures, "Cluster startup failed");
            }
        }

        outcome
    }

    async fn bring_up(&self) -> Result<(), StartupError> {
        if self.health.check().await.is_ok() {
            LifecycleStats::incr(&self.stats.fast_path_hits);
            info!("Cluster already healthy, skipping start command");
            return Ok(());
        }

        LifecycleStats::incr(&self.stats.start_commands);
        self.control.start().await.map_err(|e| {
            error!(error = %e, "Start command failed");
            StartupError::StartCommand(e.to_string())
        })?;

        let timeout = self.settings.startup_timeout;
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        while Instant::now() < deadline {
            attempts += 1;
            match tokio::time::timeout_at(deadline, self.health.check()).await {
                Ok(Ok(())) => {
                    debug!(attempts, "Probe succeeded");
                    return Ok(());
                }
                Ok(Err(e)) => debug!(attempts, error = %e, "Cluster not ready yet"),
                Err(_) => break,
            }
            tokio::time::sleep(self.settings.probe_interval).await;
        }

        warn!(attempts, timeout_ms = timeout.as_millis(), "No successful probe before startup deadline");
        Err(StartupError::ProbeTimeout(timeout))
    }

    /// One idle-shutdown check. Returns true if a stop command was issued.
    ///
    /// Acts only when the cluster is Up, idle shutdown is enabled and the
    /// cluster has seen no activity for the idle timeout. A failed stop is
    /// logged and the state still becomes Down.
    pub async fn idle_tick(&self) -> bool {
        let gate = {
            let mut inner = self.inner.lock();
            let Some(idle_timeout) = self.settings.idle_timeout else {
                return false;
            };
            if inner.state != LifecycleState::Up {
                return false;
            }
            let idle_for = inner.last_activity.elapsed();
            if idle_for < idle_timeout {
                return false;
            }
            // Taken under the state lock so no startup can slip in ahead of the stop
            let Ok(gate) = Arc::clone(&self.command_gate).try_lock_owned() else {
                return false;
            };
            inner.state = LifecycleState::Down;
            info!(idle_secs = idle_for.as_secs(), "Cluster idle timeout reached, stopping");
            gate
        };

        self.run_stop().await;
        drop(gate);
        true
    }

    /// Stop the cluster if it is Up, waiting for any outstanding command first.
    ///
    /// Used on proxy shutdown. Returns false if the cluster was not Up.
    pub async fn stop_if_up(&self) -> bool {
        let _gate = self.command_gate.lock().await;
        {
            let mut inner = self.inner.lock();
            if inner.state != LifecycleState::Up {
                return false;
            }
            inner.state = LifecycleState::Down;
        }
        self.run_stop().await;
        true
    }

    async fn run_stop(&self) {
        LifecycleStats::incr(&self.stats.stop_commands);
        match self.control.stop().await {
            Ok(()) => info!("Cluster stopped"),
            Err(e) => log_stop_failure(&self.stats, &e),
        }
    }

    /// Run idle checks on a fixed tick until shutdown
    pub async fn run_idle_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        match self.settings.idle_timeout {
            Some(idle) => info!(
                idle_secs = idle.as_secs(),
                interval_ms = interval.as_millis(),
                "Idle shutdown enabled"
            ),
            None => info!("Idle shutdown disabled"),
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.idle_tick().await;
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Idle loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn log_stop_failure(stats: &LifecycleStats, err: &CommandError) {
    let failures = LifecycleStats::incr(&stats.stop_failures);
    error!(error = %err, failures, "Stop command failed; cluster marked down anyway");
}
