//! Gateway process supervision.
//!
//! [`GatewaySupervisor`] owns at most one gateway child process and moves it
//! through [`GatewayState`]:
//! - `start()` spawns the process and waits (bounded) for it to answer HTTP
//! - `stop()` asks it to exit and kills it after a grace period
//! - unexpected exits are recorded and delay the next `start()` by a cooldown
//!
//! Failures never escape as errors; they are logged and the supervisor lands
//! back in `Stopped`. Callers watch the state instead.

pub mod health;
pub mod process;
pub mod runtime;
mod state;
#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::presentation::StateSink;

use health::{HealthOutcome, HealthProbe};
use process::{ExitInfo, ProcessSpawner, StopSignal};
use runtime::RuntimeLayout;

pub use state::GatewayState;

/// Errors that can occur while preparing or spawning the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No gateway runtime configured")]
    RuntimeNotConfigured,

    #[error("Gateway executable not found: {0}")]
    ExecutableMissing(PathBuf),

    #[error("Gateway entry not found: {0}")]
    EntryMissing(PathBuf),

    #[error("Failed to spawn gateway: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Durations governing the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// Minimum time between a crash and the next spawn
    pub crash_cooldown: Duration,
    /// How long a fresh process gets to answer the health probe
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Time between the terminate signal and the forced kill
    pub stop_grace: Duration,
    pub restart_delay: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            crash_cooldown: Duration::from_millis(5_000),
            health_timeout: Duration::from_millis(90_000),
            health_poll_interval: Duration::from_millis(500),
            stop_grace: Duration::from_millis(5_000),
            restart_delay: Duration::from_millis(1_000),
        }
    }
}

/// Collaborators and settings for a supervisor
pub struct SupervisorParams {
    pub port: u16,
    pub token: String,
    pub layout: RuntimeLayout,
    pub timings: SupervisorTimings,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub probe: Arc<dyn HealthProbe>,
    pub sink: Arc<dyn StateSink<GatewayState>>,
}

/// Owns the gateway child process. Cheap to clone; clones share the process.
#[derive(Clone)]
pub struct GatewaySupervisor {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<GatewayState>,
    layout: RuntimeLayout,
    timings: SupervisorTimings,
    spawner: Arc<dyn ProcessSpawner>,
    probe: Arc<dyn HealthProbe>,
    sink: Arc<dyn StateSink<GatewayState>>,
}

struct Inner {
    port: u16,
    token: String,
    child: Option<TrackedChild>,
    last_crash_at: Option<Instant>,
    /// Bumped by every start and stop; a start only proceeds while its value is current
    attempt: u64,
}

/// The live child as the supervisor knows it
struct TrackedChild {
    pid: u32,
    control: mpsc::UnboundedSender<StopSignal>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl GatewaySupervisor {
    pub fn new(params: SupervisorParams) -> Self {
        let (state_tx, _) = watch::channel(GatewayState::Stopped);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    port: params.port,
                    token: params.token,
                    child: None,
                    last_crash_at: None,
                    attempt: 0,
                }),
                state_tx,
                layout: params.layout,
                timings: params.timings,
                spawner: params.spawner,
                probe: params.probe,
                sink: params.sink,
            }),
        }
    }

    pub fn state(&self) -> GatewayState {
        self.shared.state()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.shared.state_tx.subscribe()
    }

    pub fn port(&self) -> u16 {
        self.shared.lock().port
    }

    pub fn token(&self) -> String {
        self.shared.lock().token.clone()
    }

    /// Replace the auth token. A running gateway keeps its old token until restarted.
    pub fn set_token(&self, token: impl Into<String>) {
        self.shared.lock().token = token.into();
        if self.state() != GatewayState::Stopped {
            tracing::info!("Gateway token changed; takes effect on next restart");
        }
    }

    /// PID of the tracked child, if any
    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().child.as_ref().map(|c| c.pid)
    }

    /// Start the gateway and wait until it is healthy or the attempt failed.
    ///
    /// Returns the state the attempt ended in. A no-op while starting or running.
    pub async fn start(&self) -> GatewayState {
        let shared = &self.shared;

        if shared.state() == GatewayState::Stopping {
            tracing::debug!("Gateway is stopping, waiting before start");
            let mut state_rx = shared.state_tx.subscribe();
            let _ = state_rx
                .wait_for(|s| *s != GatewayState::Stopping)
                .await;
        }

        let attempt = {
            let mut inner = shared.lock();
            let current = shared.state();
            if current.is_live() {
                tracing::debug!("Gateway already {}, ignoring start", current);
                return current;
            }
            inner.attempt += 1;
            shared.transition(GatewayState::Starting);
            inner.attempt
        };

        if let Some(remaining) = shared.cooldown_remaining() {
            tracing::info!(
                "Gateway crashed recently, waiting {}ms before starting",
                remaining.as_millis()
            );
            tokio::time::sleep(remaining).await;
            if !shared.is_current(attempt) {
                tracing::info!("Gateway start cancelled during crash cooldown");
                return shared.state();
            }
        }

        let (port, token) = {
            let inner = shared.lock();
            (inner.port, inner.token.clone())
        };

        let command = match shared.layout.resolve(port, &token) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!("Cannot start gateway: {}", e);
                shared.transition(GatewayState::Stopped);
                return GatewayState::Stopped;
            }
        };

        let mut child = match shared.spawner.spawn(&command) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("{}", GatewayError::Spawn(e));
                shared.transition(GatewayState::Stopped);
                return GatewayState::Stopped;
            }
        };

        let pid = child.pid();
        tracing::info!(pid, port, "Spawned gateway: {}", command.program.display());
        process::pipe_output(child.take_output());

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let mut inner = shared.lock();
            if inner.attempt != attempt {
                // A stop landed between the cooldown check and the spawn
                drop(inner);
                tracing::info!(pid, "Gateway start cancelled, killing fresh process");
                let _ = child.signal(StopSignal::Kill);
                return shared.state();
            }
            inner.child = Some(TrackedChild {
                pid,
                control: control_tx,
                exit_rx: exit_rx.clone(),
            });
        }

        let watcher = Arc::clone(shared);
        tokio::spawn(async move {
            let info = process::drive(child, control_rx, exit_tx).await;
            watcher.handle_exit(pid, info);
        });

        let outcome = health::wait_until_healthy(
            shared.probe.as_ref(),
            port,
            shared.timings.health_timeout,
            shared.timings.health_poll_interval,
            || shared.is_tracked_alive(pid),
            exit_rx,
        )
        .await;

        if !shared.is_current(attempt) {
            tracing::debug!(pid, "Gateway start superseded ({})", shared.state());
            return shared.state();
        }

        match outcome {
            HealthOutcome::Healthy
                if shared.state() == GatewayState::Starting && shared.is_tracked_alive(pid) =>
            {
                shared.transition(GatewayState::Running);
                tracing::info!(pid, port, "Gateway is ready");
            }
            HealthOutcome::Healthy => {
                tracing::debug!("Gateway became healthy after start was superseded");
            }
            HealthOutcome::TimedOut => {
                tracing::error!(
                    pid,
                    "Gateway did not become healthy within {}s, stopping it",
                    shared.timings.health_timeout.as_secs()
                );
                self.stop().await;
            }
            HealthOutcome::ProcessExited if shared.state() == GatewayState::Starting => {
                tracing::error!(pid, "Gateway exited before becoming healthy");
                self.stop().await;
            }
            HealthOutcome::ProcessExited => {
                tracing::debug!(pid, "Gateway went away while starting ({})", shared.state());
            }
        }

        shared.state()
    }

    /// Stop the gateway and wait until it is gone.
    ///
    /// Sends a terminate signal, then a kill after the grace period. A no-op
    /// while already stopped or stopping.
    pub async fn stop(&self) {
        let shared = &self.shared;

        let tracked = {
            let mut inner = shared.lock();
            let current = shared.state();
            if matches!(current, GatewayState::Stopped | GatewayState::Stopping) {
                tracing::debug!("Gateway already {}, ignoring stop", current);
                return;
            }
            inner.attempt += 1;
            inner
                .child
                .as_ref()
                .map(|c| (c.pid, c.control.clone()))
        };

        shared.transition(GatewayState::Stopping);

        let Some((pid, control)) = tracked else {
            // Stopped before anything was spawned (e.g. during crash cooldown)
            shared.transition(GatewayState::Stopped);
            return;
        };

        tracing::info!(pid, "Stopping gateway");
        let grace = shared.timings.stop_grace;

        let _ = control.send(StopSignal::Terminate);
        if shared.wait_stopped(grace).await {
            return;
        }

        tracing::warn!(pid, "Gateway did not exit within {}ms, killing it", grace.as_millis());
        let _ = control.send(StopSignal::Kill);
        if shared.wait_stopped(grace).await {
            return;
        }

        tracing::error!(pid, "Gateway did not exit after kill, abandoning handle");
        shared.abandon(pid);
    }

    /// Stop, pause briefly, start again. Callers serialize restarts themselves.
    pub async fn restart(&self) -> GatewayState {
        tracing::info!("Restarting gateway");
        self.stop().await;
        tokio::time::sleep(self.shared.timings.restart_delay).await;
        self.start().await
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> GatewayState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: GatewayState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::debug!("Gateway state: {} -> {}", previous, next);
            self.sink.publish(&next);
        }
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let crashed_at = self.lock().last_crash_at?;
        let remaining = self
            .timings
            .crash_cooldown
            .saturating_sub(crashed_at.elapsed());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// No start or stop has happened since `attempt` was taken
    fn is_current(&self, attempt: u64) -> bool {
        self.lock().attempt == attempt
    }

    /// The tracked child is still the one spawned as `pid` and has not exited
    fn is_tracked_alive(&self, pid: u32) -> bool {
        self.lock()
            .child
            .as_ref()
            .is_some_and(|c| c.pid == pid && c.exit_rx.borrow().is_none())
    }

    async fn wait_stopped(&self, limit: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        matches!(
            tokio::time::timeout(limit, state_rx.wait_for(|s| *s == GatewayState::Stopped)).await,
            Ok(Ok(_))
        )
    }

    fn handle_exit(&self, pid: u32, info: ExitInfo) {
        let crashed = {
            let mut inner = self.lock();
            if inner.child.as_ref().map(|c| c.pid) != Some(pid) {
                tracing::debug!(pid, "Ignoring exit of untracked gateway process");
                return;
            }
            inner.child = None;

            let crashed = self.state() != GatewayState::Stopping;
            if crashed {
                inner.last_crash_at = Some(Instant::now());
            }
            crashed
        };

        if crashed {
            tracing::warn!(pid, "Gateway exited unexpectedly ({})", info);
        } else if info.success() {
            tracing::info!(pid, "Gateway stopped");
        } else {
            tracing::info!(pid, "Gateway stopped ({})", info);
        }
        self.transition(GatewayState::Stopped);
    }

    fn abandon(&self, pid: u32) {
        {
            let mut inner = self.lock();
            if inner.child.as_ref().map(|c| c.pid) == Some(pid) {
                inner.child = None;
            }
        }
        self.transition(GatewayState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presentation::RecordingSink;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use testing::{Behavior, FakeSpawner, SwitchProbe};

    struct Fixture {
        supervisor: GatewaySupervisor,
        spawner: Arc<FakeSpawner>,
        sink: Arc<RecordingSink<GatewayState>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(behavior: Behavior, ready: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        let spawner = FakeSpawner::new(behavior);
        let sink = Arc::new(RecordingSink::new());
        let supervisor = GatewaySupervisor::new(SupervisorParams {
            port: 18789,
            token: "token".to_string(),
            layout: testing::fake_layout(dir.path()),
            timings: SupervisorTimings::default(),
            spawner: spawner.clone(),
            probe: Arc::new(SwitchProbe(AtomicBool::new(ready))),
            sink: sink.clone(),
        });

        Fixture {
            supervisor,
            spawner,
            sink,
            _dir: dir,
        }
    }

    async fn wait_for_state(supervisor: &GatewaySupervisor, state: GatewayState) {
        let mut rx = supervisor.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_running_and_is_idempotent() {
        let f = fixture(Behavior::ExitOnTerminate, true);

        assert_eq!(f.supervisor.start().await, GatewayState::Running);
        assert_eq!(f.supervisor.start().await, GatewayState::Running);

        assert_eq!(f.spawner.count(), 1);
        assert_eq!(f.supervisor.pid(), Some(100));
        assert_eq!(
            f.sink.snapshots(),
            vec![GatewayState::Starting, GatewayState::Running]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_starting_does_not_spawn_again() {
        let f = fixture(Behavior::ExitOnTerminate, false);

        let first = {
            let supervisor = f.supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        };
        wait_for_state(&f.supervisor, GatewayState::Starting).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.supervisor.start().await, GatewayState::Starting);
        assert_eq!(f.spawner.count(), 1);

        f.supervisor.stop().await;
        assert_eq!(first.await.unwrap(), GatewayState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_graceful_and_idempotent() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        f.supervisor.start().await;
        let (_, handle) = f.spawner.last();

        f.supervisor.stop().await;
        f.supervisor.stop().await;

        assert_eq!(f.supervisor.state(), GatewayState::Stopped);
        assert_eq!(handle.signals(), vec![StopSignal::Terminate]);
        assert_eq!(f.supervisor.pid(), None);
        // A graceful stop is not a crash
        assert!(f.supervisor.shared.cooldown_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_kills_after_grace_period() {
        let f = fixture(Behavior::ExitOnKill, true);
        f.supervisor.start().await;
        let (_, handle) = f.spawner.last();

        let begun = Instant::now();
        f.supervisor.stop().await;

        assert_eq!(f.supervisor.state(), GatewayState::Stopped);
        assert_eq!(handle.signals(), vec![StopSignal::Terminate, StopSignal::Kill]);
        assert!(begun.elapsed() >= Duration::from_secs(5));
        assert!(begun.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_unkillable_process() {
        let f = fixture(Behavior::NeverExit, true);
        f.supervisor.start().await;

        let begun = Instant::now();
        f.supervisor.stop().await;

        assert_eq!(f.supervisor.state(), GatewayState::Stopped);
        assert!(begun.elapsed() >= Duration::from_secs(10));
        assert!(begun.elapsed() < Duration::from_secs(11));
        assert_eq!(f.supervisor.pid(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_cooldown_delays_next_spawn() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        f.supervisor.start().await;
        let (_, handle) = f.spawner.last();

        let crashed_at = Instant::now();
        handle.crash();
        wait_for_state(&f.supervisor, GatewayState::Stopped).await;

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(f.supervisor.start().await, GatewayState::Running);

        let (spawned_at, _) = f.spawner.last();
        assert_eq!(f.spawner.count(), 2);
        assert!(spawned_at.duration_since(crashed_at) >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_during_cooldown_spawns_once() {
        let f = fixture(Behavior::NeverExit, false);
        f.supervisor.shared.lock().last_crash_at = Some(Instant::now());

        let first = {
            let supervisor = f.supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.supervisor.stop().await;
        assert_eq!(f.supervisor.state(), GatewayState::Stopped);

        let second = {
            let supervisor = f.supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        };
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(first.is_finished());
        assert_eq!(f.spawner.count(), 1);
        assert_eq!(f.supervisor.pid(), Some(100));
        assert_eq!(f.supervisor.state(), GatewayState::Starting);
        assert!(f.spawner.last().1.signals().is_empty());
        second.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_cooldown_is_immediate() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        f.supervisor.start().await;
        f.spawner.last().1.crash();
        wait_for_state(&f.supervisor, GatewayState::Stopped).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        let begun = Instant::now();
        f.supervisor.start().await;
        assert_eq!(f.spawner.last().0, begun);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_aborts_when_child_dies() {
        let f = fixture(Behavior::ExitOnTerminate, false);

        let spawner = f.spawner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            spawner.last().1.crash();
        });

        let begun = Instant::now();
        assert_eq!(f.supervisor.start().await, GatewayState::Stopped);
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(f.supervisor.shared.cooldown_remaining().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_timeout_stops_process() {
        let f = fixture(Behavior::ExitOnTerminate, false);

        let begun = Instant::now();
        assert_eq!(f.supervisor.start().await, GatewayState::Stopped);

        assert!(begun.elapsed() >= Duration::from_secs(90));
        let (_, handle) = f.spawner.last();
        assert_eq!(handle.signals(), vec![StopSignal::Terminate]);
        assert_eq!(
            f.sink.snapshots(),
            vec![
                GatewayState::Starting,
                GatewayState::Stopping,
                GatewayState::Stopped
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_binary_fails_quietly() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        let supervisor = GatewaySupervisor::new(SupervisorParams {
            port: 1,
            token: String::new(),
            layout: RuntimeLayout {
                executable: Some(PathBuf::from("/definitely/not/here/gateway")),
                ..Default::default()
            },
            timings: SupervisorTimings::default(),
            spawner: f.spawner.clone(),
            probe: Arc::new(SwitchProbe(AtomicBool::new(true))),
            sink: f.sink.clone(),
        });

        assert_eq!(supervisor.start().await, GatewayState::Stopped);
        assert_eq!(f.spawner.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_spawns_fresh_process() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        f.supervisor.start().await;

        let begun = Instant::now();
        assert_eq!(f.supervisor.restart().await, GatewayState::Running);

        assert_eq!(f.spawner.count(), 2);
        assert_eq!(f.supervisor.pid(), Some(101));
        assert!(begun.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_exit_is_ignored() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        f.supervisor.start().await;

        f.supervisor.shared.handle_exit(9999, ExitInfo::default());

        assert_eq!(f.supervisor.state(), GatewayState::Running);
        assert_eq!(f.supervisor.pid(), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_accessors() {
        let f = fixture(Behavior::ExitOnTerminate, true);
        assert_eq!(f.supervisor.token(), "token");
        assert_eq!(f.supervisor.port(), 18789);
        f.supervisor.set_token("rotated");
        assert_eq!(f.supervisor.token(), "rotated");
    }
}
