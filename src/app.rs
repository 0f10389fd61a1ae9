//! Composition root: wires the gateway supervisor, the pairing monitor and
//! the update orchestrator together and runs them until asked to quit.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::config_store::GatewayConfigStore;
use crate::gateway::health::HttpHealthProbe;
use crate::gateway::process::TokioSpawner;
use crate::gateway::runtime::RuntimeLayout;
use crate::gateway::{GatewayState, GatewaySupervisor, SupervisorParams};
use crate::github::GitHubClient;
use crate::pairing::queue::{HttpApprovalQueue, StorePolicyReader, TimedBootstrapWindow};
use crate::pairing::{MonitorParams, PairingApprovalMonitor, PairingApprovalState};
use crate::presentation::{LogSink, StateSink};
use crate::update::{
    self, GitHubReleaseDelivery, LogNotifier, UpdateBannerState, UpdateOrchestrator, UserNotifier,
};

/// Where state snapshots and user notices go
pub struct Presentation {
    pub gateway: Arc<dyn StateSink<GatewayState>>,
    pub pairing: Arc<dyn StateSink<PairingApprovalState>>,
    pub banner: Arc<dyn StateSink<UpdateBannerState>>,
    pub notifier: Arc<dyn UserNotifier>,
}

impl Presentation {
    /// Everything goes to the log
    pub fn logging() -> Self {
        Self {
            gateway: Arc::new(LogSink::new("gateway")),
            pairing: Arc::new(LogSink::new("pairing")),
            banner: Arc::new(LogSink::new("update")),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// The running launcher
pub struct Launcher {
    config: Config,
    supervisor: GatewaySupervisor,
    monitor: PairingApprovalMonitor,
    updates: UpdateOrchestrator,
    /// Notified when an installer takes over
    quit: Arc<Notify>,
    store: GatewayConfigStore,
    shutting_down: Arc<AtomicBool>,
    /// Gateway watcher and signal handlers, aborted on shutdown
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Launcher {
    /// Build every component. Nothing is started yet.
    pub fn init(config: Config, store: GatewayConfigStore, presentation: Presentation) -> Result<Self> {
        let token = store
            .ensure_token()
            .context("Failed to prepare gateway auth token")?;
        let doc = store
            .load()
            .context("Failed to read gateway configuration")?;
        let probe_timeout = Duration::from_millis(config.gateway.probe_timeout_ms);

        let supervisor = GatewaySupervisor::new(SupervisorParams {
            port: doc.gateway.port,
            token,
            layout: RuntimeLayout::from_config(&config.gateway),
            timings: config.gateway.timings(),
            spawner: Arc::new(TokioSpawner),
            probe: Arc::new(HttpHealthProbe::new(probe_timeout)?),
            sink: presentation.gateway,
        });

        // Nobody approved yet: the first device gets in without a prompt
        let bootstrap = if doc.pairing.approved_users.is_empty() {
            TimedBootstrapWindow::open_for(Duration::from_millis(config.pairing.bootstrap_window_ms))
        } else {
            TimedBootstrapWindow::closed()
        };

        let monitor = PairingApprovalMonitor::new(MonitorParams {
            timings: config.pairing.timings(),
            backend: Arc::new(supervisor.clone()),
            queue: Arc::new(HttpApprovalQueue::new(
                Arc::new(supervisor.clone()),
                probe_timeout,
            )?),
            policy: Arc::new(StorePolicyReader::new(store.clone())),
            bootstrap: Arc::new(bootstrap),
            sink: presentation.pairing,
        });

        let quit = Arc::new(Notify::new());
        let delivery = GitHubReleaseDelivery::new(
            GitHubClient::new(config.updates.repository.clone())?,
            config.updates.allow_prerelease,
            update::download_dir()?,
            Arc::clone(&quit),
        );
        let updates = UpdateOrchestrator::new(
            Arc::new(delivery),
            config.updates.schedule(),
            presentation.banner,
            presentation.notifier,
        );

        Ok(Self {
            config,
            supervisor,
            monitor,
            updates,
            quit,
            store,
            shutting_down: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn supervisor(&self) -> &GatewaySupervisor {
        &self.supervisor
    }

    /// Whether the host is in the foreground; pairing polls faster when it is
    pub fn set_foreground(&self, foreground: bool) {
        self.monitor.set_foreground(foreground);
    }

    /// Start background work and, if configured, the gateway
    pub async fn start(&self) {
        let watcher = spawn_gateway_watcher(
            self.supervisor.clone(),
            self.monitor.clone(),
            Arc::clone(&self.shutting_down),
        );
        self.track(watcher);
        if let Some(hangup) = spawn_hangup_handler(self.store.clone(), self.supervisor.clone()) {
            self.track(hangup);
        }

        self.monitor.start();
        self.updates.start(self.config.updates.check_on_startup);

        if self.config.gateway.auto_start {
            let state = self.supervisor.start().await;
            tracing::info!(
                pid = ?self.supervisor.pid(),
                "Gateway {} on port {}",
                state,
                self.supervisor.port()
            );
        } else {
            tracing::info!("Gateway auto-start disabled");
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Wait for Ctrl-C or for an installer to take over
    pub async fn wait_for_quit(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Interrupted, shutting down");
            }
            _ = self.quit.notified() => {
                tracing::info!("Installer launched, shutting down");
            }
        }
    }

    /// Stop everything; the gateway last so in-flight polls see it go
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }

        self.updates.stop();
        self.monitor.stop();
        self.supervisor.stop().await;
        tracing::info!("Launcher stopped");
    }
}

/// Restart a crashed gateway and poll pairings as soon as it is up
fn spawn_gateway_watcher(
    supervisor: GatewaySupervisor,
    monitor: PairingApprovalMonitor,
    shutting_down: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut state_rx = supervisor.subscribe();
    tokio::spawn(async move {
        let mut previous = *state_rx.borrow_and_update();
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            match (previous, state) {
                (_, GatewayState::Running) => monitor.trigger_now(),
                // A requested stop passes through Stopping
                (GatewayState::Running, GatewayState::Stopped)
                    if !shutting_down.load(Ordering::SeqCst) =>
                {
                    tracing::warn!("Gateway crashed, restarting");
                    let supervisor = supervisor.clone();
                    tokio::spawn(async move {
                        supervisor.start().await;
                    });
                }
                _ => {}
            }
            previous = state;
        }
    })
}

/// SIGHUP re-reads the auth token and restarts the gateway with it
#[cfg(unix)]
fn spawn_hangup_handler(
    store: GatewayConfigStore,
    supervisor: GatewaySupervisor,
) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Failed to install SIGHUP handler: {}", e);
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("Received SIGHUP; reloading gateway");
            reload_gateway(&store, &supervisor).await;
        }
    }))
}

#[cfg(not(unix))]
fn spawn_hangup_handler(
    _store: GatewayConfigStore,
    _supervisor: GatewaySupervisor,
) -> Option<JoinHandle<()>> {
    None
}

/// Pick up the stored token and restart; restarts run one at a time
#[cfg(unix)]
async fn reload_gateway(store: &GatewayConfigStore, supervisor: &GatewaySupervisor) {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.ensure_token()).await {
        Ok(Ok(token)) => supervisor.set_token(token),
        Ok(Err(e)) => tracing::warn!("Keeping current gateway token: {}", e),
        Err(e) => tracing::warn!("Keeping current gateway token: {}", e),
    }
    let state = supervisor.restart().await;
    tracing::info!("Gateway {} after reload", state);
}
