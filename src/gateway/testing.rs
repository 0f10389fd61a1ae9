//! In-memory gateway processes for supervisor tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use super::health::HealthProbe;
use super::process::{ExitInfo, GatewayProcess, LaunchCommand, OutputStreams, ProcessSpawner, StopSignal};
use super::runtime::RuntimeLayout;

/// Layout pointing at an empty executable inside `dir`, so resolving succeeds
pub(crate) fn fake_layout(dir: &Path) -> RuntimeLayout {
    let exe = dir.join("gateway");
    std::fs::write(&exe, b"").unwrap();
    RuntimeLayout {
        executable: Some(exe),
        ..Default::default()
    }
}

/// How a fake process reacts to stop signals
#[derive(Clone, Copy)]
pub(crate) enum Behavior {
    ExitOnTerminate,
    ExitOnKill,
    NeverExit,
}

#[derive(Clone)]
pub(crate) struct FakeHandle {
    pub(crate) pid: u32,
    exit_tx: Arc<watch::Sender<Option<ExitInfo>>>,
    signals: Arc<Mutex<Vec<StopSignal>>>,
}

impl FakeHandle {
    /// Exit with a failure code, as if the process died on its own
    pub(crate) fn crash(&self) {
        self.exit_tx.send_replace(Some(ExitInfo {
            code: Some(1),
            signal: None,
        }));
    }

    pub(crate) fn signals(&self) -> Vec<StopSignal> {
        self.signals.lock().unwrap().clone()
    }
}

struct FakeProcess {
    handle: FakeHandle,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    behavior: Behavior,
}

#[async_trait]
impl GatewayProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.handle.pid
    }

    fn take_output(&mut self) -> OutputStreams {
        OutputStreams::default()
    }

    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()> {
        self.handle.signals.lock().unwrap().push(signal);
        let exits = match (self.behavior, signal) {
            (Behavior::ExitOnTerminate, _) => true,
            (Behavior::ExitOnKill, StopSignal::Kill) => true,
            _ => false,
        };
        if exits {
            self.handle.exit_tx.send_replace(Some(ExitInfo {
                code: Some(0),
                signal: None,
            }));
        }
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<ExitInfo> {
        let info = *self
            .exit_rx
            .wait_for(|info| info.is_some())
            .await
            .map_err(std::io::Error::other)?;
        Ok(info.unwrap_or_default())
    }
}

pub(crate) struct FakeSpawner {
    behavior: Behavior,
    next_pid: AtomicU32,
    spawned: Mutex<Vec<(Instant, FakeHandle)>>,
}

impl FakeSpawner {
    pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            next_pid: AtomicU32::new(100),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> (Instant, FakeHandle) {
        self.spawned.lock().unwrap().last().cloned().unwrap()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, _command: &LaunchCommand) -> std::io::Result<Box<dyn GatewayProcess>> {
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = FakeHandle {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit_tx: Arc::new(exit_tx),
            signals: Arc::new(Mutex::new(Vec::new())),
        };
        self.spawned
            .lock()
            .unwrap()
            .push((Instant::now(), handle.clone()));
        Ok(Box::new(FakeProcess {
            handle,
            exit_rx,
            behavior: self.behavior,
        }))
    }
}

/// Health probe answering with a switchable flag
pub(crate) struct SwitchProbe(pub(crate) AtomicBool);

#[async_trait]
impl HealthProbe for SwitchProbe {
    async fn is_ready(&self, _port: u16) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
