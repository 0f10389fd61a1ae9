//! Child process plumbing for the gateway.
//!
//! The supervisor never touches `tokio::process` directly. It talks to a
//! [`ProcessSpawner`] that hands back a [`GatewayProcess`], which keeps the
//! supervisor testable without real binaries.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Signals the supervisor can deliver to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to shut down (SIGTERM on unix)
    Terminate,
    /// Force the process down
    Kill,
}

/// Everything needed to spawn the gateway
#[derive(Debug, Clone, Default)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Readable output pipes of a spawned process
#[derive(Default)]
pub struct OutputStreams {
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// A running gateway process
#[async_trait]
pub trait GatewayProcess: Send {
    /// PID captured at spawn time
    fn pid(&self) -> u32;

    /// Take the output pipes (only the first call returns them)
    fn take_output(&mut self) -> OutputStreams;

    /// Deliver a stop signal
    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()>;

    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> std::io::Result<ExitInfo>;
}

/// Starts gateway processes
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &LaunchCommand) -> std::io::Result<Box<dyn GatewayProcess>>;
}

/// Spawner backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, command: &LaunchCommand) -> std::io::Result<Box<dyn GatewayProcess>> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned gateway has no pid"))?;

        Ok(Box::new(TokioProcess { child, pid }))
    }
}

struct TokioProcess {
    child: tokio::process::Child,
    pid: u32,
}

#[async_trait]
impl GatewayProcess for TokioProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_output(&mut self) -> OutputStreams {
        OutputStreams {
            stdout: self
                .child
                .stdout
                .take()
                .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            stderr: self
                .child
                .stderr
                .take()
                .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        }
    }

    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()> {
        match signal {
            StopSignal::Terminate => terminate(&mut self.child, self.pid),
            StopSignal::Kill => self.child.start_kill(),
        }
    }

    async fn wait(&mut self) -> std::io::Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(exit_info(status))
    }
}

#[cfg(unix)]
fn terminate(_child: &mut tokio::process::Child, pid: u32) -> std::io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(std::io::Error::other("pid out of range"));
    };
    // SAFETY: plain syscall on a pid we spawned and still hold the handle for
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut tokio::process::Child, _pid: u32) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

/// Own the process until it exits, forwarding stop signals to it.
///
/// The exit is published on `exit_tx` before returning.
pub async fn drive(
    mut process: Box<dyn GatewayProcess>,
    mut control: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) -> ExitInfo {
    let pid = process.pid();
    let info = loop {
        tokio::select! {
            result = process.wait() => {
                break result.unwrap_or_else(|e| {
                    tracing::warn!(pid, "Failed to wait on gateway process: {}", e);
                    ExitInfo::default()
                });
            }
            Some(signal) = control.recv() => {
                tracing::debug!(pid, ?signal, "Signalling gateway");
                if let Err(e) = process.signal(signal) {
                    tracing::warn!(pid, ?signal, "Failed to signal gateway: {}", e);
                }
            }
        }
    };

    exit_tx.send_replace(Some(info));
    info
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward the process output to the log, line by line
pub fn pipe_output(output: OutputStreams) {
    if let Some(stdout) = output.stdout {
        tokio::spawn(forward_lines(stdout, Stream::Stdout));
    }
    if let Some(stderr) = output.stderr {
        tokio::spawn(forward_lines(stderr, Stream::Stderr));
    }
}

async fn forward_lines(reader: Box<dyn AsyncRead + Send + Unpin>, stream: Stream) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream {
                Stream::Stdout => tracing::info!(target: "gateway::stdout", "{}", line),
                Stream::Stderr => tracing::warn!(target: "gateway::stderr", "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(?stream, "Gateway output closed: {}", e);
                break;
            }
        }
    }
}
