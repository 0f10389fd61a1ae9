//! Readiness probing for a freshly spawned gateway.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use super::process::ExitInfo;

/// Answers "is the gateway ready to serve on this port?"
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_ready(&self, port: u16) -> bool;
}

/// Probe issuing `GET http://127.0.0.1:<port>/` and expecting a 200
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Create a probe whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_ready(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/", port);
        match self.client.get(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::trace!(port, "Health probe failed: {}", e);
                false
            }
        }
    }
}

/// Result of waiting for the gateway to become ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    TimedOut,
    /// The process went away while we were probing
    ProcessExited,
}

/// Poll `probe` until it succeeds, the deadline passes, or the process dies.
///
/// `is_alive` is consulted before every attempt; `exit_rx` wakes the loop
/// early so a dead process is noticed without waiting out the poll interval.
pub async fn wait_until_healthy<F>(
    probe: &dyn HealthProbe,
    port: u16,
    timeout: Duration,
    poll_interval: Duration,
    is_alive: F,
    mut exit_rx: watch::Receiver<Option<ExitInfo>>,
) -> HealthOutcome
where
    F: Fn() -> bool,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0u32;

    loop {
        if !is_alive() {
            return HealthOutcome::ProcessExited;
        }

        attempts += 1;
        match tokio::time::timeout_at(deadline, probe.is_ready(port)).await {
            Ok(true) => {
                tracing::debug!(
                    port,
                    attempts,
                    "Gateway ready after {:.1}s",
                    started.elapsed().as_secs_f32()
                );
                return HealthOutcome::Healthy;
            }
            Ok(false) => {}
            Err(_) => return HealthOutcome::TimedOut,
        }

        let now = Instant::now();
        if now >= deadline {
            return HealthOutcome::TimedOut;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline.min(now + poll_interval)) => {}
            changed = exit_rx.changed() => {
                if changed.is_err() {
                    return HealthOutcome::ProcessExited;
                }
            }
        }
    }
}
