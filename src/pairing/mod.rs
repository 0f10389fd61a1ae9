//! Pairing approval monitoring.
//!
//! [`PairingApprovalMonitor`] polls the gateway's approval queue while the
//! gateway is running, auto-approves the very first device during the
//! bootstrap window, and publishes [`PairingApprovalState`] snapshots. A
//! snapshot is only published when its fingerprint changes.

pub mod queue;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;

use crate::gateway::{GatewayState, GatewaySupervisor};
use crate::presentation::StateSink;

use queue::{ApprovalPolicyReader, ApprovalQueue, BootstrapWindow};
use types::{AutoApproval, Fingerprint, PairingRequest};

pub use types::PairingApprovalState;

/// Polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimings {
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    /// Delay before the first poll after `start()`
    pub initial_delay: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            foreground_interval: Duration::from_millis(10_000),
            background_interval: Duration::from_millis(60_000),
            initial_delay: Duration::from_millis(800),
        }
    }
}

/// Whether the backend is up and worth polling
pub trait BackendStatus: Send + Sync {
    fn is_running(&self) -> bool;
}

impl BackendStatus for GatewaySupervisor {
    fn is_running(&self) -> bool {
        self.state() == GatewayState::Running
    }
}

pub struct MonitorParams {
    pub timings: MonitorTimings,
    pub backend: Arc<dyn BackendStatus>,
    pub queue: Arc<dyn ApprovalQueue>,
    pub policy: Arc<dyn ApprovalPolicyReader>,
    pub bootstrap: Arc<dyn BootstrapWindow>,
    pub sink: Arc<dyn StateSink<PairingApprovalState>>,
}

/// Polls pending pairing requests. Cheap to clone.
#[derive(Clone)]
pub struct PairingApprovalMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    timings: MonitorTimings,
    backend: Arc<dyn BackendStatus>,
    queue: Arc<dyn ApprovalQueue>,
    policy: Arc<dyn ApprovalPolicyReader>,
    bootstrap: Arc<dyn BootstrapWindow>,
    sink: Arc<dyn StateSink<PairingApprovalState>>,
    foreground: AtomicBool,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    running: bool,
    /// Bumped on every start so a loop outliving a stop/start pair exits
    generation: u64,
    wake: Option<Arc<Notify>>,
    polling: bool,
    last_fingerprint: Option<Fingerprint>,
    auto_approval: Option<AutoApproval>,
}

impl PairingApprovalMonitor {
    pub fn new(params: MonitorParams) -> Self {
        Self {
            shared: Arc::new(Shared {
                timings: params.timings,
                backend: params.backend,
                queue: params.queue,
                policy: params.policy,
                bootstrap: params.bootstrap,
                sink: params.sink,
                foreground: AtomicBool::new(false),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Begin polling; the first poll follows shortly. A no-op when already running.
    pub fn start(&self) {
        let (generation, wake) = {
            let mut inner = self.shared.lock();
            if inner.running {
                tracing::debug!("Pairing monitor already running");
                return;
            }
            inner.running = true;
            inner.generation += 1;
            let wake = Arc::new(Notify::new());
            inner.wake = Some(Arc::clone(&wake));
            (inner.generation, wake)
        };

        tracing::debug!("Pairing monitor started");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(shared.run(generation, wake));
    }

    /// Cancel the scheduled poll. A poll already in flight runs to completion.
    pub fn stop(&self) {
        let wake = {
            let mut inner = self.shared.lock();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.wake.take()
        };
        if let Some(wake) = wake {
            wake.notify_one();
        }
        tracing::debug!("Pairing monitor stopped");
    }

    /// Poll as soon as possible. While a poll is in flight, exactly one
    /// follow-up poll is queued behind it.
    pub fn trigger_now(&self) {
        let wake = self.shared.lock().wake.clone();
        if let Some(wake) = wake {
            wake.notify_one();
        }
    }

    /// Report whether the host is in the foreground; picks the next polling interval
    pub fn set_foreground(&self, foreground: bool) {
        self.shared.foreground.store(foreground, Ordering::Relaxed);
    }

    /// Run one poll cycle right away, outside the schedule
    #[cfg(test)]
    pub async fn poll_now(&self) {
        self.shared.poll_cycle().await;
    }
}

/// Clears the in-flight flag even if the poll future is dropped
struct PollGuard<'a>(&'a Shared);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().polling = false;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.running && inner.generation == generation
    }

    fn interval(&self) -> Duration {
        if self.foreground.load(Ordering::Relaxed) {
            self.timings.foreground_interval
        } else {
            self.timings.background_interval
        }
    }

    async fn run(self: Arc<Self>, generation: u64, wake: Arc<Notify>) {
        let mut delay = self.timings.initial_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => {}
            }
            if !self.is_current(generation) {
                break;
            }

            self.poll_cycle().await;

            if !self.is_current(generation) {
                break;
            }
            delay = self.interval();
        }
        tracing::trace!(generation, "Pairing poll loop exited");
    }

    async fn poll_cycle(&self) {
        {
            let mut inner = self.lock();
            if inner.polling {
                tracing::trace!("Pairing poll in flight, queueing another");
                if let Some(wake) = &inner.wake {
                    wake.notify_one();
                }
                return;
            }
            inner.polling = true;
        }

        let _guard = PollGuard(self);
        self.poll().await;
    }

    async fn poll(&self) {
        if !self.backend.is_running() {
            self.publish_empty();
            return;
        }

        let policy = self.policy.policy().await;
        if !policy.requires_pairing() {
            self.bootstrap.close();
            self.publish_empty();
            return;
        }

        let mut requests = match self.queue.list_pending().await {
            Ok(requests) => requests,
            Err(e) => {
                tracing::warn!("Failed to fetch pairing requests: {}", e);
                return;
            }
        };

        if policy.approved_user_count == 0 && self.bootstrap.is_active() {
            if let Some(candidate) = types::earliest_request(&requests).cloned() {
                requests = self.bootstrap_approve(candidate, requests).await;
            }
        }

        requests.sort_by(types::submission_order);
        let auto = self.lock().auto_approval.clone();
        self.publish(PairingApprovalState::new(requests, Utc::now(), auto.as_ref()));
    }

    /// Approve the first device of a fresh install. Spends the window whatever happens.
    async fn bootstrap_approve(
        &self,
        candidate: PairingRequest,
        requests: Vec<PairingRequest>,
    ) -> Vec<PairingRequest> {
        self.bootstrap.consume(&candidate.id);

        if let Err(e) = self.queue.approve(&candidate).await {
            tracing::warn!(code = %candidate.code, "Bootstrap auto-approval failed: {}", e);
            return requests;
        }

        let name = candidate.display_name().to_string();
        tracing::info!(code = %candidate.code, "Auto-approved first pairing request from {}", name);
        self.lock().auto_approval = Some(AutoApproval {
            at: Utc::now(),
            name,
        });

        match self.queue.list_pending().await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!("Failed to refresh pairing requests after approval: {}", e);
                requests
                    .into_iter()
                    .filter(|r| r.code != candidate.code)
                    .collect()
            }
        }
    }

    fn publish_empty(&self) {
        let auto = self.lock().auto_approval.clone();
        self.publish(PairingApprovalState::empty(Utc::now(), auto.as_ref()));
    }

    fn publish(&self, state: PairingApprovalState) {
        let fingerprint = state.fingerprint();
        {
            let mut inner = self.lock();
            if inner.last_fingerprint.as_ref() == Some(&fingerprint) {
                return;
            }
            inner.last_fingerprint = Some(fingerprint);
        }
        tracing::debug!(pending = state.pending_count, "Pairing approvals changed");
        self.sink.publish(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presentation::RecordingSink;
    use async_trait::async_trait;
    use queue::{ApprovalError, ApprovalPolicy, TimedBootstrapWindow};
    use std::sync::atomic::AtomicUsize;

    struct SwitchBackend(AtomicBool);

    impl BackendStatus for SwitchBackend {
        fn is_running(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        requests: Mutex<Vec<PairingRequest>>,
        approved: Mutex<Vec<String>>,
        list_calls: AtomicUsize,
        fail_list: AtomicBool,
        fail_approve: AtomicBool,
        latency: Duration,
    }

    impl FakeQueue {
        fn with(requests: Vec<PairingRequest>) -> Self {
            Self {
                requests: Mutex::new(requests),
                ..Default::default()
            }
        }

        fn push(&self, request: PairingRequest) {
            self.requests.lock().unwrap().push(request);
        }

        fn approved(&self) -> Vec<String> {
            self.approved.lock().unwrap().clone()
        }

        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ApprovalQueue for FakeQueue {
        async fn list_pending(&self) -> Result<Vec<PairingRequest>, ApprovalError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(ApprovalError::Rejected("offline".to_string()));
            }
            Ok(self.requests.lock().unwrap().clone())
        }

        async fn approve(&self, request: &PairingRequest) -> Result<(), ApprovalError> {
            if self.fail_approve.load(Ordering::SeqCst) {
                return Err(ApprovalError::Rejected("nope".to_string()));
            }
            self.approved.lock().unwrap().push(request.code.clone());
            self.requests
                .lock()
                .unwrap()
                .retain(|r| r.code != request.code);
            Ok(())
        }
    }

    /// Policy that never learns about approvals
    struct FixedPolicy(Mutex<ApprovalPolicy>);

    impl FixedPolicy {
        fn pairing() -> Self {
            Self(Mutex::new(ApprovalPolicy {
                enabled: true,
                dm_policy: Some("pairing".to_string()),
                approved_user_count: 0,
            }))
        }
    }

    #[async_trait]
    impl ApprovalPolicyReader for FixedPolicy {
        async fn policy(&self) -> ApprovalPolicy {
            self.0.lock().unwrap().clone()
        }
    }

    struct Fixture {
        monitor: PairingApprovalMonitor,
        backend: Arc<SwitchBackend>,
        queue: Arc<FakeQueue>,
        policy: Arc<FixedPolicy>,
        window: Arc<TimedBootstrapWindow>,
        sink: Arc<RecordingSink<PairingApprovalState>>,
    }

    fn fixture(queue: FakeQueue, window: TimedBootstrapWindow) -> Fixture {
        let backend = Arc::new(SwitchBackend(AtomicBool::new(true)));
        let queue = Arc::new(queue);
        let policy = Arc::new(FixedPolicy::pairing());
        let window = Arc::new(window);
        let sink = Arc::new(RecordingSink::new());
        let monitor = PairingApprovalMonitor::new(MonitorParams {
            timings: MonitorTimings::default(),
            backend: backend.clone(),
            queue: queue.clone(),
            policy: policy.clone(),
            bootstrap: window.clone(),
            sink: sink.clone(),
        });
        Fixture {
            monitor,
            backend,
            queue,
            policy,
            window,
            sink,
        }
    }

    fn request(code: &str, created_at: &str) -> PairingRequest {
        PairingRequest {
            id: format!("id-{}", code),
            code: code.to_string(),
            name: Some(format!("device {}", code)),
            created_at: Some(created_at.to_string()),
            last_seen_at: None,
        }
    }

    #[tokio::test]
    async fn test_identical_cycles_publish_once() {
        let f = fixture(
            FakeQueue::with(vec![request("AAAA", "2024-05-01T10:00:00Z")]),
            TimedBootstrapWindow::closed(),
        );

        f.monitor.poll_now().await;
        f.monitor.poll_now().await;
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.sink.last().unwrap().pending_count, 1);

        f.queue.push(request("BBBB", "2024-05-01T10:05:00Z"));
        f.monitor.poll_now().await;
        assert_eq!(f.sink.len(), 2);
        let codes: Vec<_> = f
            .sink
            .last()
            .unwrap()
            .requests
            .iter()
            .map(|r| r.code.clone())
            .collect();
        assert_eq!(codes, ["AAAA", "BBBB"]);
    }

    #[tokio::test]
    async fn test_bootstrap_approves_earliest_once() {
        let f = fixture(
            FakeQueue::with(vec![
                request("LATE", "2024-05-01T10:00:09Z"),
                request("EARLY", "2024-05-01T10:00:01Z"),
            ]),
            TimedBootstrapWindow::open_for(Duration::from_secs(600)),
        );

        f.monitor.poll_now().await;
        assert_eq!(f.queue.approved(), ["EARLY"]);
        assert!(!f.window.is_active());
        assert_eq!(f.window.consumed_by().as_deref(), Some("id-EARLY"));

        let state = f.sink.last().unwrap();
        assert_eq!(state.pending_count, 1);
        assert_eq!(state.requests[0].code, "LATE");
        assert_eq!(state.last_auto_approved_name.as_deref(), Some("device EARLY"));
        assert!(state.last_auto_approved_at.is_some());

        // Policy still reports zero approved users; the spent window prevents a repeat
        f.queue.push(request("NEXT", "2024-05-01T09:00:00Z"));
        f.monitor.poll_now().await;
        assert_eq!(f.queue.approved(), ["EARLY"]);
        assert_eq!(f.sink.last().unwrap().pending_count, 2);
    }

    #[tokio::test]
    async fn test_failed_bootstrap_approval_still_spends_window() {
        let queue = FakeQueue::with(vec![request("ONLY", "2024-05-01T10:00:00Z")]);
        queue.fail_approve.store(true, Ordering::SeqCst);
        let f = fixture(queue, TimedBootstrapWindow::open_for(Duration::from_secs(600)));

        f.monitor.poll_now().await;
        assert!(f.queue.approved().is_empty());
        assert!(!f.window.is_active());
        let state = f.sink.last().unwrap();
        assert_eq!(state.pending_count, 1);
        assert!(state.last_auto_approved_name.is_none());
    }

    #[tokio::test]
    async fn test_no_bootstrap_when_users_already_approved() {
        let f = fixture(
            FakeQueue::with(vec![request("AAAA", "2024-05-01T10:00:00Z")]),
            TimedBootstrapWindow::open_for(Duration::from_secs(600)),
        );
        f.policy.0.lock().unwrap().approved_user_count = 2;

        f.monitor.poll_now().await;
        assert!(f.queue.approved().is_empty());
        assert!(f.window.is_active());
    }

    #[tokio::test]
    async fn test_empty_window_stays_open_until_a_request_arrives() {
        let f = fixture(
            FakeQueue::default(),
            TimedBootstrapWindow::open_for(Duration::from_secs(600)),
        );
        f.monitor.poll_now().await;
        assert!(f.window.is_active());
        assert_eq!(f.sink.last().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_backend_down_publishes_empty_without_fetching() {
        let f = fixture(
            FakeQueue::with(vec![request("AAAA", "2024-05-01T10:00:00Z")]),
            TimedBootstrapWindow::closed(),
        );
        f.monitor.poll_now().await;
        assert_eq!(f.sink.last().unwrap().pending_count, 1);

        f.backend.0.store(false, Ordering::SeqCst);
        f.monitor.poll_now().await;
        assert_eq!(f.queue.list_calls(), 1);
        assert_eq!(f.sink.len(), 2);
        assert_eq!(f.sink.last().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_policy_closes_window() {
        let f = fixture(
            FakeQueue::with(vec![request("AAAA", "2024-05-01T10:00:00Z")]),
            TimedBootstrapWindow::open_for(Duration::from_secs(600)),
        );
        f.policy.0.lock().unwrap().dm_policy = Some("open".to_string());

        f.monitor.poll_now().await;
        assert!(!f.window.is_active());
        assert_eq!(f.queue.list_calls(), 0);
        assert!(f.queue.approved().is_empty());
        assert_eq!(f.sink.last().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_last_state() {
        let f = fixture(
            FakeQueue::with(vec![request("AAAA", "2024-05-01T10:00:00Z")]),
            TimedBootstrapWindow::closed(),
        );
        f.monitor.poll_now().await;
        assert_eq!(f.sink.len(), 1);

        f.queue.fail_list.store(true, Ordering::SeqCst);
        f.monitor.poll_now().await;
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.sink.last().unwrap().pending_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_follows_foreground() {
        let f = fixture(FakeQueue::default(), TimedBootstrapWindow::closed());
        f.monitor.start();
        f.monitor.start();

        tokio::time::sleep(Duration::from_millis(799)).await;
        assert_eq!(f.queue.list_calls(), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(f.queue.list_calls(), 1);

        // Background cadence
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(f.queue.list_calls(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.queue.list_calls(), 2);

        // Foreground applies from the next scheduling decision
        f.monitor.set_foreground(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.queue.list_calls(), 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.queue.list_calls(), 4);

        f.monitor.stop();
        assert!(!f.monitor.is_running());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.queue.list_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_poll_queues_one_repoll() {
        let queue = FakeQueue {
            latency: Duration::from_secs(5),
            ..Default::default()
        };
        let f = fixture(queue, TimedBootstrapWindow::closed());
        f.monitor.start();

        // First poll runs 0.8s..5.8s
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.queue.list_calls(), 1);
        f.monitor.trigger_now();
        f.monitor.trigger_now();
        f.monitor.trigger_now();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.queue.list_calls(), 2);

        // The follow-up poll ends at 10.8s; nothing else is queued
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.queue.list_calls(), 2);
        f.monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_when_idle_polls_immediately() {
        let f = fixture(FakeQueue::default(), TimedBootstrapWindow::closed());
        f.monitor.trigger_now();
        tokio::task::yield_now().await;
        assert_eq!(f.queue.list_calls(), 0);

        f.monitor.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.queue.list_calls(), 1);

        f.monitor.trigger_now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.queue.list_calls(), 2);
        f.monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_poll_finish() {
        let queue = FakeQueue {
            requests: Mutex::new(vec![request("AAAA", "2024-05-01T10:00:00Z")]),
            latency: Duration::from_secs(5),
            ..Default::default()
        };
        let f = fixture(queue, TimedBootstrapWindow::closed());
        f.monitor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.monitor.stop();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.sink.last().unwrap().pending_count, 1);
        assert_eq!(f.queue.list_calls(), 1);
    }
}
