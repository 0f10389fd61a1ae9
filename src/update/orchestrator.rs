//! Scheduling update checks and gating downloads.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MIN_INTERVAL;
use crate::presentation::StateSink;

use super::banner::{self, BannerEvent, BannerStatus, UpdateBannerState};
use super::delivery::{DeliveryEvent, UpdateDelivery};

/// When background checks run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSchedule {
    /// Delay before the first check, keeping it clear of gateway startup
    pub startup_delay: Duration,
    pub check_interval: Duration,
}

impl Default for UpdateSchedule {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_millis(10_000),
            check_interval: Duration::from_millis(4 * 60 * 60 * 1_000),
        }
    }
}

/// Result of an update check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheckOutcome {
    UpToDate,
    Available(String),
    Failed(String),
}

/// Something the user should be told directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateNotice {
    UpToDate { current: String },
    Available { version: String },
    CheckFailed(String),
    DownloadFailed(String),
    InstallFailed(String),
}

/// Surfaces notices to the user (dialog, notification, terminal)
pub trait UserNotifier: Send + Sync {
    fn notify(&self, notice: &UpdateNotice);
}

/// Notifier that only logs
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn notify(&self, notice: &UpdateNotice) {
        match notice {
            UpdateNotice::UpToDate { current } => {
                tracing::info!("Launcher {} is up to date", current)
            }
            UpdateNotice::Available { version } => tracing::info!("Update {} available", version),
            UpdateNotice::CheckFailed(e) => tracing::error!("Update check failed: {}", e),
            UpdateNotice::DownloadFailed(e) => tracing::error!("Update download failed: {}", e),
            UpdateNotice::InstallFailed(e) => tracing::error!("Update install failed: {}", e),
        }
    }
}

type DownloadFuture = Shared<BoxFuture<'static, bool>>;

/// Drives update checks and the update banner. Cheap to clone.
#[derive(Clone)]
pub struct UpdateOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    delivery: Arc<dyn UpdateDelivery>,
    schedule: UpdateSchedule,
    sink: Arc<dyn StateSink<UpdateBannerState>>,
    notifier: Arc<dyn UserNotifier>,
    banner: Mutex<UpdateBannerState>,
    in_flight: Mutex<Option<DownloadFuture>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl UpdateOrchestrator {
    pub fn new(
        delivery: Arc<dyn UpdateDelivery>,
        schedule: UpdateSchedule,
        sink: Arc<dyn StateSink<UpdateBannerState>>,
        notifier: Arc<dyn UserNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                delivery,
                schedule,
                sink,
                notifier,
                banner: Mutex::new(UpdateBannerState::hidden()),
                in_flight: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn banner(&self) -> UpdateBannerState {
        lock(&self.inner.banner).clone()
    }

    /// Follow delivery events and, if `schedule_checks`, check periodically.
    /// A no-op when already started.
    pub fn start(&self, schedule_checks: bool) {
        let mut tasks = lock(&self.inner.tasks);
        if !tasks.is_empty() {
            tracing::debug!("Update orchestrator already started");
            return;
        }

        let events = self.inner.delivery.subscribe();
        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.pump_events(events).await }));

        if schedule_checks {
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.run_schedule().await }));
        }
    }

    /// Cancel scheduled checks and stop following events
    pub fn stop(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }

    async fn run_schedule(&self) {
        let schedule = self.inner.schedule;
        let first = tokio::time::Instant::now() + schedule.startup_delay;
        // interval_at panics on a zero period
        let period = schedule.check_interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.check_for_updates(false).await;
        }
    }

    async fn pump_events(&self, mut events: broadcast::Receiver<DeliveryEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_delivery_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Update events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Apply one delivery event to the banner
    pub(crate) fn handle_delivery_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::CheckingForUpdate => tracing::debug!("Checking for updates"),
            DeliveryEvent::UpdateAvailable(info) => self.apply(BannerEvent::UpdateAvailable {
                version: Some(info.version),
            }),
            DeliveryEvent::UpdateNotAvailable => self.apply(BannerEvent::UpdateNotAvailable),
            DeliveryEvent::DownloadProgress(progress) => self.apply(BannerEvent::DownloadProgress {
                percent: progress.percent(),
            }),
            DeliveryEvent::UpdateDownloaded(info) => {
                tracing::info!("Update {} downloaded, installing", info.version);
                self.apply(BannerEvent::DownloadFinished);
                if let Err(e) = self.inner.delivery.quit_and_install() {
                    tracing::error!("Failed to install update: {}", e);
                    self.inner
                        .notifier
                        .notify(&UpdateNotice::InstallFailed(e.to_string()));
                }
            }
            DeliveryEvent::Error(message) => tracing::warn!("Update error: {}", message),
        }
    }

    /// Check for a newer version. Manual checks report the outcome to the user.
    ///
    /// Background checks are skipped while a download is running.
    pub async fn check_for_updates(&self, manual: bool) -> UpdateCheckOutcome {
        if !manual && self.is_downloading() {
            tracing::debug!("Skipping background update check during download");
            return UpdateCheckOutcome::Available(self.banner().version.unwrap_or_default());
        }

        let outcome = match self.inner.delivery.check_for_updates().await {
            Ok(Some(info)) => UpdateCheckOutcome::Available(info.version),
            Ok(None) => UpdateCheckOutcome::UpToDate,
            Err(e) => {
                tracing::warn!("Update check failed: {}", e);
                UpdateCheckOutcome::Failed(e.to_string())
            }
        };

        if manual {
            let notice = match &outcome {
                UpdateCheckOutcome::UpToDate => UpdateNotice::UpToDate {
                    current: env!("CARGO_PKG_VERSION").to_string(),
                },
                UpdateCheckOutcome::Available(version) => UpdateNotice::Available {
                    version: version.clone(),
                },
                UpdateCheckOutcome::Failed(e) => UpdateNotice::CheckFailed(e.clone()),
            };
            self.inner.notifier.notify(&notice);
        }

        outcome
    }

    /// Download the available update; installation follows the download event.
    ///
    /// Concurrent callers share one download and its result. Returns `false`
    /// straight away when there is nothing to download.
    pub async fn download_and_install_update(&self) -> bool {
        let download = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(download) => download.clone(),
                None => {
                    if !banner::can_start_update_download(&self.banner()) {
                        tracing::debug!("No update to download");
                        return false;
                    }
                    let this = self.clone();
                    let download = async move { this.run_download().await }.boxed().shared();
                    *slot = Some(download.clone());
                    download
                }
            }
        };
        download.await
    }

    async fn run_download(&self) -> bool {
        self.apply(BannerEvent::DownloadStarted);

        let ok = match self.inner.delivery.download_update().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Update download failed: {}", e);
                self.apply(BannerEvent::DownloadFailed);
                self.inner
                    .notifier
                    .notify(&UpdateNotice::DownloadFailed(e.to_string()));
                false
            }
        };

        *lock(&self.inner.in_flight) = None;
        ok
    }

    fn is_downloading(&self) -> bool {
        lock(&self.inner.in_flight).is_some()
            || self.banner().status == BannerStatus::Downloading
    }

    fn apply(&self, event: BannerEvent) {
        let next = {
            let mut current = lock(&self.inner.banner);
            let next = banner::reduce(&current, &event);
            if next == *current {
                return;
            }
            *current = next.clone();
            next
        };
        tracing::debug!(?event, status = ?next.status, "Update banner changed");
        self.inner.sink.publish(&next);
    }
}
