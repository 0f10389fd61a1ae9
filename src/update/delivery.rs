//! Where updates come from.
//!
//! [`UpdateDelivery`] checks for, downloads and installs new launcher
//! versions, and broadcasts [`DeliveryEvent`]s as it goes. The orchestrator
//! drives the banner from those events alone.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};

use crate::github::{self, GitHubClient, Platform, ReleaseAsset};

use super::download;
use super::{DownloadProgress, UpdateError};

/// A version offered by the release channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub version: String,
    pub notes: Option<String>,
}

/// Progress of an update as it happens
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    CheckingForUpdate,
    UpdateAvailable(UpdateInfo),
    UpdateNotAvailable,
    DownloadProgress(DownloadProgress),
    UpdateDownloaded(UpdateInfo),
    Error(String),
}

#[async_trait]
pub trait UpdateDelivery: Send + Sync {
    /// Receive events from now on
    fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent>;

    /// Look for a newer version; `None` when up to date
    async fn check_for_updates(&self) -> Result<Option<UpdateInfo>, UpdateError>;

    /// Download the version found by the last check
    async fn download_update(&self) -> Result<(), UpdateError>;

    /// Hand over to the downloaded installer and ask the launcher to exit
    fn quit_and_install(&self) -> Result<(), UpdateError>;
}

/// Compare dotted versions with an optional `-prerelease` suffix.
///
/// Missing components count as zero; a release outranks its prereleases.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn split(v: &str) -> (Vec<u64>, Option<&str>) {
        let v = v.trim().trim_start_matches('v');
        let v = v.split('+').next().unwrap_or(v);
        let (core, pre) = match v.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (v, None),
        };
        let numbers = core
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect();
        (numbers, pre)
    }

    let (a_core, a_pre) = split(a);
    let (b_core, b_pre) = split(b);

    let len = a_core.len().max(b_core.len());
    for i in 0..len {
        let x = a_core.get(i).copied().unwrap_or(0);
        let y = b_core.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    match (a_pre, b_pre) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

struct PendingUpdate {
    info: UpdateInfo,
    asset: ReleaseAsset,
}

#[derive(Default)]
struct DeliveryState {
    pending: Option<PendingUpdate>,
    downloaded: Option<PathBuf>,
}

/// Updates published as GitHub releases of the launcher
pub struct GitHubReleaseDelivery {
    github: GitHubClient,
    current_version: String,
    allow_prerelease: bool,
    platform: Platform,
    download_dir: PathBuf,
    events: broadcast::Sender<DeliveryEvent>,
    state: Mutex<DeliveryState>,
    quit: Arc<Notify>,
}

impl GitHubReleaseDelivery {
    /// `quit` is notified once an installer has been launched
    pub fn new(
        github: GitHubClient,
        allow_prerelease: bool,
        download_dir: PathBuf,
        quit: Arc<Notify>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            github,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            allow_prerelease,
            platform: Platform::current(),
            download_dir,
            events,
            state: Mutex::new(DeliveryState::default()),
            quit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail(&self, error: UpdateError) -> UpdateError {
        self.emit(DeliveryEvent::Error(error.to_string()));
        error
    }

    async fn find_update(&self) -> Result<Option<PendingUpdate>, UpdateError> {
        let Some(release) = self.github.latest_release(self.allow_prerelease).await? else {
            return Ok(None);
        };

        if compare_versions(release.version(), &self.current_version) != Ordering::Greater {
            tracing::debug!(
                "Latest release {} is not newer than {}",
                release.tag_name,
                self.current_version
            );
            return Ok(None);
        }

        let asset = github::find_platform_asset(&release, &self.platform)
            .cloned()
            .ok_or_else(|| UpdateError::NoAsset(release.tag_name.clone()))?;

        Ok(Some(PendingUpdate {
            info: UpdateInfo {
                version: release.version().to_string(),
                notes: release.body.clone(),
            },
            asset,
        }))
    }
}

#[async_trait]
impl UpdateDelivery for GitHubReleaseDelivery {
    fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    async fn check_for_updates(&self) -> Result<Option<UpdateInfo>, UpdateError> {
        self.emit(DeliveryEvent::CheckingForUpdate);

        let found = self.find_update().await.map_err(|e| self.fail(e))?;
        match found {
            Some(pending) => {
                let info = pending.info.clone();
                tracing::info!(
                    "Update {} available ({})",
                    info.version,
                    pending.asset.name
                );
                self.lock().pending = Some(pending);
                self.emit(DeliveryEvent::UpdateAvailable(info.clone()));
                Ok(Some(info))
            }
            None => {
                self.lock().pending = None;
                self.emit(DeliveryEvent::UpdateNotAvailable);
                Ok(None)
            }
        }
    }

    async fn download_update(&self) -> Result<(), UpdateError> {
        let (info, asset) = {
            let state = self.lock();
            let pending = state.pending.as_ref().ok_or(UpdateError::NothingToDownload)?;
            (pending.info.clone(), pending.asset.clone())
        };

        let dest = self.download_dir.join(&asset.name);
        tracing::info!("Downloading {} to {}", asset.name, dest.display());

        let result = download::download_asset(
            self.github.client(),
            &asset.browser_download_url,
            &dest,
            |progress| self.emit(DeliveryEvent::DownloadProgress(progress)),
        )
        .await
        .map_err(|e| self.fail(e))?;

        tracing::info!(bytes = result.bytes, "Installer saved to {}", result.file_path.display());
        self.lock().downloaded = Some(result.file_path);
        self.emit(DeliveryEvent::UpdateDownloaded(info));
        Ok(())
    }

    fn quit_and_install(&self) -> Result<(), UpdateError> {
        let installer = self
            .lock()
            .downloaded
            .clone()
            .ok_or(UpdateError::NothingToDownload)?;

        tracing::info!("Launching installer {}", installer.display());
        open::that_detached(&installer).map_err(|e| UpdateError::Install(e.to_string()))?;
        self.quit.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2.0", "1.1.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2.0-beta.1", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2.0-beta.2", "1.2.0-beta.1"), Ordering::Greater);
        assert_eq!(compare_versions("1.2.0+build.7", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.9.0", "1.0.0"), Ordering::Less);
    }

    #[tokio::test]
    async fn test_download_without_check_fails() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = GitHubReleaseDelivery::new(
            GitHubClient::new("owner/repo").unwrap(),
            false,
            dir.path().to_path_buf(),
            Arc::new(Notify::new()),
        );
        assert!(matches!(
            delivery.download_update().await,
            Err(UpdateError::NothingToDownload)
        ));
        assert!(matches!(
            delivery.quit_and_install(),
            Err(UpdateError::NothingToDownload)
        ));
    }
}
