//! The update banner: a pure reduction of update events into what the UI shows.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerStatus {
    #[default]
    Hidden,
    Available,
    Downloading,
}

/// UI-facing update status.
///
/// `Available` always carries a version, `Downloading` never shows the badge,
/// and `Hidden` carries nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBannerState {
    pub status: BannerStatus,
    pub version: Option<String>,
    pub percent: Option<f64>,
    pub show_badge: bool,
}

/// Events the banner reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum BannerEvent {
    UpdateAvailable { version: Option<String> },
    UpdateNotAvailable,
    DownloadStarted,
    DownloadProgress { percent: f64 },
    DownloadFailed,
    DownloadFinished,
}

impl UpdateBannerState {
    pub fn hidden() -> Self {
        Self::default()
    }

    fn available(version: String) -> Self {
        Self {
            status: BannerStatus::Available,
            version: Some(version),
            percent: None,
            show_badge: true,
        }
    }
}

/// Compute the next banner state. Pure; events that do not apply leave the state unchanged.
pub fn reduce(state: &UpdateBannerState, event: &BannerEvent) -> UpdateBannerState {
    match event {
        BannerEvent::UpdateAvailable { version } => {
            let version = version
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .or_else(|| state.version.clone());
            match version {
                Some(version) => UpdateBannerState::available(version),
                // Nothing to show without a version
                None => state.clone(),
            }
        }
        BannerEvent::UpdateNotAvailable | BannerEvent::DownloadFinished => {
            UpdateBannerState::hidden()
        }
        BannerEvent::DownloadStarted => {
            if !can_start_update_download(state) {
                return state.clone();
            }
            UpdateBannerState {
                status: BannerStatus::Downloading,
                version: state.version.clone(),
                percent: Some(0.0),
                show_badge: false,
            }
        }
        BannerEvent::DownloadProgress { percent } => {
            if state.status != BannerStatus::Downloading || percent.is_nan() {
                return state.clone();
            }
            UpdateBannerState {
                percent: Some(percent.clamp(0.0, 100.0)),
                ..state.clone()
            }
        }
        BannerEvent::DownloadFailed => match &state.version {
            Some(version) => UpdateBannerState::available(version.clone()),
            None => UpdateBannerState::hidden(),
        },
    }
}

/// Whether a download may be started from this state
pub fn can_start_update_download(state: &UpdateBannerState) -> bool {
    state.status == BannerStatus::Available && state.version.is_some()
}
