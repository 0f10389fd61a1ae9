//! Self-update of the launcher.
//!
//! This module handles:
//! - The update banner shown to the user (`banner`)
//! - Finding and downloading new releases from GitHub (`delivery`, `download`)
//! - Scheduling checks and de-duplicating downloads (`orchestrator`)

pub mod banner;
pub mod delivery;
mod download;
mod orchestrator;

use thiserror::Error;

pub use banner::{UpdateBannerState, can_start_update_download};
pub use delivery::{DeliveryEvent, GitHubReleaseDelivery, UpdateDelivery, UpdateInfo};
pub use download::download_dir;
pub use orchestrator::{
    LogNotifier, UpdateCheckOutcome, UpdateNotice, UpdateOrchestrator, UpdateSchedule,
    UserNotifier,
};

/// Errors that can occur while checking for or applying updates
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Update request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Release {0} has no installer for this platform")]
    NoAsset(String),

    #[error("No update has been found to download")]
    NothingToDownload,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to launch installer: {0}")]
    Install(String),
}

/// Progress of an installer download
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    /// Completion in percent (0 - 100); zero while the size is unknown
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_downloaded as f64 / self.total_bytes as f64 * 100.0
        }
    }
}
