//! Update management commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::cli::output::{OutputFormat, print_error, print_formatted, print_success};
use crate::config::Config;
use crate::github::GitHubClient;
use crate::presentation::{FnSink, NullSink};
use crate::update::banner::BannerStatus;
use crate::update::{
    self, GitHubReleaseDelivery, UpdateBannerState, UpdateCheckOutcome, UpdateNotice,
    UpdateOrchestrator, UserNotifier,
};

/// How long to wait for the installer hand-over after a finished download
const INSTALL_HANDOVER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Subcommand, Debug)]
pub enum UpdateCommands {
    /// Check for a newer launcher release
    Check,

    /// Download the newest release and launch its installer
    Apply,
}

#[derive(Serialize)]
struct CheckResult {
    current_version: String,
    latest_version: Option<String>,
    update_available: bool,
    error: Option<String>,
}

impl From<&UpdateCheckOutcome> for CheckResult {
    fn from(outcome: &UpdateCheckOutcome) -> Self {
        let (latest_version, error) = match outcome {
            UpdateCheckOutcome::UpToDate => (None, None),
            UpdateCheckOutcome::Available(version) => (Some(version.clone()), None),
            UpdateCheckOutcome::Failed(e) => (None, Some(e.clone())),
        };
        Self {
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            update_available: latest_version.is_some(),
            latest_version,
            error,
        }
    }
}

/// Prints notices to the terminal; JSON output carries its own result
struct TerminalNotifier {
    format: OutputFormat,
    quiet: bool,
}

impl UserNotifier for TerminalNotifier {
    fn notify(&self, notice: &UpdateNotice) {
        if self.format == OutputFormat::Json {
            return;
        }
        match notice {
            UpdateNotice::UpToDate { current } => {
                print_success(&format!("Launcher {} is up to date", current), self.quiet)
            }
            UpdateNotice::Available { version } => {
                print_success(&format!("Update available: {}", version), self.quiet)
            }
            // Returned as the command's error
            UpdateNotice::CheckFailed(_) => {}
            UpdateNotice::DownloadFailed(e) => print_error(&format!("Download failed: {}", e)),
            UpdateNotice::InstallFailed(e) => print_error(&format!("Install failed: {}", e)),
        }
    }
}

pub async fn run(command: UpdateCommands, format: OutputFormat, quiet: bool) -> Result<()> {
    let config = Config::load()?;
    let quit = Arc::new(Notify::new());
    let delivery = GitHubReleaseDelivery::new(
        GitHubClient::new(config.updates.repository.clone())?,
        config.updates.allow_prerelease,
        update::download_dir()?,
        Arc::clone(&quit),
    );
    let notifier = Arc::new(TerminalNotifier { format, quiet });

    match command {
        UpdateCommands::Check => {
            let orchestrator = UpdateOrchestrator::new(
                Arc::new(delivery),
                config.updates.schedule(),
                Arc::new(NullSink),
                notifier,
            );
            check(&orchestrator, format).await
        }
        UpdateCommands::Apply => {
            let (banner_tx, banner_rx) = watch::channel(UpdateBannerState::hidden());
            let show_progress = format == OutputFormat::Text && !quiet;
            let sink = FnSink(move |state: &UpdateBannerState| {
                if show_progress && state.status == BannerStatus::Downloading {
                    if let Some(percent) = state.percent {
                        eprint!("\rDownloading... {:>5.1}%", percent);
                    }
                }
                banner_tx.send_replace(state.clone());
            });
            let orchestrator = UpdateOrchestrator::new(
                Arc::new(delivery),
                config.updates.schedule(),
                Arc::new(sink),
                notifier,
            );
            apply(&orchestrator, banner_rx, &quit, format, quiet).await
        }
    }
}

async fn check(orchestrator: &UpdateOrchestrator, format: OutputFormat) -> Result<()> {
    let outcome = orchestrator.check_for_updates(true).await;

    if format == OutputFormat::Json {
        print_formatted(&CheckResult::from(&outcome), format, |_| String::new());
    }

    match outcome {
        UpdateCheckOutcome::Failed(e) => anyhow::bail!("Update check failed: {}", e),
        _ => Ok(()),
    }
}

async fn apply(
    orchestrator: &UpdateOrchestrator,
    mut banner_rx: watch::Receiver<UpdateBannerState>,
    quit: &Notify,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    // The banner follows delivery events, which need the event pump
    orchestrator.start(false);

    let outcome = orchestrator.check_for_updates(true).await;
    if format == OutputFormat::Json {
        print_formatted(&CheckResult::from(&outcome), format, |_| String::new());
    }
    match outcome {
        UpdateCheckOutcome::Available(_) => {}
        UpdateCheckOutcome::UpToDate => {
            orchestrator.stop();
            return Ok(());
        }
        UpdateCheckOutcome::Failed(e) => {
            orchestrator.stop();
            anyhow::bail!("Update check failed: {}", e);
        }
    }

    banner_rx
        .wait_for(|state| state.status == BannerStatus::Available)
        .await
        .context("Update banner closed unexpectedly")?;

    if !orchestrator.download_and_install_update().await {
        orchestrator.stop();
        anyhow::bail!("Update download failed");
    }
    if format == OutputFormat::Text && !quiet {
        eprintln!();
    }

    let handed_over = tokio::time::timeout(INSTALL_HANDOVER_TIMEOUT, quit.notified()).await;
    orchestrator.stop();
    handed_over.map_err(|_| anyhow::anyhow!("Installer did not start"))?;

    print_success("Installer launched", quiet);
    Ok(())
}
