//! Diagnostic and debugging commands

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::cli::output::{OutputFormat, format_size, print_formatted, print_success, status_line};
use crate::config::Config;
use crate::config_store::GatewayConfigStore;
use crate::gateway::health::{HealthProbe, HttpHealthProbe};
use crate::gateway::runtime::RuntimeLayout;
use crate::update;

#[derive(Subcommand, Debug)]
pub enum DiagCommands {
    /// Show all data paths (config, gateway document, downloads)
    Paths,

    /// Verify installation health
    Check,

    /// Delete downloaded installers
    ClearDownloads,
}

#[derive(Serialize)]
struct PathsResult {
    config_file: String,
    gateway_document: String,
    data_dir: String,
    downloads_dir: String,
}

#[derive(Serialize)]
struct CheckResult {
    config_valid: bool,
    gateway_document_valid: bool,
    auth_token_present: bool,
    runtime_resolved: bool,
    runtime_error: Option<String>,
    gateway_port: u16,
    gateway_responding: bool,
    downloads_count: usize,
    downloads_size_bytes: u64,
}

pub async fn run(command: DiagCommands, format: OutputFormat, quiet: bool) -> Result<()> {
    match command {
        DiagCommands::Paths => paths(format),
        DiagCommands::Check => check(format).await,
        DiagCommands::ClearDownloads => clear_downloads(quiet).await,
    }
}

fn display_path(path: Result<std::path::PathBuf>) -> String {
    path.map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "<error>".to_string())
}

fn paths(format: OutputFormat) -> Result<()> {
    let result = PathsResult {
        config_file: display_path(Config::config_path()),
        gateway_document: display_path(
            GatewayConfigStore::default_location().map(|s| s.path().to_path_buf()),
        ),
        data_dir: display_path(crate::config::data_dir()),
        downloads_dir: display_path(update::download_dir()),
    };

    print_formatted(&result, format, |r| {
        [
            format!("Config file:       {}", r.config_file),
            format!("Gateway document:  {}", r.gateway_document),
            format!("Data dir:          {}", r.data_dir),
            format!("Downloads dir:     {}", r.downloads_dir),
        ]
        .join("\n")
    });

    Ok(())
}

/// Count and total size of the regular files directly under `dir`
fn dir_usage(dir: &Path) -> (usize, u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (0, 0);
    };

    entries
        .filter_map(|entry| entry.ok()?.metadata().ok())
        .filter(|meta| meta.is_file())
        .fold((0, 0), |(count, size), meta| (count + 1, size + meta.len()))
}

async fn check(format: OutputFormat) -> Result<()> {
    let config = Config::load().ok();
    let store = GatewayConfigStore::default_location()?;
    let doc = store.load().ok();

    let (runtime_resolved, runtime_error) = match &config {
        Some(config) => {
            let layout = RuntimeLayout::from_config(&config.gateway);
            match layout.resolve(0, "") {
                Ok(_) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            }
        }
        None => (false, Some("configuration could not be read".to_string())),
    };

    let port = doc.as_ref().map(|d| d.gateway.port).unwrap_or_default();
    let probe_timeout = config
        .as_ref()
        .map(|c| c.gateway.probe_timeout_ms)
        .unwrap_or(2_000);
    let gateway_responding = port != 0
        && HttpHealthProbe::new(Duration::from_millis(probe_timeout))?
            .is_ready(port)
            .await;

    let (downloads_count, downloads_size_bytes) = update::download_dir()
        .map(|dir| dir_usage(&dir))
        .unwrap_or((0, 0));

    let result = CheckResult {
        config_valid: config.is_some(),
        gateway_document_valid: doc.is_some(),
        auth_token_present: doc
            .as_ref()
            .and_then(|d| d.gateway.auth.token.as_deref())
            .is_some_and(|t| !t.is_empty()),
        runtime_resolved,
        runtime_error,
        gateway_port: port,
        gateway_responding,
        downloads_count,
        downloads_size_bytes,
    };

    print_formatted(&result, format, |r| {
        let mut lines = vec![
            status_line(r.config_valid, "Launcher config readable"),
            status_line(r.gateway_document_valid, "Gateway document readable"),
            status_line(r.auth_token_present, "Auth token present"),
        ];

        match &r.runtime_error {
            None => lines.push(status_line(r.runtime_resolved, "Gateway runtime found")),
            Some(e) => lines.push(status_line(false, &format!("Gateway runtime found ({})", e))),
        }

        lines.push(status_line(
            r.gateway_responding,
            &format!("Gateway responding on port {}", r.gateway_port),
        ));
        lines.push(format!(
            "     {} downloaded installer(s), {}",
            r.downloads_count,
            format_size(r.downloads_size_bytes)
        ));

        lines.join("\n")
    });

    Ok(())
}

async fn clear_downloads(quiet: bool) -> Result<()> {
    let dir = update::download_dir()?;
    let (count, size) = dir_usage(&dir);

    if tokio::fs::try_exists(&dir).await? {
        tokio::fs::remove_dir_all(&dir).await?;
    }

    print_success(
        &format!("Removed {} installer(s), freed {}", count, format_size(size)),
        quiet,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_usage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.exe"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b.dmg"), vec![0u8; 50]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(dir_usage(dir.path()), (2, 150));
        assert_eq!(dir_usage(&dir.path().join("missing")), (0, 0));
    }
}
