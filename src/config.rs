use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::SupervisorTimings;
use crate::pairing::MonitorTimings;
use crate::update::UpdateSchedule;

/// Launcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub updates: UpdateConfig,
}

/// Gateway process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Override for the runtime executable (bundled runtime is used when unset)
    #[serde(default)]
    pub executable: Option<String>,
    /// Override for the gateway entry script
    #[serde(default)]
    pub entry: Option<String>,
    /// Directory holding the bundled runtime and gateway sources
    #[serde(default)]
    pub runtime_dir: Option<String>,
    /// Working directory for the gateway process
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Start the gateway when the launcher starts
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_crash_cooldown_ms")]
    pub crash_cooldown_ms: u64,
    /// Long on purpose: cold starts behind antivirus scanners can take a minute
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            executable: None,
            entry: None,
            runtime_dir: None,
            working_dir: None,
            auto_start: true,
            crash_cooldown_ms: default_crash_cooldown_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            health_poll_interval_ms: default_health_poll_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn timings(&self) -> SupervisorTimings {
        SupervisorTimings {
            crash_cooldown: Duration::from_millis(self.crash_cooldown_ms),
            health_timeout: Duration::from_millis(self.health_timeout_ms),
            health_poll_interval: interval(self.health_poll_interval_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
        }
    }
}

/// Shortest period a polling interval may have
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A polling period; zero would spin or panic the timer
fn interval(ms: u64) -> Duration {
    Duration::from_millis(ms).max(MIN_INTERVAL)
}

fn default_true() -> bool {
    true
}

fn default_crash_cooldown_ms() -> u64 {
    5_000
}

fn default_health_timeout_ms() -> u64 {
    90_000
}

fn default_health_poll_interval_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

/// Pairing approval polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    #[serde(default = "default_foreground_interval_ms")]
    pub foreground_interval_ms: u64,
    #[serde(default = "default_background_interval_ms")]
    pub background_interval_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// How long the first-run auto-approval window stays open
    #[serde(default = "default_bootstrap_window_ms")]
    pub bootstrap_window_ms: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            foreground_interval_ms: default_foreground_interval_ms(),
            background_interval_ms: default_background_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            bootstrap_window_ms: default_bootstrap_window_ms(),
        }
    }
}

impl PairingConfig {
    pub fn timings(&self) -> MonitorTimings {
        MonitorTimings {
            foreground_interval: interval(self.foreground_interval_ms),
            background_interval: interval(self.background_interval_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
        }
    }
}

fn default_foreground_interval_ms() -> u64 {
    10_000
}

fn default_background_interval_ms() -> u64 {
    60_000
}

fn default_initial_delay_ms() -> u64 {
    800
}

fn default_bootstrap_window_ms() -> u64 {
    10 * 60 * 1_000
}

/// Self-update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Check for updates in the background
    #[serde(default = "default_true")]
    pub check_on_startup: bool,
    /// Delay before the first background check, so it does not compete with gateway startup
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// GitHub repository publishing launcher releases (owner/name)
    #[serde(default = "default_repository")]
    pub repository: String,
    /// Offer prereleases
    #[serde(default)]
    pub allow_prerelease: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_on_startup: true,
            startup_delay_ms: default_startup_delay_ms(),
            check_interval_ms: default_check_interval_ms(),
            repository: default_repository(),
            allow_prerelease: false,
        }
    }
}

impl UpdateConfig {
    pub fn schedule(&self) -> UpdateSchedule {
        UpdateSchedule {
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            check_interval: interval(self.check_interval_ms),
        }
    }
}

fn default_startup_delay_ms() -> u64 {
    10_000
}

fn default_check_interval_ms() -> u64 {
    4 * 60 * 60 * 1_000
}

fn default_repository() -> String {
    "gateway-launcher/gateway-launcher".to_string()
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = project_dirs()?.config_dir().to_path_buf();
        std::fs::create_dir_all(&config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

/// Per-user directories for the launcher
pub fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "gateway-launcher", "GatewayLauncher")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// Data directory (gateway config document, downloads)
pub fn data_dir() -> Result<PathBuf> {
    let dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
