//! Configuration management commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::cli::output::{OutputFormat, print_formatted, print_success};
use crate::config::Config;
use crate::config_store::GatewayConfigStore;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Get a specific config value
    Get {
        /// Config key (e.g., "gateway.port", "pairing.foreground_interval_ms")
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key (e.g., "gateway.auto_start", "updates.allow_prerelease")
        key: String,

        /// Value to set (empty clears optional paths)
        value: String,
    },

    /// Show config file paths
    Path,
}

#[derive(Serialize)]
struct ConfigPathResult {
    path: String,
    exists: bool,
    gateway_document: String,
    gateway_document_exists: bool,
}

/// `gateway.port` lives in the gateway's own document, not the launcher config
const GATEWAY_PORT_KEY: &str = "gateway.port";

pub async fn run(command: ConfigCommands, format: OutputFormat, quiet: bool) -> Result<()> {
    match command {
        ConfigCommands::Show => show(format),
        ConfigCommands::Get { key } => get(&key, format),
        ConfigCommands::Set { key, value } => set(&key, &value, quiet),
        ConfigCommands::Path => path(format),
    }
}

fn show(format: OutputFormat) -> Result<()> {
    let config = Config::load()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn get(key: &str, format: OutputFormat) -> Result<()> {
    let value = if key == GATEWAY_PORT_KEY {
        GatewayConfigStore::default_location()?
            .load()?
            .gateway
            .port
            .to_string()
    } else {
        get_config_value(&Config::load()?, key)?
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&value)?),
        OutputFormat::Text => println!("{}", value),
    }

    Ok(())
}

fn optional(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "<not set>".to_string())
}

fn get_config_value(config: &Config, key: &str) -> Result<String> {
    let parts: Vec<&str> = key.split('.').collect();
    let gateway = &config.gateway;
    let pairing = &config.pairing;
    let updates = &config.updates;

    let value = match parts.as_slice() {
        ["gateway", "executable"] => optional(&gateway.executable),
        ["gateway", "entry"] => optional(&gateway.entry),
        ["gateway", "runtime_dir"] => optional(&gateway.runtime_dir),
        ["gateway", "working_dir"] => optional(&gateway.working_dir),
        ["gateway", "auto_start"] => gateway.auto_start.to_string(),
        ["gateway", "crash_cooldown_ms"] => gateway.crash_cooldown_ms.to_string(),
        ["gateway", "health_timeout_ms"] => gateway.health_timeout_ms.to_string(),
        ["gateway", "health_poll_interval_ms"] => gateway.health_poll_interval_ms.to_string(),
        ["gateway", "probe_timeout_ms"] => gateway.probe_timeout_ms.to_string(),
        ["gateway", "stop_grace_ms"] => gateway.stop_grace_ms.to_string(),
        ["gateway", "restart_delay_ms"] => gateway.restart_delay_ms.to_string(),
        ["pairing", "foreground_interval_ms"] => pairing.foreground_interval_ms.to_string(),
        ["pairing", "background_interval_ms"] => pairing.background_interval_ms.to_string(),
        ["pairing", "initial_delay_ms"] => pairing.initial_delay_ms.to_string(),
        ["pairing", "bootstrap_window_ms"] => pairing.bootstrap_window_ms.to_string(),
        ["updates", "check_on_startup"] => updates.check_on_startup.to_string(),
        ["updates", "startup_delay_ms"] => updates.startup_delay_ms.to_string(),
        ["updates", "check_interval_ms"] => updates.check_interval_ms.to_string(),
        ["updates", "repository"] => updates.repository.clone(),
        ["updates", "allow_prerelease"] => updates.allow_prerelease.to_string(),
        _ => anyhow::bail!("Unknown config key: {}", key),
    };

    Ok(value)
}

fn set(key: &str, value: &str, quiet: bool) -> Result<()> {
    if key == GATEWAY_PORT_KEY {
        let store = GatewayConfigStore::default_location()?;
        let mut doc = store.load()?;
        doc.gateway.port = value.parse()?;
        store.save(&doc)?;
    } else {
        let mut config = Config::load()?;
        set_config_value(&mut config, key, value)?;
        config.save()?;
    }

    print_success(&format!("Set {} = {}", key, value), quiet);
    Ok(())
}

fn optional_path(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse a polling interval, which must be positive
fn parse_interval(key: &str, value: &str) -> Result<u64> {
    let ms: u64 = value.parse()?;
    if ms == 0 {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(ms)
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let gateway = &mut config.gateway;
    let pairing = &mut config.pairing;
    let updates = &mut config.updates;

    match parts.as_slice() {
        ["gateway", "executable"] => gateway.executable = optional_path(value),
        ["gateway", "entry"] => gateway.entry = optional_path(value),
        ["gateway", "runtime_dir"] => gateway.runtime_dir = optional_path(value),
        ["gateway", "working_dir"] => gateway.working_dir = optional_path(value),
        ["gateway", "auto_start"] => gateway.auto_start = value.parse()?,
        ["gateway", "crash_cooldown_ms"] => gateway.crash_cooldown_ms = value.parse()?,
        ["gateway", "health_timeout_ms"] => gateway.health_timeout_ms = value.parse()?,
        ["gateway", "health_poll_interval_ms"] => {
            gateway.health_poll_interval_ms = parse_interval(key, value)?
        }
        ["gateway", "probe_timeout_ms"] => gateway.probe_timeout_ms = value.parse()?,
        ["gateway", "stop_grace_ms"] => gateway.stop_grace_ms = value.parse()?,
        ["gateway", "restart_delay_ms"] => gateway.restart_delay_ms = value.parse()?,
        ["pairing", "foreground_interval_ms"] => {
            pairing.foreground_interval_ms = parse_interval(key, value)?
        }
        ["pairing", "background_interval_ms"] => {
            pairing.background_interval_ms = parse_interval(key, value)?
        }
        ["pairing", "initial_delay_ms"] => pairing.initial_delay_ms = value.parse()?,
        ["pairing", "bootstrap_window_ms"] => pairing.bootstrap_window_ms = value.parse()?,
        ["updates", "check_on_startup"] => updates.check_on_startup = value.parse()?,
        ["updates", "startup_delay_ms"] => updates.startup_delay_ms = value.parse()?,
        ["updates", "check_interval_ms"] => updates.check_interval_ms = parse_interval(key, value)?,
        ["updates", "repository"] => {
            if !value.contains('/') {
                anyhow::bail!("Repository must look like owner/name");
            }
            updates.repository = value.to_string();
        }
        ["updates", "allow_prerelease"] => updates.allow_prerelease = value.parse()?,
        _ => anyhow::bail!("Unknown or read-only config key: {}", key),
    }

    Ok(())
}

fn path(format: OutputFormat) -> Result<()> {
    let path = Config::config_path()?;
    let store = GatewayConfigStore::default_location()?;

    let result = ConfigPathResult {
        path: path.to_string_lossy().to_string(),
        exists: path.exists(),
        gateway_document: store.path().to_string_lossy().to_string(),
        gateway_document_exists: store.path().exists(),
    };

    print_formatted(&result, format, |r| {
        let mark = |exists: bool| if exists { "" } else { " (not found)" };
        format!(
            "{}{}\n{}{}",
            r.path,
            mark(r.exists),
            r.gateway_document,
            mark(r.gateway_document_exists)
        )
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let mut config = Config::default();
        set_config_value(&mut config, "gateway.crash_cooldown_ms", "7500").unwrap();
        set_config_value(&mut config, "updates.allow_prerelease", "true").unwrap();
        set_config_value(&mut config, "gateway.executable", "/opt/node").unwrap();

        assert_eq!(get_config_value(&config, "gateway.crash_cooldown_ms").unwrap(), "7500");
        assert_eq!(get_config_value(&config, "updates.allow_prerelease").unwrap(), "true");
        assert_eq!(get_config_value(&config, "gateway.executable").unwrap(), "/opt/node");

        set_config_value(&mut config, "gateway.executable", "").unwrap();
        assert_eq!(get_config_value(&config, "gateway.executable").unwrap(), "<not set>");
    }

    #[test]
    fn test_rejects_bad_keys_and_values() {
        let mut config = Config::default();
        assert!(set_config_value(&mut config, "gateway.nonsense", "1").is_err());
        assert!(set_config_value(&mut config, "gateway.auto_start", "maybe").is_err());
        assert!(set_config_value(&mut config, "updates.repository", "noslash").is_err());
        assert!(set_config_value(&mut config, "updates.check_interval_ms", "0").is_err());
        assert!(set_config_value(&mut config, "gateway.health_poll_interval_ms", "0").is_err());
        assert_eq!(config.updates.check_interval_ms, 4 * 60 * 60 * 1_000);
        assert!(get_config_value(&config, "pairing").is_err());
    }
}
