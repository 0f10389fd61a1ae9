//! Locating the gateway runtime on disk and building its launch command.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::GatewayConfig;

use super::GatewayError;
use super::process::LaunchCommand;

/// Environment variable carrying the gateway auth token
pub const TOKEN_ENV: &str = "GATEWAY_AUTH_TOKEN";
/// Environment variable carrying the gateway port
pub const PORT_ENV: &str = "GATEWAY_PORT";

/// Relative location of the gateway entry script inside the runtime directory
const BUNDLED_ENTRY: &str = "gateway/index.js";

#[cfg(windows)]
const BUNDLED_RUNTIME_BIN: &str = "node.exe";
#[cfg(not(windows))]
const BUNDLED_RUNTIME_BIN: &str = "bin/node";

/// Where the gateway runtime lives
#[derive(Debug, Clone, Default)]
pub struct RuntimeLayout {
    pub executable: Option<PathBuf>,
    pub entry: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl RuntimeLayout {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            executable: config.executable.as_ref().map(PathBuf::from),
            entry: config.entry.as_ref().map(PathBuf::from),
            runtime_dir: config.runtime_dir.as_ref().map(PathBuf::from),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
        }
    }

    /// Runtime executable: explicit override first, then the bundled runtime
    pub fn executable_path(&self) -> Option<PathBuf> {
        self.executable
            .clone()
            .or_else(|| self.runtime_dir.as_ref().map(|d| d.join(BUNDLED_RUNTIME_BIN)))
    }

    /// Entry script, if the gateway runs on top of the bundled runtime
    pub fn entry_path(&self) -> Option<PathBuf> {
        self.entry
            .clone()
            .or_else(|| self.runtime_dir.as_ref().map(|d| d.join(BUNDLED_ENTRY)))
    }

    /// Build the launch command, verifying that the executable and entry exist
    pub fn resolve(&self, port: u16, token: &str) -> Result<LaunchCommand, GatewayError> {
        let program = self
            .executable_path()
            .ok_or(GatewayError::RuntimeNotConfigured)?;
        if !program.is_file() {
            return Err(GatewayError::ExecutableMissing(program));
        }

        let mut args = Vec::new();
        if let Some(entry) = self.entry_path() {
            if !entry.is_file() {
                return Err(GatewayError::EntryMissing(entry));
            }
            args.push(entry.to_string_lossy().to_string());
        }
        args.extend([
            "gateway".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--bind".to_string(),
            "loopback".to_string(),
        ]);

        let cwd = self
            .working_dir
            .clone()
            .or_else(|| self.runtime_dir.clone());

        let mut env = vec![
            (TOKEN_ENV.to_string(), token.to_string()),
            (PORT_ENV.to_string(), port.to_string()),
        ];
        if let Some(path) = self.augmented_path(&program) {
            env.push(("PATH".to_string(), path));
        }

        Ok(LaunchCommand {
            program,
            args,
            cwd,
            env,
        })
    }

    /// PATH with the runtime's bin directory in front, so child tools resolve
    /// to the bundled runtime rather than whatever the user has installed
    fn augmented_path(&self, program: &Path) -> Option<String> {
        let bin_dir = program.parent()?.to_path_buf();
        let existing = std::env::var_os("PATH").unwrap_or_default();

        let mut paths = vec![bin_dir.clone()];
        paths.extend(std::env::split_paths(&existing).filter(|p| *p != bin_dir));

        let joined: OsString = std::env::join_paths(paths).ok()?;
        Some(joined.to_string_lossy().to_string())
    }
}
