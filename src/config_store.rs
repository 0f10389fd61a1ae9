//! The gateway's own JSON configuration document.
//!
//! The launcher only owns a handful of fields in this file (port, auth token,
//! pairing policy). Everything else the gateway writes there is kept in the
//! flattened `extra` maps so a load/save cycle never drops unknown keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use rand::RngCore;
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default loopback port the gateway listens on
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Errors that can occur while reading or writing the gateway document
#[derive(Error, Debug)]
pub enum ConfigStoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid gateway config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayDocument {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub pairing: PairingSection,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: DEFAULT_GATEWAY_PORT,
            auth: AuthSection::default(),
            extra: Map::new(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Approval policy as the gateway stores it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_policy: Option<String>,
    #[serde(default)]
    pub approved_users: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reads and writes the gateway document at a fixed path
#[derive(Debug, Clone)]
pub struct GatewayConfigStore {
    path: PathBuf,
}

impl GatewayConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the well-known location inside the launcher data directory
    pub fn default_location() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::data_dir()?.join("gateway.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, falling back to defaults when the file does not exist yet
    pub fn load(&self) -> Result<GatewayDocument, ConfigStoreError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GatewayDocument::default());
            }
            Err(source) => {
                return Err(ConfigStoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&data).map_err(|source| ConfigStoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the document via a temp file so the gateway never reads a torn file
    pub fn save(&self, doc: &GatewayDocument) -> Result<(), ConfigStoreError> {
        let io_err = |source| ConfigStoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let payload = serde_json::to_vec_pretty(doc).map_err(|source| ConfigStoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, payload).map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Return the auth token, generating and persisting one when missing
    pub fn ensure_token(&self) -> Result<String, ConfigStoreError> {
        let mut doc = self.load()?;
        if let Some(token) = doc.gateway.auth.token.as_ref().filter(|t| !t.trim().is_empty()) {
            return Ok(token.clone());
        }

        let token = generate_token();
        doc.gateway.auth.token = Some(token.clone());
        self.save(&doc)?;
        tracing::info!("Generated new gateway auth token in {:?}", self.path);
        Ok(token)
    }
}

/// Random bytes behind a token; hex doubles the length
const TOKEN_BYTES: usize = 24;

/// Generate a 48 character hex token from the OS random source
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
