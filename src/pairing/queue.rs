//! Collaborators of the pairing monitor: the gateway's approval queue, the
//! approval policy, and the first-run bootstrap window.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config_store::GatewayConfigStore;
use crate::gateway::GatewaySupervisor;

use super::types::PairingRequest;

/// Policy value under which requests need explicit approval
pub const PAIRING_POLICY: &str = "pairing";

/// Errors that can occur while talking to the approval queue
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Approval request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Approval API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Approval API rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid approval API response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Pending requests and approvals, as served by the gateway
#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    async fn list_pending(&self) -> Result<Vec<PairingRequest>, ApprovalError>;

    async fn approve(&self, request: &PairingRequest) -> Result<(), ApprovalError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub enabled: bool,
    pub dm_policy: Option<String>,
    pub approved_user_count: usize,
}

impl ApprovalPolicy {
    /// Whether new devices wait in the approval queue
    pub fn requires_pairing(&self) -> bool {
        self.enabled && self.dm_policy.as_deref() == Some(PAIRING_POLICY)
    }
}

#[async_trait]
pub trait ApprovalPolicyReader: Send + Sync {
    async fn policy(&self) -> ApprovalPolicy;
}

/// First-run window during which one request is approved without asking
pub trait BootstrapWindow: Send + Sync {
    fn is_active(&self) -> bool;

    /// Spend the window on `request_id`
    fn consume(&self, request_id: &str);

    fn close(&self);
}

#[derive(Serialize)]
struct ApproveBody<'a> {
    code: &'a str,
    id: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    requests: Vec<PairingRequest>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ApproveResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Where the gateway's HTTP API listens, and the token it expects
pub trait GatewayEndpoint: Send + Sync {
    fn port(&self) -> u16;
    fn token(&self) -> String;
}

impl GatewayEndpoint for GatewaySupervisor {
    fn port(&self) -> u16 {
        GatewaySupervisor::port(self)
    }

    fn token(&self) -> String {
        GatewaySupervisor::token(self)
    }
}

/// Endpoint read once from configuration, for one-shot commands
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
    pub port: u16,
    pub token: String,
}

impl GatewayEndpoint for StaticEndpoint {
    fn port(&self) -> u16 {
        self.port
    }

    fn token(&self) -> String {
        self.token.clone()
    }
}

/// Approval queue served by the local gateway over HTTP.
///
/// Port and token are read from the endpoint on every call, so a restart
/// with a new token is picked up without rebuilding the queue.
#[derive(Clone)]
pub struct HttpApprovalQueue {
    client: reqwest::Client,
    endpoint: Arc<dyn GatewayEndpoint>,
}

impl HttpApprovalQueue {
    pub fn new(endpoint: Arc<dyn GatewayEndpoint>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.endpoint.port(), path)
    }

    async fn read_body(response: reqwest::Response) -> Result<String, ApprovalError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApprovalError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl ApprovalQueue for HttpApprovalQueue {
    async fn list_pending(&self) -> Result<Vec<PairingRequest>, ApprovalError> {
        let response = self
            .client
            .get(self.url("/api/pairing/requests"))
            .bearer_auth(self.endpoint.token())
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        let parsed: ListResponse = serde_json::from_str(&body)?;
        if !parsed.success {
            return Err(ApprovalError::Rejected(
                parsed.message.unwrap_or_else(|| "listing failed".to_string()),
            ));
        }
        Ok(parsed.requests)
    }

    async fn approve(&self, request: &PairingRequest) -> Result<(), ApprovalError> {
        let body = ApproveBody {
            code: &request.code,
            id: &request.id,
            name: request.display_name(),
        };
        let response = self
            .client
            .post(self.url("/api/pairing/approve"))
            .bearer_auth(self.endpoint.token())
            .json(&body)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        let parsed: ApproveResponse = serde_json::from_str(&body)?;
        if parsed.success {
            Ok(())
        } else {
            Err(ApprovalError::Rejected(
                parsed.message.unwrap_or_else(|| "approval refused".to_string()),
            ))
        }
    }
}

/// Reads the approval policy from the gateway's config document
pub struct StorePolicyReader {
    store: GatewayConfigStore,
}

impl StorePolicyReader {
    pub fn new(store: GatewayConfigStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ApprovalPolicyReader for StorePolicyReader {
    /// Reads the document off the async runtime; called on every poll
    async fn policy(&self) -> ApprovalPolicy {
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load()).await;

        match loaded {
            Ok(Ok(doc)) => ApprovalPolicy {
                enabled: doc.pairing.enabled,
                dm_policy: doc.pairing.dm_policy,
                approved_user_count: doc.pairing.approved_users.len(),
            },
            Ok(Err(e)) => {
                tracing::warn!("Cannot read approval policy: {}", e);
                ApprovalPolicy::default()
            }
            Err(e) => {
                tracing::warn!("Approval policy read task failed: {}", e);
                ApprovalPolicy::default()
            }
        }
    }
}

/// Bootstrap window open for a fixed time after creation, spent by the first approval
pub struct TimedBootstrapWindow {
    inner: Mutex<WindowState>,
}

struct WindowState {
    closes_at: Instant,
    closed: bool,
    consumed_by: Option<String>,
}

impl TimedBootstrapWindow {
    pub fn open_for(duration: Duration) -> Self {
        Self {
            inner: Mutex::new(WindowState {
                closes_at: Instant::now() + duration,
                closed: false,
                consumed_by: None,
            }),
        }
    }

    /// A window that was never open (not a first run)
    pub fn closed() -> Self {
        let window = Self::open_for(Duration::ZERO);
        window.close();
        window
    }

    /// Request the window was spent on, if any
    pub fn consumed_by(&self) -> Option<String> {
        self.with_state(|s| s.consumed_by.clone())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut WindowState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl BootstrapWindow for TimedBootstrapWindow {
    fn is_active(&self) -> bool {
        self.with_state(|s| !s.closed && Instant::now() < s.closes_at)
    }

    fn consume(&self, request_id: &str) {
        self.with_state(|s| {
            s.consumed_by = Some(request_id.to_string());
            s.closed = true;
        });
    }

    fn close(&self) {
        self.with_state(|s| s.closed = true);
    }
}
