//! Pending device pairings on a running gateway

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;

use crate::cli::output::{OutputFormat, print_formatted, print_success};
use crate::config::Config;
use crate::config_store::GatewayConfigStore;
use crate::pairing::PairingApprovalState;
use crate::pairing::queue::{ApprovalQueue, HttpApprovalQueue, StaticEndpoint};
use crate::pairing::types::{PairingRequest, submission_order};

#[derive(Subcommand, Debug)]
pub enum PairingCommands {
    /// List requests waiting for approval
    List,

    /// Approve a pending request
    Approve {
        /// Pairing code shown on the device
        code: String,
    },
}

pub async fn run(command: PairingCommands, format: OutputFormat, quiet: bool) -> Result<()> {
    let queue = connect()?;

    match command {
        PairingCommands::List => list(&queue, format).await,
        PairingCommands::Approve { code } => approve(&queue, &code, quiet).await,
    }
}

fn connect() -> Result<HttpApprovalQueue> {
    let config = Config::load()?;
    let doc = GatewayConfigStore::default_location()?.load()?;
    let token = doc
        .gateway
        .auth
        .token
        .filter(|t| !t.trim().is_empty())
        .context("No gateway auth token configured; run the launcher once first")?;

    let endpoint = StaticEndpoint {
        port: doc.gateway.port,
        token,
    };
    let queue = HttpApprovalQueue::new(
        Arc::new(endpoint),
        Duration::from_millis(config.gateway.probe_timeout_ms),
    )?;
    Ok(queue)
}

async fn pending(queue: &HttpApprovalQueue) -> Result<Vec<PairingRequest>> {
    let mut requests = queue
        .list_pending()
        .await
        .context("Failed to list pairing requests")?;
    requests.sort_by(submission_order);
    Ok(requests)
}

async fn list(queue: &HttpApprovalQueue, format: OutputFormat) -> Result<()> {
    let state = PairingApprovalState::new(pending(queue).await?, Utc::now(), None);

    print_formatted(&state, format, |s| {
        if s.requests.is_empty() {
            return "No pending pairing requests".to_string();
        }
        let mut lines = vec![format!("{} pending:", s.pending_count)];
        lines.extend(s.requests.iter().map(describe));
        lines.join("\n")
    });

    Ok(())
}

fn describe(request: &PairingRequest) -> String {
    let submitted = request
        .created_at
        .as_deref()
        .or(request.last_seen_at.as_deref())
        .unwrap_or("unknown time");
    format!("  {}  {}  ({})", request.code, request.display_name(), submitted)
}

async fn approve(queue: &HttpApprovalQueue, code: &str, quiet: bool) -> Result<()> {
    let requests = pending(queue).await?;
    let request = find_by_code(&requests, code)
        .with_context(|| format!("No pending request with code {}", code))?;

    queue
        .approve(request)
        .await
        .with_context(|| format!("Failed to approve {}", request.display_name()))?;

    print_success(&format!("Approved {}", request.display_name()), quiet);
    Ok(())
}

/// Codes are matched case-insensitively
fn find_by_code<'a>(requests: &'a [PairingRequest], code: &str) -> Option<&'a PairingRequest> {
    let code = code.trim();
    requests.iter().find(|r| r.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(code: &str, name: Option<&str>) -> PairingRequest {
        PairingRequest {
            id: format!("id-{}", code),
            code: code.to_string(),
            name: name.map(str::to_string),
            created_at: Some("2026-01-02T03:04:05Z".to_string()),
            last_seen_at: None,
        }
    }

    #[test]
    fn test_find_by_code() {
        let requests = vec![request("ABC123", None), request("XYZ789", Some("Phone"))];
        assert_eq!(find_by_code(&requests, " xyz789 ").map(|r| r.id.as_str()), Some("id-XYZ789"));
        assert!(find_by_code(&requests, "nope").is_none());
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&request("ABC123", Some("Laptop"))),
            "  ABC123  Laptop  (2026-01-02T03:04:05Z)"
        );
    }
}
