//! Pairing requests and the snapshot published to the UI.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device waiting for approval, as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    #[serde(default)]
    pub id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
}

impl PairingRequest {
    /// Name to show for the request, falling back to its code
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.code)
    }

    /// Submission time in epoch milliseconds: creation time, else last-seen time
    pub fn submitted_at_ms(&self) -> Option<i64> {
        self.created_at
            .as_deref()
            .and_then(parse_timestamp_ms)
            .or_else(|| self.last_seen_at.as_deref().and_then(parse_timestamp_ms))
    }
}

/// Accepts RFC 3339 strings and bare epoch milliseconds
fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Earliest submission first; unparseable timestamps last; then by code
pub fn submission_order(a: &PairingRequest, b: &PairingRequest) -> Ordering {
    match (a.submitted_at_ms(), b.submitted_at_ms()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.code.cmp(&b.code))
}

/// The request a bootstrap auto-approval should pick
pub fn earliest_request(requests: &[PairingRequest]) -> Option<&PairingRequest> {
    requests.iter().min_by(|a, b| submission_order(a, b))
}

/// Record of the one bootstrap auto-approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoApproval {
    pub at: DateTime<Utc>,
    pub name: String,
}

/// Pending approvals as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingApprovalState {
    pub pending_count: usize,
    pub requests: Vec<PairingRequest>,
    pub updated_at: DateTime<Utc>,
    pub last_auto_approved_at: Option<DateTime<Utc>>,
    pub last_auto_approved_name: Option<String>,
}

impl PairingApprovalState {
    pub fn new(
        requests: Vec<PairingRequest>,
        updated_at: DateTime<Utc>,
        auto: Option<&AutoApproval>,
    ) -> Self {
        Self {
            pending_count: requests.len(),
            requests,
            updated_at,
            last_auto_approved_at: auto.map(|a| a.at),
            last_auto_approved_name: auto.map(|a| a.name.clone()),
        }
    }

    pub fn empty(updated_at: DateTime<Utc>, auto: Option<&AutoApproval>) -> Self {
        Self::new(Vec::new(), updated_at, auto)
    }

    /// Everything that matters for rendering; `updated_at` is left out
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            pending_count: self.pending_count,
            codes: self.requests.iter().map(|r| r.code.clone()).collect(),
            last_auto_approved_at: self.last_auto_approved_at.map(|t| t.timestamp_millis()),
            last_auto_approved_name: self.last_auto_approved_name.clone(),
        }
    }
}

impl Default for PairingApprovalState {
    fn default() -> Self {
        Self::empty(DateTime::<Utc>::default(), None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pending_count: usize,
    codes: Vec<String>,
    last_auto_approved_at: Option<i64>,
    last_auto_approved_name: Option<String>,
}
