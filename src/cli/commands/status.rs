//! Gateway status

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::cli::output::{OutputFormat, print_formatted, status_line};
use crate::config::Config;
use crate::config_store::GatewayConfigStore;
use crate::gateway::health::{HealthProbe, HttpHealthProbe};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResult {
    port: u16,
    responding: bool,
    pairing_enabled: bool,
    dm_policy: Option<String>,
    approved_users: usize,
}

pub async fn run(format: OutputFormat) -> Result<()> {
    let config = Config::load()?;
    let doc = GatewayConfigStore::default_location()?.load()?;

    let probe = HttpHealthProbe::new(Duration::from_millis(config.gateway.probe_timeout_ms))?;
    let result = StatusResult {
        port: doc.gateway.port,
        responding: probe.is_ready(doc.gateway.port).await,
        pairing_enabled: doc.pairing.enabled,
        dm_policy: doc.pairing.dm_policy.clone(),
        approved_users: doc.pairing.approved_users.len(),
    };

    print_formatted(&result, format, |r| {
        let policy = r.dm_policy.as_deref().unwrap_or("<not set>");
        [
            status_line(r.responding, &format!("Gateway on port {}", r.port)),
            status_line(
                r.pairing_enabled,
                &format!("Pairing (policy: {}, {} approved)", policy, r.approved_users),
            ),
        ]
        .join("\n")
    });

    Ok(())
}
