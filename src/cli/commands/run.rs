//! Foreground launcher

use anyhow::Result;

use crate::app::{Launcher, Presentation};
use crate::cli::output::print_success;
use crate::config::Config;
use crate::config_store::GatewayConfigStore;

pub async fn run(foreground: bool, quiet: bool) -> Result<()> {
    let config = Config::load()?;
    let store = GatewayConfigStore::default_location()?;

    tracing::info!("Starting gateway launcher {}", env!("CARGO_PKG_VERSION"));
    let launcher = Launcher::init(config, store, Presentation::logging())?;
    launcher.set_foreground(foreground);
    launcher.start().await;

    print_success(
        &format!(
            "Gateway {} on port {}. Press Ctrl-C to stop.",
            launcher.supervisor().state(),
            launcher.supervisor().port()
        ),
        quiet,
    );

    launcher.wait_for_quit().await;
    launcher.shutdown().await;
    Ok(())
}
