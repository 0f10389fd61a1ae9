//! CLI module for the gateway launcher
//!
//! `run` starts the launcher in the foreground; the other commands inspect or
//! change configuration and talk to an already running gateway.

mod commands;
mod output;

use clap::{Parser, Subcommand};

pub use output::{OutputFormat, print_error};

/// Gateway Launcher - supervises the local gateway server
#[derive(Parser, Debug)]
#[command(name = "gateway-launcher")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format
    #[command(flatten)]
    pub output: OutputOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output formatting options
#[derive(Parser, Debug, Clone)]
pub struct OutputOptions {
    /// Output in JSON format (for machine parsing)
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase output verbosity
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl OutputOptions {
    pub fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }

    /// Default log filter for this invocation
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "gateway_launcher=trace,debug"
        } else {
            "gateway_launcher=debug,info"
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the launcher: supervise the gateway until Ctrl-C
    Run {
        /// Poll pairing requests at the foreground rate
        #[arg(long)]
        foreground: bool,
    },

    /// Show whether the gateway is answering
    Status,

    /// Update management
    Update {
        #[command(subcommand)]
        command: commands::update::UpdateCommands,
    },

    /// Pending device pairings
    Pairing {
        #[command(subcommand)]
        command: commands::pairing::PairingCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommands,
    },

    /// Diagnostics and debugging
    Diag {
        #[command(subcommand)]
        command: commands::diag::DiagCommands,
    },
}

/// Run the CLI with parsed arguments
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = cli.output.format();
    let quiet = cli.output.quiet;

    match cli.command {
        Commands::Run { foreground } => commands::run::run(foreground, quiet).await,
        Commands::Status => commands::status::run(format).await,
        Commands::Update { command } => commands::update::run(command, format, quiet).await,
        Commands::Pairing { command } => commands::pairing::run(command, format, quiet).await,
        Commands::Config { command } => commands::config::run(command, format, quiet).await,
        Commands::Diag { command } => commands::diag::run(command, format, quiet).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["gateway-launcher", "pairing", "list", "--json"]).unwrap();
        assert_eq!(cli.output.format(), OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Pairing { .. }));

        let cli = Cli::try_parse_from(["gateway-launcher", "-q", "run"]).unwrap();
        assert!(cli.output.quiet);
        assert_eq!(cli.output.log_filter(), "gateway_launcher=debug,info");
        assert!(matches!(cli.command, Commands::Run { foreground: false }));

        let cli = Cli::try_parse_from(["gateway-launcher", "run", "--foreground"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { foreground: true }));
    }
}
