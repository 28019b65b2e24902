#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]

//! Command-line entry point for the Syncline server.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::Config;
use std::path::PathBuf;

/// Syncline command line.
#[derive(Parser)]
#[command(name = "syncline")]
#[command(about = "Realtime sync server: SSE relay, presence, and chat log", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the server.
    Serve {
        /// Port to bind; overrides the config file and environment.
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a config file (.yaml, .yml, or .json).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Loads `.env` and parses the command line.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

/// Resolves configuration and runs the serve loop until shutdown.
///
/// # Errors
/// Returns an error when configuration fails to resolve or the server fails
/// to start.
pub async fn handle_serve_command(
    port: Option<u16>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let resolved = Config::load(config.as_deref(), port)?;
    server::server::run(resolved).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = initialize_cli();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_parses_port_and_config() {
        let cli = Cli::try_parse_from([
            "syncline",
            "serve",
            "--port",
            "9000",
            "--config",
            "syncline.yaml",
        ])
        .unwrap();

        let Commands::Serve { port, config } = cli.command;
        assert_eq!(port, Some(9000));
        assert_eq!(config, Some(PathBuf::from("syncline.yaml")));
    }

    #[test]
    fn serve_runs_on_defaults_without_flags() {
        let cli = Cli::try_parse_from(["syncline", "serve"]).unwrap();

        let Commands::Serve { port, config } = cli.command;
        assert_eq!(port, None);
        assert_eq!(config, None);
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(Cli::try_parse_from(["syncline"]).is_err());
    }
}
