use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaynode_core::config::NodeConfig;

use crate::logging::{self, LogFormat};
use crate::node;

#[derive(Parser)]
#[command(
    name = "relaynode",
    version,
    about = "Game-traffic relay node: session tunnels, health, and metrics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay node until SIGINT/SIGTERM
    Serve {
        /// TOML config file; environment variables override it
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Log output format
        #[arg(long, default_value = "human", value_parser = ["human", "json"])]
        log_format: String,
    },
    /// Validate configuration and print the effective settings as JSON
    CheckConfig {
        /// TOML config file; environment variables override it
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, log_format } => {
            cmd_serve(config.as_deref(), LogFormat::from_str_arg(&log_format))
        }
        Commands::CheckConfig { config } => cmd_check_config(config.as_deref()),
    }
}

fn cmd_serve(path: Option<&Path>, format: LogFormat) -> Result<()> {
    let config = NodeConfig::load(path)?;
    logging::init(format, &config.log_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(node::run(config))
}

fn cmd_check_config(path: Option<&Path>) -> Result<()> {
    let config = NodeConfig::load(path)?;
    let json = serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("{}", json);
    Ok(())
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
    fn test_parse_serve_flags() {
        let cli = Cli::try_parse_from(["relaynode", "serve", "--config", "node.toml", "--log-format", "json"]).unwrap();
        match cli.command {
            Commands::Serve { config, log_format } => {
                assert_eq!(config.as_deref(), Some(Path::new("node.toml")));
                assert_eq!(log_format, "json");
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_reject_unknown_log_format() {
        assert!(Cli::try_parse_from(["relaynode", "serve", "--log-format", "xml"]).is_err());
    }
}
