//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use wuhu_domain::config::ServerConfig;
use wuhu_domain::error::Result;

#[derive(Debug, Parser)]
#[command(name = "wuhu", about = "Persistent multi-user coding-agent runtime")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true, default_value = "wuhu.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the server (default).
    Serve,
    /// Validate the config file and exit.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Validate,
}

/// Load the config; a missing file yields defaults (dev mode).
pub fn load_config(path: &std::path::Path) -> Result<ServerConfig> {
    if path.exists() {
        ServerConfig::load(path)
    } else {
        tracing::warn!(
            path = %path.display(),
            "config file not found; starting with defaults"
        );
        Ok(ServerConfig::default())
    }
}
