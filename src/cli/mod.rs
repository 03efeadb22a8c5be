//! Command-line interface.

pub mod commands;

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Strata - etcd v3 API served from a SQL database.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Storage endpoint (sqlite://path, postgres://..., mysql://..., or a path).
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Listen address (host:port or unix:///path).
    #[arg(long, global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the Strata server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}

impl Cli {
    /// Overrides carried by the global flags.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level.clone(),
            endpoint: self.endpoint.clone(),
            listen: self.listen.clone(),
        }
    }

    /// Load the configuration file (or defaults) and apply the flag overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(&self.overrides());
        Ok(config)
    }
}

fn load_file(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load config from {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_overrides() {
        let cli = Cli::parse_from([
            "strata",
            "--endpoint",
            "postgres://db/strata",
            "--listen",
            "unix:///run/strata.sock",
            "start",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.storage.endpoint, "postgres://db/strata");
        assert_eq!(config.listener.address, "unix:///run/strata.sock");
        assert!(matches!(cli.command, Commands::Start(_)));
    }

    #[test]
    fn test_config_subcommand() {
        let cli = Cli::parse_from(["strata", "config", "validate"]);
        assert!(matches!(cli.command, Commands::Config(_)));
    }
}
