//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the effective configuration.
    Validate,
    /// Print the effective configuration with defaults filled in.
    Show,
}

/// Run the config command against the effective configuration.
pub fn run_config(args: ConfigArgs, config: &Config) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config),
        ConfigCommand::Show => show_config(config),
    }
}

fn validate_config(config: &Config) -> Result<()> {
    config.validate().context("configuration is invalid")?;
    println!("✓ Configuration is valid");
    if !config.listener.has_tls() {
        println!("  ⚠ Warning: listener has no TLS certificate configured");
    }
    if !config.compaction.enabled {
        println!("  ⚠ Warning: background compaction is disabled");
    }
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_defaults() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_level() {
        let mut config = Config::default();
        config.telemetry.log_level = "loud".to_string();
        assert!(validate_config(&config).is_err());
    }
}
