//! Strata - unified CLI entrypoint.
//!
//! Usage:
//!   strata start --config config/strata.toml
//!   strata --endpoint postgres://user:pass@db/k8s --listen 0.0.0.0:2379 start
//!   strata config validate --config config/strata.toml
//!   strata config show

use anyhow::Result;
use clap::Parser;
use strata::cli::commands::{run_config, run_start};
use strata::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::Start(args) => run_start(args, config).await,
        Commands::Config(args) => run_config(args, &config),
    }
}
