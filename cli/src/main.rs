use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.global.resolve()?;
    observability::init_tracing(&config.observability)?;

    match cli.command {
        Commands::Migrate => commands::migrate::run(&config).await,
        Commands::Reclaim => commands::reclaim::run(&config).await,
        Commands::Pump(args) => commands::pump::run(&config, args).await,
        Commands::Status(args) => commands::status::run(&config, args).await,
    }
}
