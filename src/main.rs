mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check::run().await?,
        Commands::Discover { cluster, config } => commands::discover::run(&cluster, config.as_deref()).await?,
        Commands::Serve { cluster, config, addr } => {
            commands::serve::run(&cluster, config.as_deref(), &addr).await?
        }
        Commands::Policy { action } => commands::policy::run(action).await?,
        Commands::Clusters => commands::clusters::run()?,
        Commands::Config { action } => commands::config_cmd::run(action)?,
        Commands::Deploy { action } => commands::deploy::run(action),
        Commands::Observability { action } => commands::observability::run(action),
    }

    Ok(())
}
