mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,recallflow=info";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = commands::shared::load_registry(cli.models_file.as_deref())?;

    match cli.command {
        Commands::Limits { model } => commands::limits::run(&registry, &model, cli.format),
        Commands::Window(args) => {
            let config = commands::shared::load_config(
                cli.config.as_deref(),
                cli.model.as_deref(),
                &registry,
            )?;
            commands::window::run(&config, args, cli.format)
        }
        Commands::Budget(args) => {
            let config = commands::shared::load_config(
                cli.config.as_deref(),
                cli.model.as_deref(),
                &registry,
            )?;
            commands::budget::run(&config, args, cli.format)
        }
        Commands::Topics(args) => commands::topics::run(args, cli.format).await,
    }
}

/// Log to stderr so JSON on stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();
}
