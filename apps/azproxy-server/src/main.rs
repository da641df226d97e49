mod config;
mod logging;
mod server;
mod signals;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use crate::config::{AppConfig, CliOverrides};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// azproxy - authenticating proxy for Azure `OpenAI` deployments
#[derive(Parser)]
#[command(name = "azproxy-server")]
#[command(about = "Authenticating streaming proxy for Azure OpenAI deployments")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML, secrets redacted) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration, fetch a token and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(CliOverrides {
        port: cli.port,
        verbose: cli.verbose,
    });

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_yaml()?);
        return Ok(());
    }

    logging::init(&config.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "azproxy starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => server::run(&config).await,
        Commands::Check => server::check(&config).await,
    }
}
