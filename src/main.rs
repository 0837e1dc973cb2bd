use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conductor::config::Settings;
use conductor::server;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Issue-to-PR session orchestrator for remote coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to conductor.toml. Secrets always come from the environment.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator and dashboard server
    Serve {
        /// Port to serve on (overrides config and CONDUCTOR_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate configuration and credentials without starting
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("conductor={default_level}"))),
        )
        .init();

    match cli.command {
        Commands::Serve { port } => {
            let mut settings = Settings::load(cli.config.as_deref())?;
            if let Some(port) = port {
                settings.port = port;
            }
            server::start_server(settings).await
        }
        Commands::Check => {
            let settings = Settings::load(cli.config.as_deref())?;
            println!("agent endpoint: {}", settings.agent_base_url);
            println!(
                "repository:     {}/{}",
                settings.github_owner, settings.github_repo
            );
            println!("port:           {}", settings.port);
            println!("retry budget:   {}", settings.conductor.retry_budget);
            println!(
                "auto-chain:     {} (threshold {})",
                settings.conductor.auto_chain, settings.conductor.confidence_threshold
            );
            println!("Configuration OK.");
            Ok(())
        }
    }
}
