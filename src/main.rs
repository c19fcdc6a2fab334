//! voice-bridge service entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use voice_bridge::config::{load_config, BridgeConfig};
use voice_bridge::observability::{logging, metrics};
use voice_bridge::Orchestrator;

#[derive(Parser)]
#[command(name = "voice-bridge")]
#[command(about = "Resilient bridge between a voice pipeline and its network services", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Start,
    /// Probe every integration and print diagnostics
    Test,
    /// Print a health snapshot
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BridgeConfig::default(),
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log_level.clone());
    logging::init_logging(&level);

    tracing::info!("voice-bridge v0.1.0 starting");

    match cli.command {
        Commands::Start => {
            if config.observability.metrics_enabled {
                match config.observability.metrics_address.parse() {
                    Ok(addr) => metrics::init_metrics(addr),
                    Err(e) => tracing::error!(
                        metrics_address = %config.observability.metrics_address,
                        error = %e,
                        "Failed to parse metrics address"
                    ),
                }
            }

            let orchestrator = Orchestrator::new(config)?;
            orchestrator.run().await?;
        }
        Commands::Test => {
            let orchestrator = Orchestrator::new(config)?;
            if let Err(e) = orchestrator.initialize().await {
                tracing::warn!(error = %e, "Initialization incomplete, reporting anyway");
            }
            let report = orchestrator.test_integrations().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            orchestrator.shutdown().await;
        }
        Commands::Health => {
            let orchestrator = Orchestrator::new(config)?;
            if let Err(e) = orchestrator.initialize().await {
                tracing::warn!(error = %e, "Initialization incomplete, reporting anyway");
            }
            let snapshot = orchestrator.health_snapshot().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            orchestrator.shutdown().await;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
