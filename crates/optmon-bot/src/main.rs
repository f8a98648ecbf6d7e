//! Option position monitor - Entry Point

use anyhow::Result;
use clap::Parser;
use optmon_bot::{AppConfig, Orchestrator};
use optmon_broker::{BrokerRegistry, SmartApiSession};
use std::sync::Arc;
use tracing::info;

/// Option position monitor
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via OPTMON_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection
    optmon_ws::init_crypto();

    let args = Args::parse();

    optmon_telemetry::init_logging()?;

    info!("Starting optmon v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > OPTMON_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("OPTMON_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = AppConfig::from_file(&config_path)?;
    info!(
        accounts = config.accounts.len(),
        instruments = config.instruments.len(),
        streaming = config.credentials.is_complete(),
        "Configuration loaded"
    );

    let brokers = Arc::new(BrokerRegistry::new());
    for account in &config.accounts {
        let session = SmartApiSession::new(account.into())?;
        brokers.insert(account.client_id.clone(), Arc::new(session));
    }
    let resolver = Arc::new(config.token_resolver()?);

    let orchestrator = Orchestrator::new(config, brokers, resolver)?;
    orchestrator.run().await?;

    Ok(())
}
