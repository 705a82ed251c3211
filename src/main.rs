//! aquadopp - Nortek Aquadopp driver
//!
//! Connects to the instrument through a TCP port agent and prints driver
//! events as JSON lines until interrupted.

use aquadopp_core::{
    Config, ConnectionState, DeviceProfile, Driver, DriverError, DriverEvent, DriverHandle,
    EventBroadcaster, InstrumentProtocol, TcpConnector,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aquadopp")]
#[command(about = "Driver for the Nortek Aquadopp current meter")]
#[command(version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "AQUADOPP_CONFIG")]
    config: Option<PathBuf>,

    /// Port agent address (host:port), overrides the configuration
    #[arg(short, long)]
    port_agent: Option<String>,

    /// Read status and configuration once instead of autosampling
    #[arg(long)]
    status_only: bool,

    /// Synchronise the instrument clock after connecting
    #[arg(long)]
    sync_clock: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let mut config = Config::from_file(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };
    if let Some(addr) = args.port_agent {
        config.link.port_agent = addr;
    }
    config.validate()?;

    tracing::info!("Starting aquadopp driver");
    tracing::info!("  Port agent: {}", config.link.port_agent);
    tracing::info!(
        "  Command timeout: {} ms, sample timeout: {} s",
        config.protocol.command_timeout_ms,
        config.protocol.sample_timeout_secs
    );

    let events = Arc::new(EventBroadcaster::new(config.protocol.event_capacity));
    let protocol = InstrumentProtocol::new(
        TcpConnector::from_config(&config.link),
        DeviceProfile::aquadopp()?,
        config.protocol.clone(),
        events,
    )?;
    let driver = Driver::spawn(protocol);
    let printer = tokio::spawn(print_events(driver.subscribe()));

    let result = run(&driver, args.status_only, args.sync_clock).await;
    if let Err(e) = &result {
        tracing::error!("{}", e);
    }

    if let Err(e) = driver.shutdown().await {
        tracing::warn!("Shutdown: {}", e);
    }
    // the printer ends once the last event sender is gone
    drop(driver);
    let _ = printer.await;

    tracing::info!("Driver stopped");
    result.map_err(Into::into)
}

async fn run(
    driver: &DriverHandle,
    status_only: bool,
    sync_clock: bool,
) -> Result<(), DriverError> {
    driver.connect().await?;

    if sync_clock {
        let clock = driver.clock_sync().await?;
        tracing::info!("Instrument clock set to {}", clock);
    }

    if status_only {
        driver.acquire_status().await?;
        return Ok(());
    }

    driver.start_sampling().await?;
    tracing::info!("Autosampling, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");

    if driver.state() == ConnectionState::Autosample {
        driver.stop_sampling().await?;
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<DriverEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => tracing::warn!("Cannot serialize {} event: {}", event.kind(), e),
            },
            Err(RecvError::Lagged(n)) => tracing::warn!("Lagged {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}
