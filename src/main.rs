//! robot-relay - broker to WebSocket relay entry point

use clap::{Parser, Subcommand};
use robot_relay::config::RelayConfig;
use robot_relay::hub::server;
use robot_relay::observability::init_default_logging;
use robot_relay::relay::RelayContext;
use robot_relay::transport::BrokerConnection;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Inbound broker messages buffered between the event loop and the pipeline
const INBOUND_CAPACITY: usize = 1024;

/// Relay robot telemetry from an MQTT broker to WebSocket sessions
#[derive(Parser)]
#[command(name = "robot-relay")]
#[command(about = "MQTT to WebSocket relay for robot telemetry and commands")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ROBOT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        std::env::set_var("LOG_LEVEL", if cli.verbose > 1 { "trace" } else { "debug" });
    }
    init_default_logging();

    info!("Starting robot-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Relay shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(RelayConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["robot-relay.toml", "config/robot-relay.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(RelayConfig::load_from_file(&path)?);
                }
            }
            info!("No configuration file found, using defaults");
            Ok(RelayConfig::from_toml_str("")?)
        }
    }
}

async fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listen = SocketAddr::from(([0, 0, 0, 0], config.server.listen_port));
    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        listen = %listen,
        "Relay starting"
    );

    let broker = BrokerConnection::new(&config);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    broker.set_message_sender(inbound_tx);

    let ctx = Arc::new(RelayContext::new(config, Arc::new(broker)));
    ctx.subscribe_upstream().await?;

    // Listen for broker events before the first ConnAck can arrive
    let tasks = ctx.spawn_tasks(inbound_rx);

    // A failed first attempt is logged; the supervisor keeps retrying
    if let Err(e) = ctx.transport.connect().await {
        warn!(error = %e, "Initial broker connection failed, retrying in background");
    }

    let (bound, server) = server::bind(ctx.clone(), listen, ctx.shutdown_signal())?;
    let server = tokio::spawn(server);
    info!(addr = %bound, "Relay running");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    ctx.shutdown().await;
    tasks.join().await;
    if let Err(e) = server.await {
        warn!(error = %e, "Session server ended abnormally");
    }
    Ok(())
}

fn handle_config_command(
    config: &RelayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}
