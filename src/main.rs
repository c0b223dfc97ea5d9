//! brokerlink command line
//!
//! Runs a resilient broker connection from a TOML configuration: either as a
//! long-lived subscriber that logs traffic, or as a one-shot publisher.

use brokerlink::config::LinkConfig;
use brokerlink::link::{BrokerConnection, HandlerResult, PublishOutcome, StringPublisher};
use brokerlink::observability::{init_default_logging, init_logging, LogFormat};
use brokerlink::transport::{InboundMessage, QualityOfService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

/// Resilient MQTT broker connection
#[derive(Parser)]
#[command(name = "brokerlink")]
#[command(about = "Keep an MQTT broker connection alive and move messages over it")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log every message on the given patterns until interrupted
    Run {
        /// Topic filter to subscribe to (repeatable)
        #[arg(short, long = "subscribe", value_name = "PATTERN")]
        subscribe: Vec<String>,
    },
    /// Publish one message and wait for it to reach the broker
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// Delivery guarantee: 0, 1 or 2
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        retain: bool,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    info!("Starting brokerlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { subscribe } => run_connection(config, subscribe).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
            wait_secs,
        } => publish_once(config, topic, message, qos, retain, wait_secs).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()))
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<LinkConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(LinkConfig::load_from_file(path)?);
    }

    for path_str in ["brokerlink.toml", "config/brokerlink.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(LinkConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using defaults");
    let config = LinkConfig::default();
    config.mqtt.validate()?;
    Ok(config)
}

async fn run_connection(
    config: LinkConfig,
    patterns: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = BrokerConnection::from_config(config.mqtt)?;

    for pattern in &patterns {
        connection.subscribe(pattern, |message: InboundMessage| async move {
            info!(
                topic = %message.topic,
                qos = message.qos.level(),
                retain = message.retain,
                "{}",
                message.payload_utf8()
            );
            HandlerResult::Ok(())
        })?;
    }

    connection.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(
        patterns = patterns.len(),
        "Broker connection running, press Ctrl+C to stop"
    );

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    connection.stop().await;
    match serde_json::to_string(&connection.metrics()) {
        Ok(metrics) => info!("Final metrics: {}", metrics),
        Err(e) => warn!("Could not render metrics: {}", e),
    }
    Ok(())
}

async fn publish_once(
    config: LinkConfig,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QualityOfService::from_level(qos)
        .ok_or_else(|| format!("Unsupported QoS level: {qos}"))?;
    let connection = BrokerConnection::from_config(config.mqtt)?;
    connection.start().await?;

    let handle = connection.publish(
        StringPublisher::new(topic, message)
            .with_qos(qos)
            .retained(retain),
    );

    let outcome =
        tokio::time::timeout(Duration::from_secs(wait_secs), handle.wait_completed()).await;
    connection.stop().await;

    match outcome {
        Ok(PublishOutcome::Published) => {
            info!(topic = %handle.topic(), "Message published");
            Ok(())
        }
        Ok(PublishOutcome::Failed { reason }) => Err(format!("Publish failed: {reason}").into()),
        Err(_) => Err(format!("Publish not confirmed within {wait_secs}s").into()),
    }
}

fn handle_config_command(config: LinkConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.mqtt.validate()?;
    let endpoint = config.mqtt.connect_options()?;
    info!(
        "Configuration is valid: {}:{} (tls: {})",
        endpoint.host, endpoint.port, endpoint.use_tls
    );

    if show {
        println!("{}", config.to_toml_string()?);
    }

    Ok(())
}
