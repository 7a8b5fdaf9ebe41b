//! NVR MQTT - command line entry point
//!
//! Connects to the configured broker, publishes Home Assistant discovery,
//! then reads newline-delimited detection batches from stdin until EOF or a
//! termination signal.

use chrono::Utc;
use clap::{Parser, Subcommand};
use nvr_mqtt::collaborators::{
    ConfigStreamStore, DirectorySnapshotSource, NoSnapshots, SnapshotSource,
};
use nvr_mqtt::config::NvrConfig;
use nvr_mqtt::detection::{DetectionInput, DetectionResult};
use nvr_mqtt::integration::MqttIntegration;
use nvr_mqtt::observability::{init_default_logging, init_logging, metrics, LogFormat};
use nvr_mqtt::transport::mqtt::RumqttBackend;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::{
    signal,
    time::{sleep, Duration, Instant},
};
use tracing::{debug, error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["nvr-mqtt.toml", "config/nvr-mqtt.toml"];

/// MQTT integration for a network video recorder
#[derive(Parser)]
#[command(name = "nvr-mqtt")]
#[command(about = "Publish NVR detections and Home Assistant discovery over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "NVR_MQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish detections read from stdin
    Run {
        /// Seconds to wait for the broker before continuing unconnected
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
    /// Validate the configuration
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
        1 => init_logging(Level::DEBUG, log_format(), false),
        _ => init_logging(Level::TRACE, log_format(), true),
    }

    info!("Starting nvr-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { connect_timeout } => {
            run(config, Duration::from_secs(connect_timeout)).await
        }
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()))
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<NvrConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(NvrConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(NvrConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create nvr-mqtt.toml".into())
}

fn snapshot_source(config: &NvrConfig) -> Arc<dyn SnapshotSource> {
    match &config.snapshots.directory {
        Some(dir) => Arc::new(DirectorySnapshotSource::new(dir.clone())),
        None => Arc::new(NoSnapshots),
    }
}

async fn run(config: NvrConfig, connect_timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let integration = Arc::new(MqttIntegration::new(
        Arc::new(RumqttBackend::default()),
        Arc::new(ConfigStreamStore::from_config(&config)),
        snapshot_source(&config),
    ));

    let enabled = config.mqtt.enabled;
    integration.init(config)?;
    if !enabled {
        warn!("MQTT is disabled, detections will be discarded");
    }

    let connector = integration.clone();
    tokio::task::spawn_blocking(move || connector.connect()).await??;

    if enabled && wait_for_connection(&integration, connect_timeout).await {
        let published = integration.publish_discovery();
        let services = integration.start_services();
        info!(
            discovery_documents = published,
            services = services,
            "MQTT integration running"
        );
    } else if enabled {
        warn!(timeout = ?connect_timeout, "Broker not reachable yet, continuing to reconnect in the background");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        result = read_detections(integration.clone()) => {
            match result {
                Ok(lines) => info!(lines = lines, "Detection input closed"),
                Err(e) => error!(error = %e, "Failed to read detection input"),
            }
        }
    }

    let teardown = integration.clone();
    let outcome = tokio::task::spawn_blocking(move || teardown.cleanup()).await?;
    if outcome.is_clean() {
        info!("MQTT teardown completed cleanly");
    } else {
        warn!(outcome = ?outcome, "MQTT teardown finished with abandoned steps");
    }

    debug!(
        metrics = %serde_json::to_string(&metrics().snapshot())?,
        "Final metrics"
    );
    Ok(())
}

async fn wait_for_connection(integration: &MqttIntegration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if integration.is_connected() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    integration.is_connected()
}

/// Publish every NDJSON detection batch on stdin; returns the lines read
async fn read_detections(integration: Arc<MqttIntegration>) -> std::io::Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;

        let input: DetectionInput = match serde_json::from_str(line) {
            Ok(input) => input,
            Err(e) => {
                warn!(line = count, error = %e, "Skipping malformed detection input");
                continue;
            }
        };

        let timestamp = input.timestamp.unwrap_or_else(Utc::now);
        let result = DetectionResult::new(input.detections);
        if let Err(e) = integration.publish_detection(&input.stream, &result, timestamp) {
            warn!(stream = %input.stream, error = %e, "Failed to publish detection");
        }
        integration.set_motion_state(&input.stream, &result);
    }

    Ok(count)
}

fn handle_config_command(config: NvrConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if config.mqtt.enabled {
        config.validate_for_connection()?;
    }

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
