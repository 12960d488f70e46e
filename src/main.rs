//! ESP32-CAM monitor - command line entry point

use esp32cam_monitor::config::{ConfigError, MonitorConfig};
use esp32cam_monitor::credentials::Provisioner;
use esp32cam_monitor::observability::init_with_verbosity;
use esp32cam_monitor::transport::mqtt::{ConnectionManager, ConnectionState, StateTransition};
use esp32cam_monitor::{MonitorError, MonitorResult};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["esp32cam-monitor.toml", "config/esp32cam-monitor.toml"];

/// Mutual-TLS MQTT monitor for ESP32-CAM object detection telemetry
#[derive(Parser)]
#[command(name = "esp32cam-monitor")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory with the broker config and PEM files
    #[arg(long, value_name = "DIR", env = "ESP32CAM_ASSETS")]
    assets: Option<PathBuf>,

    /// Verbose logging, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print telemetry until interrupted
    Run,
    /// Load credentials and report what would be used, without connecting
    Check,
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

    init_with_verbosity(cli.verbose);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    let config = match cli.assets {
        Some(dir) => config.with_asset_dir(dir),
        None => config,
    };

    let result = match cli.command {
        Commands::Run => run_monitor(config).await,
        Commands::Check => check_credentials(&config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(recoverable = e.is_recoverable(), "Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<MonitorConfig, ConfigError> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return MonitorConfig::load_from_file(path);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return MonitorConfig::load_from_file(path);
        }
    }

    info!("No configuration file found, using defaults");
    let config = MonitorConfig::default();
    config.validate()?;
    Ok(config)
}

async fn run_monitor(config: MonitorConfig) -> MonitorResult<()> {
    let manager = ConnectionManager::new(&config);
    let mut transitions = manager.subscribe_transitions();
    let mut records = manager.telemetry().observe();

    manager.connect().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            transition = transitions.recv() => match transition {
                Ok(transition) => {
                    print_transition(transition);
                    if transition.to == ConnectionState::Disconnected {
                        error!("MQTT connection permanently lost, shutting down...");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed connection state transitions");
                }
                Err(RecvError::Closed) => break,
            },
            record = records.next() => match record {
                Some(record) => {
                    if record.is_high_risk() {
                        warn!(label = %record.label, distance = record.distance, "High risk object");
                    }
                    println!("{record}");
                }
                None => break,
            },
        }
    }

    manager.disconnect().await;
    Ok(())
}

fn print_transition(transition: StateTransition) {
    match transition.to {
        ConnectionState::Connecting => println!("connecting to MQTT server..."),
        ConnectionState::Connected => println!("ESP32-CAM connected, receiving"),
        ConnectionState::Lost => println!("connection lost, retrying..."),
        ConnectionState::Disconnected => println!("disconnected"),
    }
}

fn check_credentials(config: &MonitorConfig) -> MonitorResult<()> {
    let provisioner = Provisioner::new(&config.assets, &config.session);
    let broker = provisioner.load_broker_config()?;
    let tls = provisioner.build_tls_context()?;
    let reconnect = config.reconnect.to_reconnect_config();

    println!("broker:        {}:{}", broker.endpoint, broker.port);
    println!("client id:     {}", broker.client_id);
    println!("trust anchors: {}", tls.trust_anchor_count());
    println!("client chain:  {} certificate(s)", tls.client_chain_len());
    if tls.key_converted() {
        println!("client key:    {} (converted to PKCS#8)", tls.key_encoding());
    } else {
        println!("client key:    {}", tls.key_encoding());
    }
    match reconnect.calculate_max_total_time() {
        Some(total_ms) => println!(
            "reconnect:     up to {} attempt(s), {total_ms}ms of backoff",
            reconnect.max_attempts.unwrap_or_default()
        ),
        None => println!("reconnect:     unlimited"),
    }
    Ok(())
}

fn handle_config_command(config: &MonitorConfig, show: bool) -> MonitorResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| MonitorError::internal(format!("Failed to render configuration: {e}")))?;
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
