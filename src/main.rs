//! homie-ota - Main Entry Point

use clap::{Args, Parser, Subcommand};
use homie_ota::config::{ConfigOverrides, UpdaterConfig};
use homie_ota::error::{OtaError, OtaResult};
use homie_ota::firmware::{Firmware, MetadataError};
use homie_ota::observability::init_default_logging;
use homie_ota::ota::{OtaOrchestrator, RunOptions, Session, EXIT_OK};
use homie_ota::progress::{Progress, TerminalProgress};
use homie_ota::protocol::DeviceTopics;
use homie_ota::transport::mqtt::{ensure_publish_fits, MqttClient};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{debug, info, warn};

/// Over-the-air firmware updates for Homie devices
#[derive(Parser)]
#[command(name = "homie-ota")]
#[command(about = "Push firmware to Homie devices over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a firmware image to a device and wait for it to come back
    Update(UpdateArgs),
    /// Show the Homie metadata embedded in a firmware image
    Info {
        /// Firmware image
        #[arg(long, short = 'f', value_name = "FILE")]
        firmware: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Args)]
struct UpdateArgs {
    /// MQTT broker host
    #[arg(long, short = 'H')]
    host: Option<String>,
    /// MQTT broker port
    #[arg(long, short = 'p')]
    port: Option<u16>,
    /// MQTT username
    #[arg(long, short = 'u')]
    username: Option<String>,
    /// MQTT password
    #[arg(long, short = 'P', env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// CA bundle; enables TLS
    #[arg(long = "tls-cacert", value_name = "FILE")]
    tls_cacert: Option<PathBuf>,
    /// Homie base topic
    #[arg(long, short = 't')]
    base_topic: Option<String>,
    /// Homie device id
    #[arg(long, short = 'd')]
    device_id: Option<String>,
    /// Firmware image to push
    #[arg(long, short = 'f', value_name = "FILE")]
    firmware: Option<PathBuf>,
    /// Seconds to wait for the device to come online
    #[arg(long, value_name = "SECS")]
    online_timeout: Option<u64>,
    /// Push images without Homie metadata markers
    #[arg(long)]
    allow_unrecognized: bool,
    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

impl UpdateArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            tls_ca_cert: self.tls_cacert.clone(),
            base_topic: self.base_topic.clone(),
            device_id: self.device_id.clone(),
            firmware: self.firmware.clone(),
            online_timeout_secs: self.online_timeout,
            allow_unrecognized: self.allow_unrecognized,
        }
    }
}

/// `info` output
#[derive(Serialize)]
struct FirmwareInfo {
    name: String,
    version: String,
    brand: String,
    size: usize,
    checksum: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);
    debug!("homie-ota v{}", env!("CARGO_PKG_VERSION"));

    let result = match &cli.command {
        Commands::Update(args) => run_update(cli.config.as_deref(), args).await,
        Commands::Info { firmware, json } => show_info(firmware, *json),
        Commands::Config { show } => handle_config_command(cli.config.as_deref(), *show),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}.", e.user_message().trim_end_matches('.'));
            process::exit(e.exit_code());
        }
    }
}

fn load_configuration(
    config_path: Option<&Path>,
    overrides: ConfigOverrides,
) -> OtaResult<UpdaterConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
    }
    let mut config = UpdaterConfig::load(config_path)?;
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

async fn run_update(config_path: Option<&Path>, args: &UpdateArgs) -> OtaResult<i32> {
    let config = load_configuration(config_path, args.overrides())?;
    let (device_id, firmware_path) = config.update_target()?;

    // Input problems must surface before any network activity
    let firmware = Firmware::load(firmware_path)?;
    let metadata = match firmware.metadata() {
        Ok(metadata) => Some(metadata),
        Err(MetadataError::NotRecognized) if config.ota.allow_unrecognized => {
            warn!(
                path = %firmware_path.display(),
                "Firmware has no Homie metadata, pushing anyway"
            );
            None
        }
        Err(e) => return Err(e.into()),
    };
    let firmware_topic =
        DeviceTopics::new(&config.device.base_topic, device_id).firmware_topic(firmware.checksum());
    ensure_publish_fits(&firmware_topic, firmware.len(), config.mqtt.max_packet_size).map_err(
        |e| OtaError::invalid_input(format!("Firmware does not fit mqtt.max_packet_size: {e}")),
    )?;

    let transport = MqttClient::new(&config.mqtt)?;
    let session = Session::new(&config.device.base_topic, device_id, firmware, metadata);

    // Keep stdout clean for the JSON report
    let progress: Box<dyn Progress> = if args.json {
        Box::new(TerminalProgress::new(std::io::stderr()))
    } else {
        Box::new(TerminalProgress::stdout())
    };

    let cancel = shutdown_signal()?;
    let report = OtaOrchestrator::new(transport, session, RunOptions::from(&config.ota))
        .with_progress(progress)
        .run(cancel)
        .await;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| OtaError::internal_error(format!("Failed to render report: {e}")))?;
        println!("{json}");
    } else {
        println!("{report}");
    }

    Ok(report.exit_code())
}

/// Resolves on the first SIGINT or SIGTERM
fn shutdown_signal() -> OtaResult<impl std::future::Future<Output = ()> + Send> {
    let install = |kind: signal::unix::SignalKind| {
        signal::unix::signal(kind)
            .map_err(|e| OtaError::internal_error(format!("Failed to install signal handler: {e}")))
    };
    let mut sigint = install(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = install(signal::unix::SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    })
}

fn show_info(path: &Path, json: bool) -> OtaResult<i32> {
    let firmware = Firmware::load(path)?;
    let metadata = firmware.metadata()?;

    let info = FirmwareInfo {
        name: metadata.name,
        version: metadata.version,
        brand: metadata.brand,
        size: firmware.len(),
        checksum: firmware.checksum().to_string(),
    };

    if json {
        let rendered = serde_json::to_string_pretty(&info)
            .map_err(|e| OtaError::internal_error(format!("Failed to render info: {e}")))?;
        println!("{rendered}");
    } else {
        println!("Firmware name: {}", info.name);
        println!("Firmware version: {}", info.version);
        println!("Firmware brand: {}", info.brand);
        println!("Size: {} bytes", info.size);
        println!("MD5 checksum: {}", info.checksum);
    }

    Ok(EXIT_OK)
}

fn handle_config_command(config_path: Option<&Path>, show: bool) -> OtaResult<i32> {
    let config = load_configuration(config_path, ConfigOverrides::default())?;

    if show {
        println!("{}", config.to_redacted_toml()?);
    } else {
        println!("Configuration is valid");
    }

    info!("Configuration validation complete");
    Ok(EXIT_OK)
}
