use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camwatch::{OurError, OurResult};
use camwatch::bridge::EventBridge;
use camwatch::broadcast::ClientHub;
use camwatch::camera_registry::CameraRegistry;
use camwatch::config::{CONFIG_PATH_ENV, Settings};
use camwatch::constants::is_device_path;
use camwatch::enumerator::DeviceState;
use camwatch::monitor::{system_monitor, v4l2_enumerator};
use camwatch::server::{self, AppState};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "camwatch")]
#[command(about = "USB camera hotplug monitor with a JSON-RPC WebSocket API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file to load instead of the default location
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,
        /// Poll the device range instead of using udev notifications
        #[arg(long)]
        polling: bool,
        /// Pause between polling cycles
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Scan for cameras once and print what was found
    Detect {
        /// Inspect a single device, e.g. /dev/video0
        #[arg(long)]
        device: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

fn init_tracing(debug: bool, log_level: &str) {
    let default_level = if debug { "debug" } else { log_level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> OurResult<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path),
        None => Settings::new(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(cli.debug, &settings.log_level);
    if cli.debug {
        debug!("Debug mode enabled");
    }

    match cli.command {
        Commands::Serve {
            host,
            port,
            polling,
            poll_interval_ms,
        } => {
            let mut settings = settings;
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            if polling {
                settings.monitor.use_event_driven = false;
            }
            if let Some(ms) = poll_interval_ms {
                settings.monitor.poll_interval = Duration::from_millis(ms);
            }
            settings.validate()?;
            run_server(settings).await
        }
        Commands::Detect { device } => {
            tokio::task::spawn_blocking(move || detect(&settings, device))
                .await
                .map_err(|e| OurError::Detection(format!("detection task failed: {e}")))?
        }
        Commands::Config { action } => handle_config_command(action, &settings),
    }
}

async fn run_server(settings: Settings) -> OurResult<()> {
    info!("camwatch {} starting up", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(CameraRegistry::new());
    let hub = Arc::new(ClientHub::new());
    let (bridge, receiver) = EventBridge::channel();
    let monitor = Arc::new(system_monitor(
        settings.monitor.clone(),
        registry.clone(),
        bridge,
    ));

    let bridge_task = receiver.spawn(hub.clone());
    monitor.start()?;

    let state = Arc::new(AppState::new(settings, registry, monitor.clone(), hub));
    let result = server::start_server(state).await;

    let stopping = monitor.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        error!("Failed to stop camera monitor: {e}");
    }
    bridge_task.abort();
    info!("camwatch stopped");
    result
}

fn detect(settings: &Settings, device: Option<String>) -> OurResult<()> {
    let enumerator = v4l2_enumerator(&settings.monitor);

    let report = match device {
        Some(device) => {
            if !is_device_path(&device) {
                return Err(OurError::InvalidDevice(device));
            }
            match enumerator.inspect(&device)? {
                DeviceState::Absent => json!({ "device": device, "present": false }),
                DeviceState::Present(capabilities) => json!({
                    "device": device,
                    "present": true,
                    "capabilities": capabilities,
                }),
                DeviceState::Failed(message) => json!({
                    "device": device,
                    "present": true,
                    "error": message,
                }),
            }
        }
        None => {
            info!("Scanning {:?}", settings.monitor.device_range);
            let snapshot = enumerator.enumerate()?;
            json!({
                "devices": snapshot.devices,
                "errors": snapshot.errors,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_config_command(action: ConfigAction, settings: &Settings) -> OurResult<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(settings)?);
            Ok(())
        }
    }
}
