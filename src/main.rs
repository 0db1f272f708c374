//! Mixbridge - physical slider deck to host volume control.
//!
//! Wires the device connection, config hot-reload and session directory
//! together and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mixbridge::config::{default_config_path, watcher::ConfigWatcher, AppConfig};
use mixbridge::connection::{hid::HidConnection, serial::SerialConnection, DeviceConnection};
use mixbridge::events::{ButtonEvent, SliderMoveEvent};
use mixbridge::notifier::{LogNotifier, Notifier};
use mixbridge::sessions::{pulse::SessionDirectory, MatchingPolicy};
use mixbridge::targets::{resolve_sessions, NullVolumeSource, TargetMapping};

/// Mixbridge - control per-application volume from a hardware slider deck
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,

    /// Log every parsed line and event
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.verbose)?;

    if args.list_ports {
        list_ports_formatted();
        return Ok(());
    }

    let config_path = args.config.unwrap_or_else(default_config_path);
    info!("Starting Mixbridge...");
    info!("Configuration file: {}", config_path);

    let notifier = LogNotifier;

    // Load configuration with hot-reload watcher
    let (config_watcher, config) = match ConfigWatcher::new(config_path.clone()).await {
        Ok(loaded) => loaded,
        Err(e) => {
            notifier.notify(
                "Can't find configuration!",
                &format!("Config must be located at {} and be valid YAML.", config_path),
            );
            return Err(e);
        }
    };
    info!("Configuration loaded successfully with hot-reload enabled");

    run_app(config, config_watcher, notifier).await
}

async fn run_app(
    config: Arc<AppConfig>,
    watcher: ConfigWatcher,
    notifier: impl Notifier + 'static,
) -> Result<()> {
    // Build the connection variant for the configured transport.
    let connection: Arc<dyn DeviceConnection> = if config.enable_hid_listen {
        Arc::new(HidConnection::new(
            &config,
            Arc::new(NullVolumeSource),
            watcher.subscribe(),
        ))
    } else {
        Arc::new(SerialConnection::new(&config, watcher.subscribe()))
    };
    info!("Using {}", connection.descriptor());

    let slider_rx = connection.subscribe_slider_moves();
    let button_rx = connection.subscribe_button_events();

    // Session resolution runs on its own thread: the directory makes
    // synchronous wire round trips and is not Send.
    spawn_volume_router(
        Arc::clone(&config),
        watcher.subscribe(),
        slider_rx,
        button_rx,
    );

    // First connection attempt runs in the background - the serial variant
    // retries inside start() until the deck shows up.
    let starter = Arc::clone(&connection);
    tokio::spawn(async move {
        if let Err(e) = starter.start().await {
            warn!("Failed to start first-time device connection: {}", e);
            notifier.notify(
                "Can't connect to the deck!",
                "Check the connection settings; saving the config file retries automatically.",
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Shutdown signal received, stopping");

    connection.stop().await;
    info!("Mixbridge shutdown complete");

    Ok(())
}

/// Bridge deck events to session resolution.
///
/// Owns a `SessionDirectory` on a dedicated thread and, for every event,
/// resolves which sessions its targets address and what volume they would
/// get. Pushing that volume through OS mixer APIs is deliberately left to
/// an external applier; this router logs the resolution.
fn spawn_volume_router(
    config: Arc<AppConfig>,
    mut reloads: broadcast::Receiver<Arc<AppConfig>>,
    mut sliders: mpsc::Receiver<SliderMoveEvent>,
    mut buttons: mpsc::Receiver<ButtonEvent>,
) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Failed to build volume router runtime: {}", e);
                return;
            }
        };

        runtime.block_on(async move {
            let policy = MatchingPolicy::from_config(&config.matching);
            let directory = match SessionDirectory::connect(policy) {
                Ok(directory) => directory,
                Err(e) => {
                    warn!("Audio session directory unavailable: {}", e);
                    return;
                }
            };

            let mut slider_mapping = config.slider_mapping.clone();
            let mut button_mapping = config.button_mapping.clone();

            loop {
                tokio::select! {
                    slider = sliders.recv() => match slider {
                        Some(event) => {
                            route_slider(&directory, &slider_mapping, event);
                        }
                        None => break,
                    },
                    button = buttons.recv() => match button {
                        Some(event) => {
                            let targets = button_mapping.targets_for(event.button);
                            info!(
                                button = event.button,
                                value = event.value,
                                ?targets,
                                "Button changed"
                            );
                        }
                        None => break,
                    },
                    reload = reloads.recv() => match reload {
                        Ok(new_config) => {
                            slider_mapping = new_config.slider_mapping.clone();
                            button_mapping = new_config.button_mapping.clone();
                            debug!("Volume router picked up new target mappings");
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            directory.release();
        });
    });
}

fn route_slider(directory: &SessionDirectory, mapping: &TargetMapping, event: SliderMoveEvent) {
    let targets = mapping.targets_for(event.slider);
    if targets.is_empty() {
        debug!(slider = event.slider, "Slider is unmapped, ignoring");
        return;
    }

    match directory.get_all_sessions() {
        Ok(sessions) => {
            let matched = resolve_sessions(&sessions, &targets);
            if matched.is_empty() {
                debug!(slider = event.slider, ?targets, "No session matches targets");
            }
            for session in matched {
                info!(
                    "Would set '{}' to {:.0}%",
                    session.display_name(),
                    event.value * 100.0
                );
            }
        }
        Err(e) => warn!("Failed to enumerate audio sessions: {}", e),
    }
}

fn init_logging(level: &str, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

fn list_ports_formatted() {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => println!("No serial ports found."),
        Ok(ports) => {
            println!("Available serial ports:");
            for port in ports {
                match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        println!("  {} (USB {:04x}:{:04x})", port.port_name, usb.vid, usb.pid);
                    }
                    _ => println!("  {}", port.port_name),
                }
            }
        }
        Err(e) => eprintln!("Failed to enumerate serial ports: {}", e),
    }
}
