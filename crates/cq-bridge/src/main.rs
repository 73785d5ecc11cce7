use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cq_bridge::config::{BridgeConfig, LoggingSection};
use cq_bridge::{ControlDispatcher, ControllerEvent};
use cq_link::{ConnectionManager, Endpoint};

#[derive(Parser, Debug)]
#[command(name = "cq-bridge", about = "Bluetooth foot controller bridge for CQ mixers")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/bridge.toml", env = "CQ_BRIDGE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load(&args.config)?;
    // Held for the process lifetime so buffered log lines reach the file
    let _log_guard = init_logging(&config.logging)?;

    let settings = config.link_settings()?;
    let plan = config.dispatch_plan()?;

    info!(config = %args.config.display(), "CQ foot controller bridge starting");
    match settings.mixer_ip {
        Some(ip) => {
            let mixer = Endpoint::new(ip, settings.mixer_port);
            info!(mixer = %mixer, "Using configured mixer address");
        }
        None => info!("No mixer address configured, discovering on the local network"),
    }

    let link = ConnectionManager::new(settings);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        result = link.connect() => result?,
        _ = &mut shutdown => {
            info!("Interrupted before the mixer was reached");
            link.shutdown().await;
            return Ok(());
        }
    }

    let (events_tx, mut events) = mpsc::unbounded_channel::<ControllerEvent>();
    let _input = match start_input(&config, events_tx) {
        Ok(input) => input,
        Err(e) => {
            error!(error = %e, "Foot controller unavailable");
            link.shutdown().await;
            return Err(e);
        }
    };

    let mut dispatcher = ControlDispatcher::new(plan, link.clone());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(behavior) = dispatcher.handle(event).await {
                        debug!(
                            behavior = %behavior,
                            controller = event.controller,
                            "Footswitch handled"
                        );
                    }
                }
                None => {
                    warn!("Foot controller input closed");
                    break;
                }
            },
        }
    }

    link.shutdown().await;
    Ok(())
}

/// `RUST_LOG` wins over `[logging] level`. A configured file gets a copy of
/// everything written to stdout, rotated daily with old files pruned.
fn init_logging(logging: &LoggingSection) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid logging.level '{}'", logging.level))?;

    let file = logging.file.trim();
    if file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let appender = file_appender(Path::new(file), logging.retained_files())?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();

    Ok(Some(guard))
}

/// Daily-rotated `path.YYYY-MM-DD` files, at most `max_files` of them.
fn file_appender(path: &Path, max_files: usize) -> anyhow::Result<RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("logging.file '{}' has no file name", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .max_log_files(max_files)
        .build(dir)
        .with_context(|| format!("opening log file {}", path.display()))
}

#[cfg(feature = "midi-input")]
fn start_input(
    config: &BridgeConfig,
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> anyhow::Result<cq_bridge::midi_input::ControllerInput> {
    let input = cq_bridge::midi_input::open_controller(&config.midi_input, events)?;
    info!(port = %input.port_name, "Foot controller connected");
    Ok(input)
}

/// Without MIDI support the bridge only holds the mixer link; the sender is
/// kept so the event loop stays open until Ctrl-C.
#[cfg(not(feature = "midi-input"))]
fn start_input(
    _config: &BridgeConfig,
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> anyhow::Result<mpsc::UnboundedSender<ControllerEvent>> {
    warn!("Built without the midi-input feature; no foot controller will be read");
    Ok(events)
}
