//! Local Relay CLI - relays gateway control commands to a serial RF transmitter.
//!
//! This is the main binary entry point. See the `local_relay` library
//! for the core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use local_relay::constants::VERSION;
use local_relay::serial::{available_ports, SystemPorts};
use local_relay::{Config, ConfigStore, RelayEvent, RelayOrchestrator};
use mimalloc::MiMalloc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "local-relay")]
#[command(version = VERSION)]
#[command(about = "Relays hub control commands from the gateway to a serial RF transmitter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted
    Start {
        /// Serial port to open (overrides the configured one)
        #[arg(long)]
        port: Option<String>,
        /// Hub to relay for (overrides the configured one)
        #[arg(long)]
        hub: Option<Uuid>,
    },
    /// List serial ports on this machine
    Ports,
    /// Show the configuration, or set one key
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, hub } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(run_relay(port, hub))?;
        }
        Commands::Ports => {
            let ports = available_ports()?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                match port.description {
                    Some(description) => println!("{}\t{description}", port.name),
                    None => println!("{}", port.name),
                }
            }
        }
        Commands::Config { key, value } => {
            let mut config = Config::load()?;
            match (key, value) {
                (None, _) => println!("{}", serde_json::to_string_pretty(&config.redacted())?),
                (Some(k), None) => {
                    let shown = serde_json::to_value(config.redacted())?;
                    match shown.get(&k) {
                        Some(v) => println!("{v}"),
                        None => println!("{k} is not set"),
                    }
                }
                (Some(k), Some(v)) => {
                    config.set_key(&k, &v)?;
                    config.save()?;
                    println!("Set {k}");
                }
            }
        }
    }

    Ok(())
}

/// Log to stderr, or to `LOCAL_RELAY_LOG_FILE` when set.
fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("LOCAL_RELAY_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

async fn run_relay(port: Option<String>, hub: Option<Uuid>) -> Result<()> {
    let store = ConfigStore::open()?;
    let relay = RelayOrchestrator::new(store, Arc::new(SystemPorts));

    let mirror = tokio::spawn(mirror_console(relay.clone()));
    let states = tokio::spawn(log_states(relay.clone()));

    if port.is_none() && hub.is_none() {
        relay.auto_connect().await;
    } else {
        if let Some(port) = port {
            relay.select_port(&port).await?;
        }
        if let Some(hub) = hub {
            if let Some(outcome) = relay.select_hub(hub).await? {
                log::info!("[Relay] Hub connect: {outcome:?}");
            }
        }
    }

    log::info!("Local Relay {VERSION} running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");

    mirror.abort();
    states.abort();
    relay.shutdown().await
}

/// Echo completed console lines from the transmitter to the log.
async fn mirror_console(relay: RelayOrchestrator) {
    let mut events = relay.subscribe();
    let mut cursor = 0;

    loop {
        match events.recv().await {
            Ok(RelayEvent::ConsoleUpdated) | Err(RecvError::Lagged(_)) => {
                let (lines, next) = relay.completed_console_lines_since(cursor);
                cursor = next;
                for line in lines {
                    log::info!("[Console] {}", line.trim_end());
                }
            }
            Ok(RelayEvent::SerialClosed) => {
                log::warn!("[Serial] Port closed");
                cursor = 0;
            }
            Ok(RelayEvent::DeviceNotFound) => {
                log::error!("[Relay] Hub unknown to the gateway, select another hub");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn log_states(relay: RelayOrchestrator) {
    let mut state = relay.watch_state();
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        log::info!("[Relay] Gateway {current:?}");
    }
}
