//! CLI Entry Point for telemetry-monitor
//!
//! Headless consumer of the ingestion pipeline:
//! - List serial ports
//! - Stream a serial device
//! - Replay a recorded drive
//!
//! Runs until Ctrl-C, then disconnects cleanly.
//!
//! # Usage
//!
//! ```bash
//! telemetry-monitor ports
//! telemetry-monitor serial /dev/ttyUSB0 --baud 115200
//! telemetry-monitor --json replay drive.json --speed 4
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use telemetry_ingest::config::TelemetryConfig;
use telemetry_ingest::events::EventObserver;
use telemetry_ingest::logging;
use telemetry_ingest::pipeline::DataHandler;
use telemetry_ingest::record::Record;
use telemetry_ingest::transport::{DiscoveredDevice, TransportKind, TransportSpec};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "telemetry-monitor")]
#[command(about = "Vehicle telemetry monitor (serial, replay)", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = telemetry_ingest::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print records as JSON lines instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Stream records from a serial port
    Serial {
        /// Port name (e.g. /dev/ttyUSB0, COM3)
        port: String,

        /// Baud rate (defaults to serial.baud_rate)
        #[arg(long)]
        baud: Option<u32>,
    },

    /// Replay a recorded JSON or CSV file
    Replay {
        /// Path to the recording
        file: PathBuf,

        /// Playback speed multiplier (defaults to replay.speed)
        #[arg(long)]
        speed: Option<f64>,
    },
}

/// Prints every event to stdout.
struct Printer {
    json: bool,
}

impl EventObserver for Printer {
    fn on_record(&mut self, record: &Record) {
        if self.json {
            match serde_json::to_string(record) {
                Ok(line) => println!("{}", line),
                Err(e) => error!(error = %e, "Failed to encode record"),
            }
        } else {
            println!(
                "{:>10} ms  {:>5} rpm  {:>3} km/h  {:>4} °C  {:>3} %  {:<12}  link {} ({} dBm)",
                record.timestamp_ms(),
                record.engine_rpm(),
                record.speed_kph(),
                record.coolant_temp_c(),
                record.throttle_pct(),
                record.system_state().as_str(),
                if record.link_connected() { "up" } else { "down" },
                record.link_signal_dbm(),
            );
        }
    }

    fn on_status(&mut self, connected: bool, message: &str) {
        info!(connected, "{}", message);
    }

    fn on_error(&mut self, message: &str) {
        error!("{}", message);
    }

    fn on_devices_discovered(&mut self, devices: &[DiscoveredDevice]) {
        for device in devices {
            info!(name = device.display_name(), address = %device.address, "Device");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TelemetryConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    let spec = match cli.command {
        Commands::Ports => return list_ports(config),
        Commands::Serial { port, baud } => TransportSpec::Serial {
            port,
            baud_rate: baud.unwrap_or(config.serial.baud_rate),
        },
        Commands::Replay { file, speed } => TransportSpec::Replay {
            path: file,
            speed: speed.unwrap_or(config.replay.speed),
        },
    };

    run(config, spec, cli.json).await
}

fn list_ports(config: TelemetryConfig) -> Result<()> {
    let handler = DataHandler::with_config(config);
    let ports = handler.probe(TransportKind::ByteStream)?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{:<24} {}", port.id, port.description);
    }
    Ok(())
}

async fn run(config: TelemetryConfig, spec: TransportSpec, json: bool) -> Result<()> {
    let handler = DataHandler::with_config(config);
    let printer = handler.attach(Printer { json });

    handler.connect(spec).await?;
    info!("Streaming; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    handler.disconnect().await?;

    drop(handler);
    printer.abort();
    Ok(())
}
