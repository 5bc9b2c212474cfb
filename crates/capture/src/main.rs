//! bmp-traceswo
//!
//! Streams trace output from a Black Magic Probe's capture interface to
//! stdout. Keeps retrying while the probe is absent and re-attaches after it
//! is unplugged.

use anyhow::{Context, Result, anyhow};
use capture::config::{CaptureConfig, parse_hex};
use capture::usb::{DeviceAcquirer, RusbTransport};
use capture::{LoopStats, spawn_capture_thread};
use clap::Parser;
use common::{ShutdownSignal, setup_logging};
use protocol::MarkerCheck;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// How long to wait for the capture thread after Ctrl+C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "bmp-traceswo")]
#[command(
    author,
    version,
    about = "Print trace output captured by a Black Magic Probe"
)]
#[command(long_about = "
Reads the trace capture interface of a Black Magic Probe and prints the
decoded debug output to stdout. Status messages go to stderr.

The probe does not need to be connected at startup; it is picked up as soon
as it appears and re-attached automatically after being unplugged.

EXAMPLES:
    # Capture with default settings
    bmp-traceswo

    # Capture from a probe with a different product ID
    bmp-traceswo --pid 0x6017

    # Show attached USB devices and exit
    bmp-traceswo --list-devices

    # Reject frames unless both marker bytes match
    bmp-traceswo --strict-marker

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/bmp-traceswo/config.toml
    3. /etc/bmp-traceswo/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// USB vendor ID of the probe (hex)
    #[arg(long, value_name = "VID", value_parser = parse_u16_hex)]
    vid: Option<u16>,

    /// USB product ID of the probe (hex)
    #[arg(long, value_name = "PID", value_parser = parse_u16_hex)]
    pid: Option<u16>,

    /// Trace capture interface number
    #[arg(long, value_name = "NUM")]
    interface: Option<u8>,

    /// Trace bulk IN endpoint address (hex)
    #[arg(long, value_name = "ADDR", value_parser = parse_u8_hex)]
    endpoint: Option<u8>,

    /// Require both marker bytes to match
    #[arg(long)]
    strict_marker: bool,
}

impl Args {
    /// Apply command line overrides on top of the loaded configuration
    fn apply(&self, config: &mut CaptureConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(vid) = self.vid {
            config.device.vendor_id = vid;
        }
        if let Some(pid) = self.pid {
            config.device.product_id = pid;
        }
        if let Some(interface) = self.interface {
            config.device.interface = interface;
        }
        if let Some(endpoint) = self.endpoint {
            config.device.endpoint = endpoint;
        }
        if self.strict_marker {
            config.decoder.marker_check = MarkerCheck::Both;
        }
    }
}

fn parse_u16_hex(s: &str) -> std::result::Result<u16, String> {
    let value = parse_hex(s)?;
    u16::try_from(value).map_err(|_| format!("'{}' does not fit in 16 bits", s))
}

fn parse_u8_hex(s: &str) -> std::result::Result<u8, String> {
    let value = parse_hex(s)?;
    u8::try_from(value).map_err(|_| format!("'{}' does not fit in 8 bits", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        eprintln!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CaptureConfig::load_from(path).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default().context("Failed to load configuration")?
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.logging.level).context("Failed to setup logging")?;

    info!("bmp-traceswo v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.logging.level);

    let transport = RusbTransport::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(transport, &config);
    }

    run_capture(transport, config).await
}

/// List USB devices and exit
fn list_devices_mode(transport: RusbTransport, config: &CaptureConfig) -> Result<()> {
    let acquirer = DeviceAcquirer::new(transport, config);
    let devices = acquirer.list().context("Failed to list USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in &devices {
        let marker = if device.matches(acquirer.identity()) {
            "  <- target"
        } else {
            ""
        };
        println!("  {}{}", device, marker);
    }

    Ok(())
}

/// Run the capture loop until Ctrl+C or a fatal error
async fn run_capture(transport: RusbTransport, config: CaptureConfig) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let (done_tx, mut done_rx) = oneshot::channel();

    // USB I/O blocks, so the loop gets its own thread
    let _capture_thread = spawn_capture_thread(
        transport,
        config,
        std::io::stdout(),
        shutdown.clone(),
        move |result| {
            let _ = done_tx.send(result);
        },
    )
    .context("Failed to spawn capture thread")?;

    tokio::select! {
        result = &mut done_rx => {
            let stats = result.map_err(|_| anyhow!("Capture thread exited without a result"))??;
            log_stats(&stats);
            return Ok(());
        }
        signal = signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
    }

    shutdown.trigger();

    match tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await {
        Ok(Ok(result)) => log_stats(&result?),
        Ok(Err(_)) => warn!("Capture thread exited without a result"),
        // A read without timeout cannot be interrupted; leaving main ends it
        Err(_) => warn!("Capture thread still blocked in a USB read, exiting anyway"),
    }

    Ok(())
}

fn log_stats(stats: &LoopStats) {
    info!(
        "Captured {} bytes over {} session(s), {} disconnect(s), {} transfer error(s), {} invalid frame(s)",
        stats.bytes_written,
        stats.sessions,
        stats.devices_lost,
        stats.transfer_errors,
        stats.invalid_frames
    );
}
