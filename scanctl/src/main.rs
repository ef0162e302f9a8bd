/*!
# scanctl

Headless capture client for a scanning-beam microscope. Connects to the
scan-control server over TCP (or an in-process mock engine), runs one
raster capture, and reports frame statistics. Logging goes to stderr;
stdout carries only the `--json` statistics output.

## Usage

### Capture one 1024x1024 16-bit frame
```bash
scanctl capture --host 192.168.1.50
```

### Capture a region of interest against the mock engine
```bash
scanctl capture --mock --x-res 512 --y-res 512 --roi 128,128,64,64 --json
```

### Generate a configuration file
```bash
scanctl config scanctl.toml
```
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

mod config;
mod connection;
mod framebuffer;
mod mock;
mod raster;

use config::MicroscopeConfig;
use connection::Connection;
use framebuffer::{CaptureOptions, Frame, FrameBuffer, Samples};
use mock::MockScanEngine;
use shared::{DwellTime, OutputMode, ScanRegion};

#[derive(Parser)]
#[command(name = "scanctl")]
#[command(about = "Scanning-beam microscope capture client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a frame and report statistics
    Capture(CaptureArgs),

    /// Generate a configuration file with default values
    Config {
        /// Output path for the configuration file
        #[arg(default_value = "scanctl.toml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct CaptureArgs {
    /// Scan server host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Scan server TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Capture against an in-process mock engine instead of hardware
    #[arg(long)]
    mock: bool,

    /// Full-frame resolution in X
    #[arg(long)]
    x_res: Option<u16>,

    /// Full-frame resolution in Y
    #[arg(long)]
    y_res: Option<u16>,

    /// Dwell time per pixel in clock cycles
    #[arg(long)]
    dwell: Option<u16>,

    /// Sample width in bits (8 or 16)
    #[arg(long)]
    bits: Option<u8>,

    /// Region of interest as x_start,y_start,x_count,y_count
    #[arg(long, value_parser = parse_roi)]
    roi: Option<ScanRegion>,

    /// Scan continuously until Ctrl-C instead of capturing one frame
    #[arg(long)]
    free_run: bool,

    /// Print capture statistics as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Save the raw frame data into this directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

/// Capture statistics for the `--json` output
#[derive(Serialize)]
struct CaptureStats {
    x_res: u16,
    y_res: u16,
    x_start: u16,
    y_start: u16,
    x_count: u16,
    y_count: u16,
    bits: u8,
    pixel_count: usize,
    filled: usize,
    aborted: bool,
    elapsed_ms: u128,
    saved_to: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging to stderr keeps stdout clean for --json output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MicroscopeConfig::load_from_file(path)?,
        None => MicroscopeConfig::default(),
    };

    match cli.command {
        Commands::Capture(args) => run_capture(&config, &args).await,
        Commands::Config { output } => {
            config.save_to_file(&output)?;
            info!("configuration written to {}", output.display());
            Ok(())
        }
    }
}

async fn run_capture(config: &MicroscopeConfig, args: &CaptureArgs) -> Result<()> {
    let bits = args.bits.unwrap_or(config.capture.output_bits);
    let output = match bits {
        8 => OutputMode::EightBit,
        16 => OutputMode::SixteenBit,
        other => bail!("unsupported sample width: {other} bits (expected 8 or 16)"),
    };
    let x_res = args.x_res.unwrap_or(config.capture.x_resolution);
    let y_res = args.y_res.unwrap_or(config.capture.y_resolution);
    let dwell = DwellTime::new(args.dwell.unwrap_or(config.capture.dwell_cycles))?;
    let free_run = args.free_run || config.capture.free_run;

    let conn = if args.mock {
        let (near, far) = tokio::io::duplex(1024 * 1024);
        tokio::spawn(async move {
            if let Err(err) = MockScanEngine::new(far).run().await {
                warn!("mock scan engine stopped: {err}");
            }
        });
        info!("capturing against the mock scan engine");
        Connection::from_stream(near)
    } else {
        let host = args.host.as_deref().unwrap_or(&config.server.host);
        let port = args.port.unwrap_or(config.server.port);
        Connection::open(host, port).await?
    };

    let frame_buffer = Arc::new(FrameBuffer::new(conn, config.axis_transforms()));

    // Ctrl-C aborts the scan; the capture still returns its partial frame
    {
        let frame_buffer = Arc::clone(&frame_buffer);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, aborting scan");
                frame_buffer.abort_scan();
            }
        });
    }

    let options = CaptureOptions {
        x_res,
        y_res,
        region: args.roi,
        dwell,
        output,
        free_run,
    };

    let started = Instant::now();
    let frame = frame_buffer.capture_frame(&options).await?;
    let elapsed = started.elapsed();

    let saved_to = match &args.output_dir {
        Some(dir) => {
            let path = save_frame(&frame, dir, bits)?;
            info!("frame written to {}", path.display());
            Some(path)
        }
        None => None,
    };

    let (x_count, y_count) = frame.shape();
    let (x_start, y_start) = frame.origin();
    let stats = CaptureStats {
        x_res,
        y_res,
        x_start,
        y_start,
        x_count,
        y_count,
        bits,
        pixel_count: frame.pixel_count(),
        filled: frame.filled(),
        aborted: frame_buffer.is_aborted(),
        elapsed_ms: elapsed.as_millis(),
        saved_to,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        info!(
            "captured {}x{} frame at ({}, {}): {}/{} samples{} in {:.2?}",
            stats.x_count,
            stats.y_count,
            stats.x_start,
            stats.y_start,
            stats.filled,
            stats.pixel_count,
            if stats.aborted { " (aborted)" } else { "" },
            elapsed,
        );
    }

    Ok(())
}

/// Write the frame's samples as a raw binary dump (16-bit samples go out
/// big-endian) under a timestamped name, creating the directory if needed
fn save_frame(frame: &Frame, dir: &Path, bits: u8) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let (x_count, y_count) = frame.shape();
    let filename = format!(
        "frame_{}_{}x{}_{}bit.raw",
        Local::now().format("%Y%m%d_%H%M%S"),
        x_count,
        y_count,
        bits,
    );
    let path = dir.join(filename);

    let data = match frame.pixels() {
        Samples::Eight(samples) => samples.clone(),
        Samples::Sixteen(samples) => {
            let mut bytes = Vec::with_capacity(samples.len() * 2);
            for sample in samples {
                bytes.extend_from_slice(&sample.to_be_bytes());
            }
            bytes
        }
    };
    std::fs::write(&path, data)
        .with_context(|| format!("Failed to write frame file: {}", path.display()))?;

    Ok(path)
}

fn parse_roi(text: &str) -> std::result::Result<ScanRegion, String> {
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 4 {
        return Err("expected x_start,y_start,x_count,y_count".to_string());
    }
    let mut values = [0u16; 4];
    for (value, part) in values.iter_mut().zip(&parts) {
        *value = part
            .trim()
            .parse()
            .map_err(|_| format!("invalid ROI component: {part}"))?;
    }
    Ok(ScanRegion {
        x_start: values[0],
        y_start: values[1],
        x_count: values[2],
        y_count: values[3],
    })
}
