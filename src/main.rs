//! icube-capture binary for testing frame acquisition.
#![cfg_attr(
    not(any(feature = "mock", feature = "netusbcam")),
    allow(dead_code, unused_imports)
)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use icube_capture::validation::validate_frame_sequence;
use icube_capture::{AdapterConfig, CameraSdk, OpenRequest, ParamValue, SessionTable};

#[derive(Parser, Debug)]
#[command(name = "icube-capture")]
#[command(about = "Grab frames from a NET iCube camera", long_about = None)]
struct Args {
    /// Camera device index
    #[arg(long, default_value_t = 0)]
    index: u32,

    /// Sensor mode width (camera default when omitted)
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Sensor mode height
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Number of frames to grab
    #[arg(long, default_value_t = 10)]
    frames: u32,

    /// Per-grab timeout in milliseconds (configured default when omitted)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Wait for external trigger pulses instead of firing in software
    #[arg(long)]
    external_trigger: bool,

    /// Adapter configuration file
    #[arg(long, default_value = "icube.toml")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

#[cfg(any(feature = "mock", feature = "netusbcam"))]
fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = AdapterConfig::load_from(&args.config)?;
    capture(backend()?, config, &args)
}

#[cfg(not(any(feature = "mock", feature = "netusbcam")))]
fn run() -> Result<(), Box<dyn Error>> {
    Err("no camera backend compiled in (enable `netusbcam` or `mock`)".into())
}

#[cfg(feature = "netusbcam")]
fn backend() -> Result<Arc<icube_capture::netusbcam::NetUsbCam>, Box<dyn Error>> {
    Ok(Arc::new(icube_capture::netusbcam::NetUsbCam::init()?))
}

#[cfg(all(feature = "mock", not(feature = "netusbcam")))]
fn backend() -> Result<Arc<icube_capture::mock::MockSdk>, Box<dyn Error>> {
    tracing::warn!("Built without the netusbcam feature, using the simulated camera");
    Ok(Arc::new(icube_capture::mock::MockSdk::new(1)))
}

fn capture<S: CameraSdk>(
    sdk: Arc<S>,
    config: AdapterConfig,
    args: &Args,
) -> Result<(), Box<dyn Error>> {
    let table = SessionTable::new(sdk, config);
    tracing::info!(devices = table.device_count(), "Cameras detected");

    let mut request = OpenRequest::new(args.index).with_external_trigger(args.external_trigger);
    if let (Some(width), Some(height)) = (args.width, args.height) {
        request = request.with_resolution(width, height);
    }
    let id = table.open(&request)?;

    for name in ["device_name", "serial_number", "firmware_version"] {
        let value = table.get_param(id, name)?;
        tracing::info!("{name}: {value}");
    }
    if let (Ok(ParamValue::Int(w)), Ok(ParamValue::Int(h))) = (
        table.get_param(id, "image_width"),
        table.get_param(id, "image_height"),
    ) {
        tracing::info!("Format: {w}x{h} mono8");
    }

    let timeout = args.timeout_ms.map(Duration::from_millis);
    let mut frames = Vec::new();
    for _ in 0..args.frames {
        match table.grab(id, timeout) {
            Ok(frame) => {
                tracing::info!(
                    "Frame {}: {} bytes, mean {:.1}",
                    frame.metadata.generation,
                    frame.data.len(),
                    frame.mean()
                );
                frames.push(frame);
            }
            Err(err) => tracing::warn!("Grab failed: {err}"),
        }
    }

    if !frames.is_empty() {
        validate_frame_sequence(&frames)?;
    }
    tracing::info!(grabbed = frames.len(), requested = args.frames, "Done");
    table.close(id)?;
    Ok(())
}
