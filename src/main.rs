//! Run the driver against the simulated SDK: connect, optionally cool down,
//! take a few exposures and report what arrives on the frame channel.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use svbony_ccd::sdk::simulated::SimulatedSdk;
use svbony_ccd::sdk::ControlType;
use svbony_ccd::{ChannelSink, DriverConfig, FrameEvent, SvbonyCamera};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "svbony_sim")]
#[command(about = "Exercise the SVBONY driver against a simulated camera")]
struct Args {
    /// Driver configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of exposures to take
    #[arg(short = 'n', long, default_value_t = 3)]
    frames: u32,

    /// Exposure time in seconds
    #[arg(short, long, default_value_t = 0.5)]
    exposure: f64,

    /// Gain to apply before exposing
    #[arg(long)]
    gain: Option<f64>,

    /// Cool to this temperature (Celsius) before exposing
    #[arg(long)]
    cool_to: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DriverConfig::load(args.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !(args.exposure.is_finite() && args.exposure > 0.0) {
        bail!("exposure must be a positive number of seconds");
    }

    let sdk = Arc::new(SimulatedSdk::new());
    let (sink, mut frames) = ChannelSink::new(config.frame_channel_capacity);
    let camera = SvbonyCamera::connect(sdk, config, Arc::new(sink)).context("connecting camera")?;

    if let Some(gain) = args.gain {
        camera.set_control(ControlType::Gain, gain)?;
    }
    if let Some(target) = args.cool_to {
        let status = camera.set_temperature(target)?;
        info!(target, ?status, "Cooling");
    }

    let exposure = Duration::from_secs_f64(args.exposure);
    for _ in 0..args.frames {
        camera.start_exposure(exposure)?;
        match frames.recv().await {
            Some(FrameEvent::Frame(frame)) => info!(
                frame = frame.frame_number,
                width = frame.width,
                height = frame.height,
                temperature_c = ?frame.temperature_c,
                "Frame received"
            ),
            Some(FrameEvent::CaptureFailed(e)) => warn!(error = %e, "Capture failed"),
            None => break,
        }
        camera.wait_idle().await;
    }

    for keyword in camera.fits_keywords() {
        info!(name = keyword.name, value = ?keyword.value, "Header keyword");
    }
    if let Err(e) = camera.persist_settings() {
        warn!(error = %e, "Failed to save settings");
    }
    camera.disconnect().await?;
    Ok(())
}
