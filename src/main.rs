//! CLI entry point for xpad-daq
//!
//! Connects to an XPAD server and runs one operation:
//! - `status`: detector description and current state
//! - `snap`: acquire frames and print a per-frame summary
//! - `calibrate`, `load-calibration`, `save-calibration`, `default-config`,
//!   `ithl`, `flat-config`: detector maintenance
//! - `digital-test`: read one synthetic image through the read-out chain
//! - `abort`: abort whatever the server is doing
//!
//! # Usage
//!
//! ```bash
//! xpad-daq --host xpad-server snap --frames 10 --exposure-us 100000
//! xpad-daq calibrate otn --speed fast
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use xpad_daq::config::{XpadConfig, DEFAULT_CONFIG_PATH};
use xpad_daq::engine::{
    CalibrationConfig, CollectingSink, DigitalTestMode, JobOutcome, TransferMode, TriggerMode,
};
use xpad_daq::{logging, ExposureSettings, Frame, XpadDetector};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "xpad-daq")]
#[command(about = "Command-line client for XPAD detector servers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Server host (overrides the configuration)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port (overrides the configuration)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show detector information and state
    Status,

    /// Acquire a sequence of frames
    Snap {
        #[arg(long, default_value = "1")]
        frames: u32,

        #[arg(long, default_value = "1000000")]
        exposure_us: u64,

        #[arg(long, default_value = "5000")]
        latency_us: u64,

        #[arg(long, value_enum, default_value = "internal")]
        trigger: Trigger,

        /// Read frames from the server output directory instead of the socket
        #[arg(long)]
        file_transfer: bool,
    },

    /// Run a calibration
    Calibrate {
        #[command(subcommand)]
        mode: CalibrationMode,
    },

    /// Upload a saved calibration (`<path>.cfg` and `<path>.cfl`)
    LoadCalibration { path: PathBuf },

    /// Save the current calibration (`<path>.cfg` and `<path>.cfl`)
    SaveCalibration { path: PathBuf },

    /// Reset the global registers to their factory values
    DefaultConfig,

    /// Step the ITHL threshold
    Ithl {
        #[arg(value_enum)]
        direction: Direction,
    },

    /// Load the same local configuration value on every pixel
    FlatConfig { value: u32 },

    /// Read one test-pattern image with geometrical correction off
    DigitalTest {
        #[arg(value_enum, default_value = "strip")]
        mode: Pattern,
    },

    /// Abort the current server operation
    Abort,
}

#[derive(Subcommand)]
enum CalibrationMode {
    /// Over-noise calibration
    Otn {
        #[arg(long, value_enum, default_value = "slow")]
        speed: Speed,
    },
    /// Over-noise calibration with pulses
    OtnPulse {
        #[arg(long, value_enum, default_value = "slow")]
        speed: Speed,
    },
    /// Calibration under beam
    Beam {
        #[arg(long)]
        exposure_ms: u64,
        #[arg(long)]
        ithl_max: u32,
        #[arg(long, value_enum, default_value = "slow")]
        speed: Speed,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Speed {
    Slow,
    Medium,
    Fast,
}

impl From<Speed> for CalibrationConfig {
    fn from(speed: Speed) -> Self {
        match speed {
            Speed::Slow => CalibrationConfig::Slow,
            Speed::Medium => CalibrationConfig::Medium,
            Speed::Fast => CalibrationConfig::Fast,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Trigger {
    Internal,
    Gate,
    Multiple,
    Single,
}

impl From<Trigger> for TriggerMode {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Internal => TriggerMode::Internal,
            Trigger::Gate => TriggerMode::ExternalGate,
            Trigger::Multiple => TriggerMode::ExternalTriggerMultiple,
            Trigger::Single => TriggerMode::ExternalTriggerSingle,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Pattern {
    Flat,
    Strip,
    Gradient,
}

impl From<Pattern> for DigitalTestMode {
    fn from(pattern: Pattern) -> Self {
        match pattern {
            Pattern::Flat => DigitalTestMode::Flat,
            Pattern::Strip => DigitalTestMode::Strip,
            Pattern::Gradient => DigitalTestMode::Gradient,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Up,
    Down,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = XpadConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.detector.host = host;
    }
    if let Some(port) = cli.port {
        config.detector.port = port;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    println!("🔭 xpad-daq");
    println!(
        "   Server: {}:{}",
        config.detector.host, config.detector.port
    );
    println!();

    let sink = Arc::new(CollectingSink::new());
    let detector = XpadDetector::connect(config, sink.clone())
        .await
        .context("connecting to XPAD server")?;

    let result = run(&detector, &sink, cli.command).await;
    detector.shutdown().await?;
    result
}

async fn run(detector: &XpadDetector, sink: &CollectingSink, command: Commands) -> Result<()> {
    match command {
        Commands::Status => show_status(detector).await,
        Commands::Snap {
            frames,
            exposure_us,
            latency_us,
            trigger,
            file_transfer,
        } => {
            let settings = ExposureSettings {
                frame_count: frames,
                exposure_time: Duration::from_micros(exposure_us),
                latency_time: Duration::from_micros(latency_us),
                trigger_mode: trigger.into(),
                transfer_mode: file_transfer.then_some(TransferMode::File),
                ..Default::default()
            };
            println!("📸 Acquiring {} frame(s)...", frames);
            detector.snap(settings).await?;
            finish_job(detector).await?;

            for frame in sink.take() {
                print_frame(&frame);
            }
            Ok(())
        }
        Commands::Calibrate { mode } => {
            println!("⚙️  Calibrating...");
            match mode {
                CalibrationMode::Otn { speed } => detector.calibrate_over_noise(speed.into()).await?,
                CalibrationMode::OtnPulse { speed } => {
                    detector.calibrate_over_noise_pulsed(speed.into()).await?
                }
                CalibrationMode::Beam {
                    exposure_ms,
                    ithl_max,
                    speed,
                } => {
                    detector
                        .calibrate_beam(Duration::from_millis(exposure_ms), ithl_max, speed.into())
                        .await?
                }
            }
            finish_job(detector).await
        }
        Commands::LoadCalibration { path } => {
            println!("📂 Loading calibration from {}", path.display());
            detector.load_calibration(path).await?;
            finish_job(detector).await
        }
        Commands::SaveCalibration { path } => {
            println!("💾 Saving calibration to {}", path.display());
            detector.save_calibration(path).await?;
            finish_job(detector).await
        }
        Commands::DefaultConfig => {
            detector.load_default_global_config().await?;
            finish_job(detector).await
        }
        Commands::Ithl { direction } => {
            match direction {
                Direction::Up => detector.increase_threshold().await?,
                Direction::Down => detector.decrease_threshold().await?,
            }
            finish_job(detector).await
        }
        Commands::FlatConfig { value } => {
            detector.load_flat_local_config(value).await?;
            finish_job(detector).await
        }
        Commands::DigitalTest { mode } => {
            println!("🧪 Digital test...");
            detector.digital_test(mode.into()).await?;
            finish_job(detector).await?;
            for frame in sink.take() {
                print_frame(&frame);
            }
            Ok(())
        }
        Commands::Abort => {
            detector.abort().await?;
            println!("🛑 Abort sent");
            Ok(())
        }
    }
}

async fn show_status(detector: &XpadDetector) -> Result<()> {
    let info = detector.info();
    let status = detector.status().await?;

    println!("📋 Detector");
    println!("   Type:    {} ({})", info.detector_type, info.model);
    println!(
        "   Modules: {} (mask {:#x}), chips {} (mask {:#x})",
        info.module_count, info.module_mask, info.chip_count, info.chip_mask
    );
    println!("   Image:   {} x {}", info.image_rows, info.image_columns);
    println!("   Burst:   {}", info.burst_number);
    println!("   State:   {}", status.state);
    if let (Some(frame), Some(done)) = (status.frame_number, status.completed_frames) {
        println!("   Frame:   {} ({} completed)", frame, done);
    }
    Ok(())
}

/// Wait for the submitted job; Ctrl+C aborts it.
async fn finish_job(detector: &XpadDetector) -> Result<()> {
    tokio::select! {
        _ = detector.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\n🛑 Aborting...");
            detector.abort().await?;
            detector.wait_idle().await;
        }
    }

    let Some(report) = detector.last_report() else {
        bail!("job finished without a report");
    };
    match report.result {
        Ok(JobOutcome::Completed) => {
            println!("✅ {} completed ({} frame(s))", report.job, report.acquired_frames);
            Ok(())
        }
        Ok(outcome) => {
            println!("⚠️  {} stopped: {:?}", report.job, outcome);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {} failed: {}", report.job, e);
            bail!("{} failed", report.job)
        }
    }
}

fn print_frame(frame: &Frame) {
    let d = &frame.descriptor;
    let values = (0..frame.pixels.len()).filter_map(|i| frame.pixels.get(i));
    let (min, max) = values.fold((u32::MAX, 0), |(lo, hi), v| (lo.min(v), hi.max(v)));
    println!(
        "   #{:<4} {}x{} {}-bit  min {} max {}",
        d.sequence_number,
        d.width,
        d.height,
        d.bit_depth,
        min.min(max),
        max
    );
}
