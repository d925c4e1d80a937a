//! Bias-aberration dataset acquisition against in-process devices.
//!
//! Runs the full sweep with a mock mirror, stage and camera and writes every
//! repetition as a PNG stack, or with `--plan-only` prints the queued action
//! table for the hardware-timed variant.

use anyhow::{Context, Result};
use bias_dataset::{
    plan_queued_run, queue_plan, ExposureSetting, ParameterSweepGenerator, RepSequencer,
    SweepConfig,
};
use clap::Parser;
use hardware::mock::{MockMirror, MockStage};
use hardware::AberrationInterface;
use shared::camera_interface::mock::MockCamera;
use shared::camera_interface::CameraInterface;
use shared::config_storage::{resolve_save_base, ConfigStorage};
use shared::frame_writer::FrameWriterHandle;
use shared::image_size::PixelShape;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SWEEP_PRESET_KIND: &str = "sweep";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Acquire a bias-aberration image dataset"
)]
struct Args {
    #[arg(
        long,
        help = "JSON sweep configuration",
        long_help = "Path to a JSON file holding the sweep configuration. When given, it \
            replaces all sweep options on the command line; fields missing from the file \
            take their defaults."
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        conflicts_with = "config",
        help = "Load the sweep from a stored preset",
        long_help = "Name of a sweep preset stored under ~/.acq_config/sweep/. Replaces the \
            sweep options on the command line."
    )]
    preset: Option<String>,

    #[arg(long, help = "Store the resolved sweep as a named preset before running")]
    save_preset: Option<String>,

    #[command(flatten)]
    sweep: SweepConfig,

    #[arg(long, help = "Print the queued action table and exit")]
    plan_only: bool,

    #[arg(long, default_value = "4", help = "Number of frame writer threads")]
    writer_threads: usize,

    #[arg(
        short = 'e',
        long,
        default_value = "10",
        help = "Camera exposure time in milliseconds"
    )]
    exposure_ms: u64,

    #[arg(long, default_value = "512")]
    sensor_width: usize,

    #[arg(long, default_value = "512")]
    sensor_height: usize,
}

fn preset_storage() -> Result<ConfigStorage> {
    ConfigStorage::new().context("Failed to locate config storage")
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let config = match (&args.config, &args.preset) {
        (Some(path), _) => SweepConfig::from_json_file(path)?,
        (None, Some(name)) => {
            let config: SweepConfig = preset_storage()?
                .load_preset(SWEEP_PRESET_KIND, name)
                .with_context(|| format!("No sweep preset named '{name}'"))?
                .with_context(|| format!("Failed to load sweep preset '{name}'"))?;
            config.validate()?;
            config
        }
        (None, None) => {
            args.sweep.validate()?;
            args.sweep.clone()
        }
    };
    if let Some(name) = &args.save_preset {
        preset_storage()?
            .save_preset(SWEEP_PRESET_KIND, name, &config)
            .with_context(|| format!("Failed to save sweep preset '{name}'"))?;
        info!("Saved sweep preset '{}'", name);
    }
    info!(
        "Sweep: {} reps of {} bias vectors, bias modes {:?}, applied modes {:?}",
        config.num_reps(),
        config.vectors_per_rep(),
        config.bias_modes,
        config.applied_modes
    );

    let camera = MockCamera::new_zeros(
        "mock",
        PixelShape::new(args.sensor_width, args.sensor_height),
    )
    .with_exposure(Duration::from_millis(args.exposure_ms));
    let mut mirror = MockMirror::new();

    if args.plan_only {
        let exposures = vec![ExposureSetting {
            cameras: vec![camera.name().to_string()],
            exposure: camera.get_exposure(),
        }];
        let plan = plan_queued_run(
            ParameterSweepGenerator::new(&config)?,
            mirror.movement_time(),
            &exposures,
            config.rep_duration(),
        )?;
        queue_plan(&mut mirror, &plan)?;
        println!("{}", serde_json::to_string_pretty(&plan.table)?);
        return Ok(());
    }

    let base = resolve_save_base(config.save_path.as_deref())
        .context("Failed to resolve save directory")?;
    info!("Saving to {}", base.display());
    let writer = Arc::new(FrameWriterHandle::new(base.clone(), args.writer_threads, 64)?);

    let mut sequencer = RepSequencer::new(
        config,
        mirror,
        MockStage::new(0.0, 0.0, 0.0),
        camera,
        writer.clone(),
    )?;
    let report = sequencer.run()?;

    writer.wait_for_completion();
    info!(
        "Wrote {} stacks in {:.1}s, {} rejected mirror writes",
        report.reps.len(),
        report.elapsed.as_secs_f64(),
        report.device_failure_count()
    );
    if writer.failed_writes() > 0 {
        warn!("{} frame writes failed", writer.failed_writes());
    }
    Ok(())
}
