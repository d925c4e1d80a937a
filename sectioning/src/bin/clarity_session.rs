//! Calibrate every turret channel of a mock sectioning unit, run a few
//! status polls with sectioning on, and save the deformation maps.

use anyhow::{Context, Result};
use clap::Parser;
use hardware::mock::MockClarity;
use hardware::{DiskPosition, SectioningUnit};
use ndarray::Array2;
use sectioning::{
    ClarityConfig, SectioningController, SectioningEvent, SettlePolicy, SplitFieldFitter,
    CHANNEL_COUNT, STATUS_POLL_PERIOD,
};
use shared::acquisition_gate::{capture_timeout, AcquisitionTimeoutGate};
use shared::camera_interface::mock::MockCamera;
use shared::camera_interface::{CameraInterface, Frame};
use shared::config_storage::resolve_save_base;
use shared::frame_writer::FrameWriterHandle;
use shared::image_size::PixelShape;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LABELS: &str = "DAPI\nGFP\nmCherry\nCy5\n";

#[derive(Parser, Debug)]
#[command(author, version, about = "Calibrate a sectioning unit and export its deformation maps")]
struct Args {
    #[arg(
        long,
        help = "File with one filter cube label per line",
        long_help = "Newline-separated filter cube labels, one per turret position. Blank \
            lines are ignored and exactly four labels are required."
    )]
    labels: Option<PathBuf>,

    #[arg(long, default_value = "mock", help = "Camera the sectioning unit feeds")]
    camera: String,

    #[arg(long, help = "Directory for the deformation archive (defaults to $HOME)")]
    save_path: Option<PathBuf>,

    #[arg(long, default_value = "clarity_deforms")]
    archive_name: String,

    #[arg(long, default_value = "3", help = "Status polls to run with sectioning on")]
    polls: usize,

    #[arg(
        long,
        help = "Interval between status polls in milliseconds",
        long_help = "Interval between status polls in milliseconds. Defaults to the \
            controller's status poll period."
    )]
    poll_interval_ms: Option<u64>,

    #[arg(long, default_value = "512")]
    sensor_width: usize,

    #[arg(long, default_value = "256")]
    sensor_height: usize,
}

/// Two side-by-side fields with a mild gradient, as the unit's camera sees them
fn split_field_frame(shape: PixelShape) -> Frame {
    Array2::from_shape_fn(shape.to_dim(), |(y, x)| {
        1000 + ((x * 7 + y * 3) % 200) as u16
    })
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let labels = match &args.labels {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read labels from {}", path.display()))?,
        None => DEFAULT_LABELS.to_string(),
    };
    let config = ClarityConfig::from_labels(&labels, &args.camera)?;

    let shape = PixelShape::new(args.sensor_width, args.sensor_height);
    let camera = Arc::new(MockCamera::new_repeating(&args.camera, split_field_frame(shape)));
    let unit = Arc::new(MockClarity::new().with_settle_reads(2));

    let controller = SectioningController::new(
        unit.clone(),
        camera.dispatcher().clone(),
        config.clone(),
        Box::new(SplitFieldFitter),
    )
    .with_settle_policy(SettlePolicy {
        poll_interval: Duration::from_millis(5),
        max_wait: Duration::from_secs(1),
    });
    controller.register_callback(|event| match event {
        SectioningEvent::StatusChanged(status) => info!("Status: {}", status),
        SectioningEvent::SectioningToggled { enabled, automatic } => {
            info!("Sectioning {} (automatic: {})", if *enabled { "on" } else { "off" }, automatic)
        }
        SectioningEvent::Calibrated { channel, label } => {
            info!("Calibrated channel {} ({})", channel, label)
        }
    });

    controller.toggle_state(true)?;
    controller.set_disk_position(DiskPosition::Mid)?;

    let gate = AcquisitionTimeoutGate::new(camera.dispatcher().clone());
    let timeout = capture_timeout(camera.get_exposure(), Duration::from_secs(2));

    controller.set_calibration_led(true)?;
    for channel in 0..CHANNEL_COUNT {
        controller.set_channel_position(channel)?;
        let frame = gate.wait_for_next_frame(|| camera.take_image(), timeout)?;
        controller.calibrate(&frame.frame)?;
    }
    controller.set_calibration_led(false)?;

    controller.set_sectioning(true)?;
    let sectioned = gate.wait_for_next_frame(|| camera.take_image(), timeout)?;
    info!(
        "Sectioned frame {} from raw {}",
        PixelShape::of_frame(&sectioned.frame),
        shape
    );

    let poll_interval = args
        .poll_interval_ms
        .map_or(STATUS_POLL_PERIOD, Duration::from_millis);
    for _ in 0..args.polls {
        let report = controller.poll();
        info!(
            "{} channel {:?} disk {:?} calibrated {} door {:?}",
            report.status, report.channel, report.disk, report.calibrated, report.door_closed
        );
        std::thread::sleep(poll_interval);
    }
    info!("Unit enabled: {}", unit.get_is_enabled()?);

    let base = resolve_save_base(args.save_path.as_deref())
        .context("Failed to resolve save directory")?;
    let writer = FrameWriterHandle::new(base, 1, 4)?;
    let channels = controller.export_deforms(&writer, &args.archive_name)?;
    info!(
        "Exported {} channels to {}",
        channels,
        writer.root().join(format!("{}.json", args.archive_name)).display()
    );
    Ok(())
}
