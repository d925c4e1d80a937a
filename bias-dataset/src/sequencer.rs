//! Repetition driver for a bias-aberration dataset.
//!
//! Each repetition pulls one item from the sweep, applies every bias vector
//! to the mirror in order, captures frames through the acquisition gate and
//! hands the stack to the sink. Repetitions run strictly one after another.

use std::fmt;
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hardware::{AberrationInterface, StageInterface};
use shared::acquisition_gate::{capture_timeout, AcquisitionTimeoutGate};
use shared::camera_interface::{CameraInterface, Frame};
use shared::frame_writer::FrameSink;
use tracing::{debug, error, info, warn};

use crate::config::SweepConfig;
use crate::error::ExperimentError;
use crate::sweep::ParameterSweepGenerator;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of a [`RepSequencer`]. `Complete`, `Failed` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Running { rep: usize },
    Complete,
    Failed { rep: usize, bias_index: Option<usize> },
    Cancelled { rep: usize },
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running { rep } => write!(f, "running rep {rep}"),
            Self::Complete => write!(f, "complete"),
            Self::Failed {
                rep,
                bias_index: Some(bias_index),
            } => write!(f, "failed at rep {rep}, bias {bias_index}"),
            Self::Failed { rep, .. } => write!(f, "failed at rep {rep}"),
            Self::Cancelled { rep } => write!(f, "cancelled before rep {rep}"),
        }
    }
}

/// A mirror write that was rejected; the capture went ahead regardless
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceWriteFailure {
    pub bias_index: usize,
    pub message: String,
}

/// Frames of one repetition, in bias-list order, with the sweep metadata that produced them
#[derive(Debug, Clone)]
pub struct RepResult {
    pub file_prefix: String,
    pub is_new_area: bool,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone)]
pub struct RepReport {
    /// 1-based repetition number
    pub rep: usize,
    /// Name the stack was persisted under
    pub file_name: String,
    pub frame_count: usize,
    /// Captures that failed on the camera and were stored as zero frames
    pub dropped_frames: usize,
    pub device_failures: Vec<DeviceWriteFailure>,
    /// Stage target reached after this repetition, if a new area followed
    pub stage_move: Option<(f64, f64)>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub reps: Vec<RepReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn device_failure_count(&self) -> usize {
        self.reps.iter().map(|r| r.device_failures.len()).sum()
    }
}

/// Cooperative cancellation flag, checked between repetitions
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives a full sweep against one mirror, stage and camera.
///
/// The sequencer owns its devices for the duration of the run.
pub struct RepSequencer<M, S, C> {
    config: SweepConfig,
    sweep: Peekable<ParameterSweepGenerator>,
    mirror: M,
    stage: S,
    camera: C,
    gate: AcquisitionTimeoutGate,
    sink: Arc<dyn FrameSink>,
    state: SequencerState,
    cancel: CancelToken,
}

impl<M, S, C> RepSequencer<M, S, C>
where
    M: AberrationInterface,
    S: StageInterface,
    C: CameraInterface,
{
    pub fn new(
        config: SweepConfig,
        mirror: M,
        stage: S,
        camera: C,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, ExperimentError> {
        let sweep = ParameterSweepGenerator::new(&config)?.peekable();
        let gate = AcquisitionTimeoutGate::new(camera.dispatcher().clone());
        Ok(Self {
            config,
            sweep,
            mirror,
            stage,
            camera,
            gate,
            sink,
            state: SequencerState::Idle,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run every repetition of the sweep.
    ///
    /// # Errors
    /// The first fatal error ends the run and leaves the sequencer in
    /// `Failed` (or `Cancelled`). Rejected mirror writes are not fatal; they
    /// are listed in the returned report.
    pub fn run(&mut self) -> Result<RunReport, ExperimentError> {
        if self.state != SequencerState::Idle {
            return Err(ExperimentError::NotIdle {
                state: self.state.to_string(),
            });
        }

        let num_reps = self.sweep.len();
        let rep_duration = self.config.rep_duration();
        let started = Instant::now();
        let mut reps = Vec::with_capacity(num_reps);

        for rep in 1..=num_reps {
            if self.cancel.is_cancelled() {
                info!("Run cancelled before rep {}/{}", rep, num_reps);
                self.state = SequencerState::Cancelled { rep };
                return Err(ExperimentError::Cancelled { rep });
            }

            self.state = SequencerState::Running { rep };
            info!(
                "Started rep {}/{} Time Elapsed {:.1}s",
                rep,
                num_reps,
                started.elapsed().as_secs_f64()
            );

            let rep_start = Instant::now();
            match self.execute_rep(rep) {
                Ok(report) => reps.push(report),
                Err(e) => {
                    error!("Run aborted: {}", e);
                    self.state = SequencerState::Failed {
                        rep,
                        bias_index: e.bias_index(),
                    };
                    return Err(e);
                }
            }

            if rep < num_reps {
                self.pace(rep_start, rep_duration);
            }
        }

        self.state = SequencerState::Complete;
        let elapsed = started.elapsed();
        info!(
            "-----Experiment Complete----- {} reps in {:.1}s",
            num_reps,
            elapsed.as_secs_f64()
        );
        Ok(RunReport { reps, elapsed })
    }

    /// Sleep out the remainder of the repetition period, waking early on cancel
    fn pace(&self, rep_start: Instant, rep_duration: Duration) {
        while rep_start.elapsed() < rep_duration && !self.cancel.is_cancelled() {
            let remaining = rep_duration.saturating_sub(rep_start.elapsed());
            std::thread::sleep(remaining.min(CANCEL_POLL_INTERVAL));
        }
    }

    fn execute_rep(&mut self, rep: usize) -> Result<RepReport, ExperimentError> {
        let rep_start = Instant::now();
        let item = self
            .sweep
            .next()
            .ok_or(ExperimentError::SweepExhausted { rep })?;
        debug!(
            "Rep {}: area {} mode {} step {:+.3}, {} bias vectors",
            rep,
            item.area,
            item.applied_mode,
            item.step,
            item.bias_list.len()
        );

        let timeout = capture_timeout(self.camera.get_exposure(), self.config.camera_timeout());
        let images_per_rep = self.config.images_per_rep;
        let mut frames = Vec::with_capacity(item.bias_list.len() * images_per_rep);
        let mut device_failures = Vec::new();
        let mut dropped_frames = 0;

        for (bias_index, bias) in item.bias_list.iter().enumerate() {
            if let Err(e) = self.mirror.set_phase(bias) {
                debug!("Rep {} bias {}: mirror write failed: {}", rep, bias_index, e);
                device_failures.push(DeviceWriteFailure {
                    bias_index,
                    message: e.to_string(),
                });
            }

            for _ in 0..images_per_rep {
                let camera = &self.camera;
                let published = self
                    .gate
                    .wait_for_next_frame(|| camera.take_image(), timeout)
                    .map_err(|e| ExperimentError::from_gate(rep, bias_index, e))?;
                if published.dropped {
                    dropped_frames += 1;
                }
                frames.push(Arc::unwrap_or_clone(published.frame));
            }
        }

        if !device_failures.is_empty() {
            warn!(
                "Rep {}: didn't set the aberration on the mirror for {} of {} bias vectors",
                rep,
                device_failures.len(),
                item.bias_list.len()
            );
        }
        if dropped_frames > 0 {
            warn!("Rep {}: {} captures dropped", rep, dropped_frames);
        }

        let result = RepResult {
            file_prefix: item.file_prefix,
            is_new_area: item.is_new_area,
            frames,
        };
        let file_name = self.persist(rep, &result)?;

        let stage_move = if self.sweep.peek().is_some_and(|next| next.is_new_area) {
            Some(self.move_to_new_area(rep)?)
        } else {
            None
        };

        Ok(RepReport {
            rep,
            file_name,
            frame_count: result.frames.len(),
            dropped_frames,
            device_failures,
            stage_move,
            elapsed: rep_start.elapsed(),
        })
    }

    fn persist(&self, rep: usize, result: &RepResult) -> Result<String, ExperimentError> {
        let file_name = format!("{}{}", self.config.save_prefix, result.file_prefix);
        self.sink
            .write_stack(&result.frames, &file_name)
            .map_err(|e| ExperimentError::Persistence {
                rep,
                message: format!("{e:#}"),
            })?;
        debug!("Rep {}: saved {} frames as {}", rep, result.frames.len(), file_name);
        Ok(file_name)
    }

    fn move_to_new_area(&mut self, rep: usize) -> Result<(f64, f64), ExperimentError> {
        let (dx, dy) = self.config.area_offset();
        let target = self
            .stage
            .move_relative_xy(dx, dy)
            .map_err(|source| ExperimentError::Stage { rep, source })?;
        info!(
            "Moved stage to ({:.1}, {:.1}) um for the next area",
            target.0, target.1
        );
        Ok(target)
    }
}
