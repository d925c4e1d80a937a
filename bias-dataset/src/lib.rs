//! Acquisition of bias-aberration image datasets.
//!
//! A dataset is a sweep over sample areas, applied Zernike modes and applied
//! amplitudes. At every sweep position the mirror is stepped through a bias
//! polytope around the applied aberration and one image stack is recorded.

pub mod action_table;
pub mod config;
pub mod error;
pub mod polytope;
pub mod sequencer;
pub mod sweep;

pub use action_table::{
    plan_queued_run, queue_plan, Action, ActionTable, ExposureSetting, PlannedRep, QueuedPlan,
    TimedAction,
};
pub use config::{linspace, ConfigError, SweepConfig, MAX_MODE};
pub use error::ExperimentError;
pub use polytope::make_bias_polytope;
pub use sequencer::{
    CancelToken, DeviceWriteFailure, RepReport, RepResult, RepSequencer, RunReport,
    SequencerState,
};
pub use sweep::{file_prefix, sweep_step, ParameterSweepGenerator, SweepItem, SweepState};
