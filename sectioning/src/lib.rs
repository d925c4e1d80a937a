//! Optical sectioning for a spinning-disk unit with a filter-cube turret.
//!
//! Each turret position (channel) is calibrated separately from a raw camera
//! frame. While sectioning is on, the controller keeps a post-processor in
//! the camera's chain that applies the live channel's calibration, and the
//! status poll switches sectioning off when the live channel has none.

pub mod calibration;
pub mod callback;
pub mod config;
pub mod controller;
pub mod processor;

pub use calibration::{CalibrationEntry, CalibrationError, CalibrationStore, CHANNEL_COUNT};
pub use callback::{CallbackId, DeviceStatus, SectioningEvent, StatusReport};
pub use config::{ClarityConfig, ConfigError};
pub use controller::{
    SectioningController, SettlePolicy, PRIORITY_SECTIONING, STATUS_POLL_PERIOD,
};
pub use processor::{
    DeformMaps, FitError, ProcessorFitter, SectioningProcessor, SplitFieldFitter,
    SplitFieldProcessor,
};
