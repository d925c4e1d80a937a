//! Hardware collaborators driven by the acquisition engine.
//!
//! Each device is reached through a trait so that the experiment and
//! sectioning code can run against a real transport or an in-process mock
//! from [`mock`].

pub mod errors;
pub mod mock;

pub use errors::{DeviceError, DeviceResult};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Adaptive-optics device that applies modal aberration vectors.
///
/// Vectors are indexed by Noll mode; index 0 is unused by convention.
pub trait AberrationInterface: Send {
    /// Apply one aberration vector immediately
    fn set_phase(&mut self, coefficients: &[f64]) -> DeviceResult<()>;

    /// Load a list of patterns to be stepped through by hardware triggers
    fn queue_patterns(&mut self, patterns: &[Vec<f64>]) -> DeviceResult<()>;

    /// Settling time after a pattern change
    fn movement_time(&self) -> Duration;
}

impl<T: AberrationInterface + ?Sized> AberrationInterface for Box<T> {
    fn set_phase(&mut self, coefficients: &[f64]) -> DeviceResult<()> {
        (**self).set_phase(coefficients)
    }

    fn queue_patterns(&mut self, patterns: &[Vec<f64>]) -> DeviceResult<()> {
        (**self).queue_patterns(patterns)
    }

    fn movement_time(&self) -> Duration {
        (**self).movement_time()
    }
}

/// Spinning-disk sectioning level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskPosition {
    Bypass,
    High,
    Mid,
    Low,
}

impl DiskPosition {
    pub const ALL: [DiskPosition; 4] = [
        DiskPosition::Bypass,
        DiskPosition::High,
        DiskPosition::Mid,
        DiskPosition::Low,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for DiskPosition {
    type Error = DeviceError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value)
            .copied()
            .ok_or_else(|| DeviceError::OutOfRange(format!("disk position {value}")))
    }
}

impl fmt::Display for DiskPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskPosition::Bypass => "BYPASS",
            DiskPosition::High => "HIGH",
            DiskPosition::Mid => "MID",
            DiskPosition::Low => "LOW",
        };
        write!(f, "{name}")
    }
}

/// Optical-sectioning unit with a filter-cube turret and a spinning disk.
///
/// Position reads return `None` while the mechanism is moving. Setters are
/// fire-and-forget: they return once the command is accepted, not when the
/// motion completes.
pub trait SectioningUnit: Send + Sync {
    fn get_channel_position(&self) -> DeviceResult<Option<usize>>;
    fn set_channel_position(&self, channel: usize) -> DeviceResult<()>;

    fn get_disk_position(&self) -> DeviceResult<Option<DiskPosition>>;
    fn set_disk_position(&self, position: DiskPosition) -> DeviceResult<()>;

    fn get_is_enabled(&self) -> DeviceResult<bool>;
    fn enable(&self) -> DeviceResult<()>;
    fn disable(&self) -> DeviceResult<()>;

    fn door_closed(&self) -> DeviceResult<bool>;

    fn calibration_led(&self) -> DeviceResult<bool>;
    fn set_calibration_led(&self, on: bool) -> DeviceResult<()>;
}

/// Motorised XY stage, positions in microns.
pub trait StageInterface: Send {
    /// Current (x, y, z) position
    fn get_position(&mut self) -> DeviceResult<(f64, f64, f64)>;

    /// Move in XY and block until the motion completes
    fn go_to_xy(&mut self, x_um: f64, y_um: f64) -> DeviceResult<()>;

    /// Move by a relative XY offset, blocking
    fn move_relative_xy(&mut self, dx_um: f64, dy_um: f64) -> DeviceResult<(f64, f64)> {
        let (x, y, _) = self.get_position()?;
        let target = (x + dx_um, y + dy_um);
        self.go_to_xy(target.0, target.1)?;
        Ok(target)
    }
}

impl<T: StageInterface + ?Sized> StageInterface for Box<T> {
    fn get_position(&mut self) -> DeviceResult<(f64, f64, f64)> {
        (**self).get_position()
    }

    fn go_to_xy(&mut self, x_um: f64, y_um: f64) -> DeviceResult<()> {
        (**self).go_to_xy(x_um, y_um)
    }
}
