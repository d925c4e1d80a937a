//! Sweep configuration.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} lists mode {mode} more than once")]
    DuplicateMode { field: &'static str, mode: usize },

    #[error("{field} lists mode {mode}, above the highest supported Noll index {}", MAX_MODE)]
    ModeOutOfRange { field: &'static str, mode: usize },

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("{field} has invalid value {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("save prefix '{0}' may only contain letters, digits, '-' and '_'")]
    UnsafePrefix(String),

    #[error("offset axis {axis} outside aberration vector of length {len}")]
    AxisOutOfRange { axis: usize, len: usize },

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Parameters of a bias-aberration dataset run.
///
/// Use with `#[command(flatten)]` in a CLI args struct, or load from JSON;
/// missing JSON fields take their defaults.
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Noll indices perturbed around each applied aberration.
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [4usize, 5, 6, 7, 10],
        help = "Bias modes (Noll indices)",
        long_help = "Comma-separated Noll indices of the modes used as bias axes. Each \
            repetition images the base aberration plus a positive and a negative bias \
            along every one of these modes."
    )]
    pub bias_modes: Vec<usize>,

    /// Applied aberrations span [-abb_magnitude, +abb_magnitude].
    #[arg(long, default_value_t = 5.0, help = "Magnitude of applied aberrations")]
    pub abb_magnitude: f64,

    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [4usize, 5, 6, 7, 10],
        help = "Applied modes (Noll indices)"
    )]
    pub applied_modes: Vec<usize>,

    /// Number of evenly spaced applied amplitudes per mode.
    #[arg(
        long,
        default_value_t = 5,
        help = "Number of applied amplitudes per mode",
        long_help = "Number of samples evenly spaced across [-abb-magnitude, +abb-magnitude], \
            endpoints included. A single sample is placed at -abb-magnitude."
    )]
    pub applied_step: usize,

    /// Repeat count; each area after the first is imaged at a new stage position.
    #[arg(long, default_value_t = 1, help = "Number of sample areas")]
    pub areas: usize,

    /// Bias amplitudes added and subtracted along each bias mode.
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [1.0f64],
        help = "Bias step magnitudes"
    )]
    pub bias_steps: Vec<f64>,

    /// Minimum duration of one repetition, seconds.
    #[arg(long, default_value_t = 4.0, help = "Minimum repetition duration in seconds")]
    pub rep_duration_s: f64,

    /// Frames captured per bias vector.
    #[arg(long, default_value_t = 1, help = "Frames captured per bias vector")]
    pub images_per_rep: usize,

    #[arg(long, default_value = "BIDE_", help = "Prefix of saved file names")]
    pub save_prefix: String,

    #[arg(
        long,
        help = "Directory for saved data",
        long_help = "Directory under which image stacks are written. Defaults to the home \
            directory."
    )]
    pub save_path: Option<PathBuf>,

    /// Stage offset applied before each new area, microns.
    #[arg(long, default_value_t = 50.0, allow_hyphen_values = true)]
    pub area_offset_x_um: f64,

    #[arg(long, default_value_t = -50.0, allow_hyphen_values = true)]
    pub area_offset_y_um: f64,

    /// Time allowed beyond the exposure for a frame to arrive, seconds.
    #[arg(long, default_value_t = 2.0, help = "Capture timeout margin in seconds")]
    pub camera_timeout_s: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            bias_modes: vec![4, 5, 6, 7, 10],
            abb_magnitude: 5.0,
            applied_modes: vec![4, 5, 6, 7, 10],
            applied_step: 5,
            areas: 1,
            bias_steps: vec![1.0],
            rep_duration_s: 4.0,
            images_per_rep: 1,
            save_prefix: "BIDE_".to_string(),
            save_path: None,
            area_offset_x_um: 50.0,
            area_offset_y_um: -50.0,
            camera_timeout_s: 2.0,
        }
    }
}

/// Highest Noll index a mirror aberration vector can address
pub const MAX_MODE: usize = 256;

fn check_modes(field: &'static str, modes: &[usize]) -> Result<(), ConfigError> {
    if modes.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    let mut seen = HashSet::new();
    for &mode in modes {
        if mode > MAX_MODE {
            return Err(ConfigError::ModeOutOfRange { field, mode });
        }
        if !seen.insert(mode) {
            return Err(ConfigError::DuplicateMode { field, mode });
        }
    }
    Ok(())
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn check_duration(field: &'static str, seconds: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidValue {
        field,
        value: seconds.to_string(),
    })
}

impl SweepConfig {
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_modes("bias_modes", &self.bias_modes)?;
        check_modes("applied_modes", &self.applied_modes)?;

        if self.applied_step == 0 {
            return Err(ConfigError::Zero {
                field: "applied_step",
            });
        }
        if self.areas == 0 {
            return Err(ConfigError::Zero { field: "areas" });
        }
        if self.images_per_rep == 0 {
            return Err(ConfigError::Zero {
                field: "images_per_rep",
            });
        }
        if self.bias_steps.is_empty() {
            return Err(ConfigError::Empty {
                field: "bias_steps",
            });
        }

        check_non_negative("abb_magnitude", self.abb_magnitude)?;
        check_duration("rep_duration_s", self.rep_duration_s)?;
        check_duration("camera_timeout_s", self.camera_timeout_s)?;
        for &step in &self.bias_steps {
            if !step.is_finite() {
                return Err(ConfigError::InvalidValue {
                    field: "bias_steps",
                    value: step.to_string(),
                });
            }
        }
        for (field, value) in [
            ("area_offset_x_um", self.area_offset_x_um),
            ("area_offset_y_um", self.area_offset_y_um),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidValue {
                    field,
                    value: value.to_string(),
                });
            }
        }

        if !self
            .save_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::UnsafePrefix(self.save_prefix.clone()));
        }
        Ok(())
    }

    /// Applied amplitudes, evenly spaced across [-abb_magnitude, abb_magnitude]
    pub fn applied_steps(&self) -> Vec<f64> {
        linspace(-self.abb_magnitude, self.abb_magnitude, self.applied_step)
    }

    /// Number of repetitions: one per (area, applied mode, applied step)
    pub fn num_reps(&self) -> usize {
        self.applied_step * self.applied_modes.len() * self.areas
    }

    /// Bias vectors per repetition
    pub fn vectors_per_rep(&self) -> usize {
        1 + 2 * self.bias_modes.len() * self.bias_steps.len()
    }

    /// Length of the aberration vector, large enough to index every mode
    pub fn mode_vector_len(&self) -> Result<usize, ConfigError> {
        let Some(&max) = self.bias_modes.iter().chain(&self.applied_modes).max() else {
            return Ok(0);
        };
        if max > MAX_MODE {
            return Err(ConfigError::ModeOutOfRange {
                field: "modes",
                mode: max,
            });
        }
        max.checked_add(1).ok_or(ConfigError::ModeOutOfRange {
            field: "modes",
            mode: max,
        })
    }

    /// Minimum repetition duration; zero when the configured value is unusable
    pub fn rep_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.rep_duration_s).unwrap_or(Duration::ZERO)
    }

    /// Capture timeout margin; the default margin when the configured value is unusable
    pub fn camera_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.camera_timeout_s).unwrap_or(Duration::from_secs(2))
    }

    pub fn area_offset(&self) -> (f64, f64) {
        (self.area_offset_x_um, self.area_offset_y_um)
    }
}

/// `count` evenly spaced samples from `start` to `stop` inclusive.
///
/// A single sample is `start`; the last of several is exactly `stop`.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count)
                .map(|i| {
                    if i == count - 1 {
                        stop
                    } else {
                        start + step * i as f64
                    }
                })
                .collect()
        }
    }
}
