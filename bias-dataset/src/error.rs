use hardware::DeviceError;
use shared::acquisition_gate::GateError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that terminate a dataset run.
///
/// `rep` is the 1-based repetition number and `bias_index` the 0-based
/// position in that repetition's bias list.
#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("rep {rep}, bias {bias_index}: capture timed out")]
    CaptureTimeout {
        rep: usize,
        bias_index: usize,
        #[source]
        source: GateError,
    },

    #[error("rep {rep}, bias {bias_index}: capture failed")]
    Capture {
        rep: usize,
        bias_index: usize,
        #[source]
        source: GateError,
    },

    #[error("rep {rep}: failed to persist frames: {message}")]
    Persistence { rep: usize, message: String },

    #[error("rep {rep}: stage move failed")]
    Stage {
        rep: usize,
        #[source]
        source: DeviceError,
    },

    #[error("rep {rep}: parameter sweep ended early")]
    SweepExhausted { rep: usize },

    #[error("run cancelled before rep {rep}")]
    Cancelled { rep: usize },

    #[error("sequencer is {state}, not idle")]
    NotIdle { state: String },

    #[error("mirror rejected queued patterns")]
    QueueRejected(#[source] DeviceError),
}

impl ExperimentError {
    pub fn rep(&self) -> Option<usize> {
        match self {
            Self::CaptureTimeout { rep, .. }
            | Self::Capture { rep, .. }
            | Self::Persistence { rep, .. }
            | Self::Stage { rep, .. }
            | Self::SweepExhausted { rep }
            | Self::Cancelled { rep } => Some(*rep),
            _ => None,
        }
    }

    pub fn bias_index(&self) -> Option<usize> {
        match self {
            Self::CaptureTimeout { bias_index, .. } | Self::Capture { bias_index, .. } => {
                Some(*bias_index)
            }
            _ => None,
        }
    }

    /// Classify a gate failure at a given capture
    pub(crate) fn from_gate(rep: usize, bias_index: usize, source: GateError) -> Self {
        match source {
            GateError::CaptureTimeout { .. } => Self::CaptureTimeout {
                rep,
                bias_index,
                source,
            },
            _ => Self::Capture {
                rep,
                bias_index,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gate_timeout_classified() {
        let timeout = GateError::CaptureTimeout {
            camera: "cam".to_string(),
            timeout: Duration::from_secs(2),
        };
        let err = ExperimentError::from_gate(3, 7, timeout);
        assert!(matches!(err, ExperimentError::CaptureTimeout { .. }));
        assert_eq!(err.rep(), Some(3));
        assert_eq!(err.bias_index(), Some(7));
        assert_eq!(err.to_string(), "rep 3, bias 7: capture timed out");

        let lost = GateError::Disconnected {
            camera: "cam".to_string(),
        };
        assert!(matches!(
            ExperimentError::from_gate(1, 0, lost),
            ExperimentError::Capture { .. }
        ));
    }

    #[test]
    fn test_configuration_has_no_location() {
        let err: ExperimentError = ConfigError::Zero { field: "areas" }.into();
        assert_eq!(err.rep(), None);
        assert_eq!(err.bias_index(), None);
    }
}
