//! Sectioning unit configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::CHANNEL_COUNT;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected four filter cube labels, found {found}")]
    WrongLabelCount { found: usize },

    #[error("missing camera name")]
    MissingCamera,
}

/// Labels of the filter-cube turret positions and the camera behind them.
///
/// Positions without a cube should still get a label such as "Empty".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarityConfig {
    pub filter_cubes: Vec<String>,
    pub camera: String,
}

impl ClarityConfig {
    /// Parse newline-separated labels; blank lines are skipped.
    pub fn from_labels(labels: &str, camera: &str) -> Result<Self, ConfigError> {
        let config = Self {
            filter_cubes: labels
                .lines()
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect(),
            camera: camera.trim().to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter_cubes.len() != CHANNEL_COUNT {
            return Err(ConfigError::WrongLabelCount {
                found: self.filter_cubes.len(),
            });
        }
        if self.camera.is_empty() {
            return Err(ConfigError::MissingCamera);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_labels_skipping_blank_lines() {
        let config = ClarityConfig::from_labels("\nDAPI\nGFP\n\ndsRed\nCy5\n", "Prime BSI").unwrap();
        assert_eq!(config.filter_cubes, vec!["DAPI", "GFP", "dsRed", "Cy5"]);
        assert_eq!(config.camera, "Prime BSI");
    }

    #[test]
    fn test_rejects_wrong_label_count() {
        assert_eq!(
            ClarityConfig::from_labels("DAPI\nGFP\ndsRed", "cam").unwrap_err(),
            ConfigError::WrongLabelCount { found: 3 }
        );
        assert!(ClarityConfig::from_labels("a\nb\nc\nd\ne", "cam").is_err());
    }

    #[test]
    fn test_rejects_missing_camera() {
        assert_eq!(
            ClarityConfig::from_labels("a\nb\nc\nd", "  ").unwrap_err(),
            ConfigError::MissingCamera
        );
    }

    #[test]
    fn test_deserialized_config_validates() {
        let config: ClarityConfig = serde_json::from_str(
            r#"{"filter_cubes": ["DAPI", "GFP", "dsRed", "Empty"], "camera": "cam"}"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }
}
