//! Per-channel sectioning calibrations.

use hardware::DeviceError;
use shared::camera_interface::Frame;
use shared::frame_writer::ArchiveData;
use shared::post_processing::ChainError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::ClarityConfig;
use crate::processor::{DeformMaps, FitError, ProcessorFitter, SectioningProcessor};

/// Number of filter-cube positions on the turret
pub const CHANNEL_COUNT: usize = 4;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("no deformation maps found, calibrate at least one channel")]
    NoCalibration,

    #[error("channel {channel} is not calibrated")]
    NotCalibrated { channel: usize },

    #[error("channel position still indeterminate after {waited:?}")]
    ChannelUnsettled { waited: Duration },

    #[error("channel {channel} out of range")]
    ChannelOutOfRange { channel: usize },

    #[error("cannot calibrate while sectioning is active")]
    SectioningActive,

    #[error("fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("post-processing chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("failed to persist deformation maps: {0}")]
    Persistence(String),
}

/// Fitted calibration for one channel
#[derive(Clone)]
pub struct CalibrationEntry {
    pub processor: Arc<dyn SectioningProcessor>,
    pub deforms: DeformMaps,
}

/// Calibrations keyed by channel, labelled by filter cube.
///
/// Entries are only replaced by a new calibration of the same channel, never
/// cleared.
pub struct CalibrationStore {
    labels: Vec<String>,
    entries: Vec<Option<CalibrationEntry>>,
    fitter: Box<dyn ProcessorFitter>,
}

impl CalibrationStore {
    pub fn new(config: &ClarityConfig, fitter: Box<dyn ProcessorFitter>) -> Self {
        Self {
            labels: config.filter_cubes.clone(),
            entries: vec![None; CHANNEL_COUNT],
            fitter,
        }
    }

    fn check_channel(channel: usize) -> Result<(), CalibrationError> {
        if channel >= CHANNEL_COUNT {
            return Err(CalibrationError::ChannelOutOfRange { channel });
        }
        Ok(())
    }

    /// Fit a processor from `frame` for `channel`, replacing any previous one.
    ///
    /// The caller is responsible for `channel` being the settled position the
    /// frame was taken at.
    pub fn calibrate(&mut self, channel: usize, frame: &Frame) -> Result<(), CalibrationError> {
        Self::check_channel(channel)?;
        info!(
            "Calibrating channel {} ({}) from {:?} frame",
            channel,
            self.labels[channel],
            frame.dim()
        );

        let processor: Arc<dyn SectioningProcessor> = Arc::from(self.fitter.fit(frame)?);
        let deforms = processor.deforms();
        self.entries[channel] = Some(CalibrationEntry { processor, deforms });

        info!("Channel {} calibrated", channel);
        Ok(())
    }

    pub fn is_calibrated(&self, channel: usize) -> bool {
        self.entries
            .get(channel)
            .map_or(false, |entry| entry.is_some())
    }

    pub fn processor(&self, channel: usize) -> Option<Arc<dyn SectioningProcessor>> {
        self.entries
            .get(channel)?
            .as_ref()
            .map(|entry| entry.processor.clone())
    }

    pub fn entry(&self, channel: usize) -> Option<&CalibrationEntry> {
        self.entries.get(channel)?.as_ref()
    }

    pub fn label(&self, channel: usize) -> Option<&str> {
        self.labels.get(channel).map(String::as_str)
    }

    pub fn calibrated_channels(&self) -> Vec<usize> {
        (0..CHANNEL_COUNT)
            .filter(|&channel| self.is_calibrated(channel))
            .collect()
    }

    /// Deformation maps of every calibrated channel, keyed by filter-cube label.
    ///
    /// # Errors
    /// [`CalibrationError::NoCalibration`] when no channel is calibrated.
    pub fn export_deforms(&self) -> Result<ArchiveData, CalibrationError> {
        let archive: ArchiveData = self
            .entries
            .iter()
            .zip(&self.labels)
            .filter_map(|(entry, label)| {
                entry
                    .as_ref()
                    .map(|entry| (label.clone(), entry.deforms.clone()))
            })
            .collect();

        if archive.is_empty() {
            return Err(CalibrationError::NoCalibration);
        }
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::SplitFieldFitter;
    use ndarray::Array2;

    fn store() -> CalibrationStore {
        let config = ClarityConfig::from_labels("DAPI\nGFP\ndsRed\nCy5", "cam").unwrap();
        CalibrationStore::new(&config, Box::new(SplitFieldFitter))
    }

    fn calibration_frame() -> Frame {
        Array2::from_elem((4, 8), 100)
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = store();
        assert!(store.calibrated_channels().is_empty());
        assert!((0..CHANNEL_COUNT).all(|c| !store.is_calibrated(c)));
        assert!(store.processor(0).is_none());
    }

    #[test]
    fn test_export_without_calibration_fails() {
        assert!(matches!(
            store().export_deforms(),
            Err(CalibrationError::NoCalibration)
        ));
    }

    #[test]
    fn test_calibrate_channel_two_exports_one_label() {
        let mut store = store();
        store.calibrate(2, &calibration_frame()).unwrap();

        assert!(store.is_calibrated(2));
        assert_eq!(store.calibrated_channels(), vec![2]);

        let archive = store.export_deforms().unwrap();
        assert_eq!(archive.keys().collect::<Vec<_>>(), vec!["dsRed"]);
        assert!(archive["dsRed"].contains_key("gain_in"));
    }

    #[test]
    fn test_recalibration_replaces_entry() {
        let mut store = store();
        store.calibrate(1, &calibration_frame()).unwrap();

        let mut brighter = calibration_frame();
        brighter[[0, 0]] = 200;
        store.calibrate(1, &brighter).unwrap();

        let gain = &store.entry(1).unwrap().deforms["gain_in"];
        assert!(gain[[0, 0]] < 1.0);
        assert_eq!(store.calibrated_channels(), vec![1]);
    }

    #[test]
    fn test_out_of_range_channel() {
        let mut store = store();
        assert!(matches!(
            store.calibrate(4, &calibration_frame()),
            Err(CalibrationError::ChannelOutOfRange { channel: 4 })
        ));
        assert!(!store.is_calibrated(4));
        assert!(store.label(4).is_none());
    }

    #[test]
    fn test_failed_fit_keeps_previous_entry() {
        let mut store = store();
        store.calibrate(0, &calibration_frame()).unwrap();

        let dark = Array2::zeros((4, 8));
        assert!(matches!(
            store.calibrate(0, &dark),
            Err(CalibrationError::Fit(_))
        ));
        assert!(store.is_calibrated(0));
    }
}
