//! Sectioning processors and their fitting from calibration frames.
//!
//! The sectioning camera image carries two side-by-side fields of the same
//! specimen: the in-focus (pinhole) field on the left and the out-of-focus
//! (reflected) field on the right. A processor subtracts the second from the
//! first, so its output is half the width of its input.

use ndarray::{s, Array2, ArrayView2, Zip};
use shared::camera_interface::Frame;
use shared::image_size::PixelShape;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Named deformation maps produced by a fitted processor
pub type DeformMaps = BTreeMap<String, Array2<f32>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("calibration frame is {width} pixels wide, need at least 2")]
    FrameTooNarrow { width: usize },

    #[error("calibration field '{field}' has no signal")]
    DarkField { field: &'static str },
}

/// A processor fitted for one channel.
pub trait SectioningProcessor: Send + Sync {
    /// Sectioned image; output shape is [`sectioned_shape`] of the input shape
    fn process(&self, frame: &Frame) -> Frame;

    /// Maps describing the fitted correction
    fn deforms(&self) -> DeformMaps;
}

/// Builds a processor from a calibration frame.
pub trait ProcessorFitter: Send + Sync {
    fn fit(&self, frame: &Frame) -> Result<Box<dyn SectioningProcessor>, FitError>;
}

/// Shape of a sectioned frame given the raw (width, height)
pub fn sectioned_shape(shape: PixelShape) -> PixelShape {
    PixelShape::new(shape.width / 2, shape.height)
}

/// Left field of a raw frame, unprocessed
pub fn left_half(frame: &Frame) -> Frame {
    let half = frame.ncols() / 2;
    frame.slice(s![.., ..half]).to_owned()
}

fn split_fields(frame: &Frame) -> (ArrayView2<'_, u16>, ArrayView2<'_, u16>) {
    let half = frame.ncols() / 2;
    (
        frame.slice(s![.., ..half]),
        frame.slice(s![.., half..2 * half]),
    )
}

fn flat_field_gain(field: ArrayView2<'_, u16>, name: &'static str) -> Result<Array2<f32>, FitError> {
    let mean = field.iter().map(|&v| v as f64).sum::<f64>() / field.len().max(1) as f64;
    if mean <= 0.0 {
        return Err(FitError::DarkField { field: name });
    }
    Ok(field.mapv(|v| if v == 0 { 0.0 } else { (mean / v as f64) as f32 }))
}

/// Flat-field corrected difference of the two fields
#[derive(Debug, Clone)]
pub struct SplitFieldProcessor {
    gain_in: Array2<f32>,
    gain_out: Array2<f32>,
}

impl SplitFieldProcessor {
    pub fn fit(frame: &Frame) -> Result<Self, FitError> {
        if frame.ncols() < 2 {
            return Err(FitError::FrameTooNarrow {
                width: frame.ncols(),
            });
        }
        let (field_in, field_out) = split_fields(frame);
        Ok(Self {
            gain_in: flat_field_gain(field_in, "in")?,
            gain_out: flat_field_gain(field_out, "out")?,
        })
    }

    /// Raw shape this processor was fitted for
    pub fn raw_shape(&self) -> PixelShape {
        let (height, half) = self.gain_in.dim();
        PixelShape::new(half * 2, height)
    }
}

impl SectioningProcessor for SplitFieldProcessor {
    fn process(&self, frame: &Frame) -> Frame {
        let (field_in, field_out) = split_fields(frame);
        if field_in.dim() != self.gain_in.dim() {
            warn!(
                "Frame {} does not match calibration {}, passing left field through",
                PixelShape::of_frame(frame),
                self.raw_shape()
            );
            return left_half(frame);
        }

        let mut out = Array2::<u16>::zeros(field_in.dim());
        Zip::from(&mut out)
            .and(&field_in)
            .and(&field_out)
            .and(&self.gain_in)
            .and(&self.gain_out)
            .for_each(|o, &a, &b, &ga, &gb| {
                let value = a as f32 * ga - b as f32 * gb;
                *o = value.round().clamp(0.0, u16::MAX as f32) as u16;
            });
        out
    }

    fn deforms(&self) -> DeformMaps {
        let mut maps = DeformMaps::new();
        maps.insert("gain_in".to_string(), self.gain_in.clone());
        maps.insert("gain_out".to_string(), self.gain_out.clone());
        maps
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SplitFieldFitter;

impl ProcessorFitter for SplitFieldFitter {
    fn fit(&self, frame: &Frame) -> Result<Box<dyn SectioningProcessor>, FitError> {
        Ok(Box::new(SplitFieldProcessor::fit(frame)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Raw frame with uniform fields of the given values
    fn fields(height: usize, half: usize, inner: u16, outer: u16) -> Frame {
        Array2::from_shape_fn((height, 2 * half), |(_, c)| if c < half { inner } else { outer })
    }

    #[test]
    fn test_sectioned_shape_halves_width() {
        assert_eq!(
            sectioned_shape(PixelShape::new(2048, 1024)),
            PixelShape::new(1024, 1024)
        );
        assert_eq!(
            sectioned_shape(PixelShape::new(5, 3)),
            PixelShape::new(2, 3)
        );
    }

    #[test]
    fn test_uniform_calibration_gives_unit_gain() {
        let processor = SplitFieldProcessor::fit(&fields(4, 6, 200, 100)).unwrap();
        let deforms = processor.deforms();

        assert_eq!(deforms.len(), 2);
        for gain in deforms.values() {
            assert_eq!(gain.dim(), (4, 6));
            for &g in gain.iter() {
                assert_abs_diff_eq!(g, 1.0, epsilon = 1e-6);
            }
        }
        assert_eq!(processor.raw_shape(), PixelShape::new(12, 4));
    }

    #[test]
    fn test_process_subtracts_out_of_focus_field() {
        let processor = SplitFieldProcessor::fit(&fields(4, 6, 200, 100)).unwrap();
        let out = processor.process(&fields(4, 6, 900, 300));

        assert_eq!(out.dim(), (4, 6));
        assert!(out.iter().all(|&v| v == 600));
    }

    #[test]
    fn test_process_clamps_negative_to_zero() {
        let processor = SplitFieldProcessor::fit(&fields(2, 2, 100, 100)).unwrap();
        let out = processor.process(&fields(2, 2, 10, 500));
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_gain_corrects_vignetting() {
        let mut calibration = fields(1, 2, 100, 100);
        // Left field pixel 1 reads half as bright
        calibration[[0, 1]] = 50;
        let processor = SplitFieldProcessor::fit(&calibration).unwrap();

        let mut raw = fields(1, 2, 400, 0);
        raw[[0, 1]] = 200;
        let out = processor.process(&raw);

        // Both pixels corrected to the same level: mean 75 scales 400 -> 300 and 200 -> 300
        assert_eq!(out[[0, 0]], out[[0, 1]]);
        assert_eq!(out[[0, 0]], 300);
    }

    #[test]
    fn test_zero_pixels_get_zero_gain() {
        let mut calibration = fields(1, 2, 100, 100);
        calibration[[0, 0]] = 0;
        let processor = SplitFieldProcessor::fit(&calibration).unwrap();
        assert_abs_diff_eq!(processor.deforms()["gain_in"][[0, 0]], 0.0);
    }

    #[test]
    fn test_fit_rejects_dark_and_narrow_frames() {
        assert_eq!(
            SplitFieldProcessor::fit(&fields(2, 2, 0, 100)).unwrap_err(),
            FitError::DarkField { field: "in" }
        );
        assert_eq!(
            SplitFieldProcessor::fit(&Array2::from_elem((4, 1), 10)).unwrap_err(),
            FitError::FrameTooNarrow { width: 1 }
        );
    }

    #[test]
    fn test_mismatched_frame_keeps_output_shape() {
        let processor = SplitFieldProcessor::fit(&fields(4, 6, 200, 100)).unwrap();
        let out = processor.process(&fields(8, 10, 50, 10));
        assert_eq!(out.dim(), (8, 10));
        assert!(out.iter().all(|&v| v == 50));
    }

    #[test]
    fn test_fitter_boxes_processor() {
        let processor = SplitFieldFitter.fit(&fields(2, 3, 10, 10)).unwrap();
        assert_eq!(processor.process(&fields(2, 3, 30, 10)).dim(), (2, 3));
    }
}
