//! Image dimensions and size utilities

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image dimensions structure
///
/// Represents the width and height of a sensor readout or a processed frame.
/// Shapes are always written (width, height), while `ndarray` frames are
/// indexed (row, column); use [`PixelShape::of_frame`] to convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelShape {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
}

impl PixelShape {
    /// Create a new PixelShape
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Shape of an existing frame (columns are width, rows are height)
    pub fn of_frame<T>(frame: &Array2<T>) -> Self {
        let (height, width) = frame.dim();
        Self { width, height }
    }

    /// Shape after hardware binning.
    ///
    /// Binning factors of zero are treated as one.
    pub fn binned(&self, horizontal: usize, vertical: usize) -> Self {
        Self {
            width: self.width / horizontal.max(1),
            height: self.height / vertical.max(1),
        }
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Dimensions in `ndarray` order, (rows, columns)
    pub fn to_dim(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Convert to tuple (width, height)
    pub fn to_tuple(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl From<(usize, usize)> for PixelShape {
    fn from(dimensions: (usize, usize)) -> Self {
        Self::new(dimensions.0, dimensions.1)
    }
}

impl From<PixelShape> for (usize, usize) {
    fn from(size: PixelShape) -> Self {
        size.to_tuple()
    }
}

impl Default for PixelShape {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl fmt::Display for PixelShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
