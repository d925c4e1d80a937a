//! Ordered chain of frame post-processors.
//!
//! Raw sensor frames pass through every registered post-processor, lowest
//! priority first, before they are published to consumers. Because frames are
//! saved with a shape that must be known in advance, each post-processor also
//! carries a shape function describing what it does to the frame dimensions.
//!
//! A post-processor must not change the pixel scale of the data: shape changes
//! are limited to integer croppings and splits, never resampling.

use crate::camera_interface::Frame;
use crate::image_size::PixelShape;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Frame transform applied by a post-processor.
pub type TransformFn = Arc<dyn Fn(Frame) -> Frame + Send + Sync>;

/// Shape function paired with a transform; maps (width, height) to (width, height).
pub type ShapeFn = Arc<dyn Fn(PixelShape) -> PixelShape + Send + Sync>;

/// Token issued by [`PostProcessorChain::add`] identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorHandle(u64);

impl fmt::Display for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pp#{}", self.0)
    }
}

/// Errors from chain manipulation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// No registered post-processor matched the removal request.
    #[error("no post-processor with priority {priority} matches{}", .handle.map(|h| format!(" handle {h}")).unwrap_or_default())]
    NotFound {
        /// Requested priority.
        priority: i32,
        /// Requested handle, if the request was narrowed by one.
        handle: Option<ProcessorHandle>,
    },
}

struct PostProcessor {
    handle: ProcessorHandle,
    priority: i32,
    transform: TransformFn,
    shape_fn: ShapeFn,
}

/// Priority-ordered list of frame transforms.
#[derive(Default)]
pub struct PostProcessorChain {
    processors: Vec<PostProcessor>,
    next_handle: u64,
}

impl PostProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Add a post-processing unit.
    ///
    /// Multiple post-processors with the same priority run in the order they
    /// were added. Duplicate priorities are allowed.
    ///
    /// # Arguments
    /// * `priority` - Ordering key, lower runs first
    /// * `transform` - Frame transform; its output shape must agree with `shape_fn`
    /// * `shape_fn` - Expected output shape given the input shape
    ///
    /// # Returns
    /// Handle that can be used to remove exactly this registration
    pub fn add<T, S>(&mut self, priority: i32, transform: T, shape_fn: S) -> ProcessorHandle
    where
        T: Fn(Frame) -> Frame + Send + Sync + 'static,
        S: Fn(PixelShape) -> PixelShape + Send + Sync + 'static,
    {
        let handle = ProcessorHandle(self.next_handle);
        self.next_handle += 1;

        self.processors.push(PostProcessor {
            handle,
            priority,
            transform: Arc::new(transform),
            shape_fn: Arc::new(shape_fn),
        });
        // Vec::sort_by_key is stable, ties keep insertion order
        self.processors.sort_by_key(|p| p.priority);
        handle
    }

    /// Remove a post-processing unit.
    ///
    /// Among the post-processors registered with `priority` (narrowed to
    /// `handle` when given), the first one in chain order is removed.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] when no candidate matches.
    pub fn remove(
        &mut self,
        priority: i32,
        handle: Option<ProcessorHandle>,
    ) -> Result<ProcessorHandle, ChainError> {
        let index = self
            .processors
            .iter()
            .position(|p| p.priority == priority && handle.map_or(true, |h| h == p.handle))
            .ok_or(ChainError::NotFound { priority, handle })?;

        Ok(self.processors.remove(index).handle)
    }

    /// Check whether a registration is still part of the chain
    pub fn contains(&self, handle: ProcessorHandle) -> bool {
        self.processors.iter().any(|p| p.handle == handle)
    }

    /// Priorities in application order
    pub fn priorities(&self) -> Vec<i32> {
        self.processors.iter().map(|p| p.priority).collect()
    }

    /// Handles in application order
    pub fn handles(&self) -> Vec<ProcessorHandle> {
        self.processors.iter().map(|p| p.handle).collect()
    }

    /// Run the frame through every transform, left to right.
    pub fn apply(&self, frame: Frame) -> Frame {
        self.processors
            .iter()
            .fold(frame, |frame, p| (p.transform)(frame))
    }

    /// Fold every shape function over `base`, in application order.
    pub fn expected_shape(&self, base: PixelShape) -> PixelShape {
        self.processors
            .iter()
            .fold(base, |shape, p| (p.shape_fn)(shape))
    }
}

impl fmt::Debug for PostProcessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.processors
                    .iter()
                    .map(|p| (p.handle, p.priority)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array2};

    fn crop_left_half(frame: Frame) -> Frame {
        let half = frame.ncols() / 2;
        frame.slice(s![.., ..half]).to_owned()
    }

    fn half_width(shape: PixelShape) -> PixelShape {
        PixelShape::new(shape.width / 2, shape.height)
    }

    fn crop_top_rows(frame: Frame) -> Frame {
        let rows = frame.nrows().saturating_sub(2);
        frame.slice(s![..rows, ..]).to_owned()
    }

    fn minus_two_rows(shape: PixelShape) -> PixelShape {
        PixelShape::new(shape.width, shape.height.saturating_sub(2))
    }

    fn add_constant(value: u16) -> impl Fn(Frame) -> Frame + Send + Sync {
        move |frame| frame.mapv(|v| v.saturating_add(value))
    }

    fn ramp(width: usize, height: usize) -> Frame {
        Array2::from_shape_fn((height, width), |(r, c)| (r * width + c) as u16)
    }

    #[test]
    fn test_sorted_by_priority() {
        let mut chain = PostProcessorChain::new();
        chain.add(100, |f| f, |s| s);
        chain.add(-5, |f| f, |s| s);
        chain.add(20, |f| f, |s| s);

        assert_eq!(chain.priorities(), vec![-5, 20, 100]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut chain = PostProcessorChain::new();
        let first = chain.add(10, add_constant(1), |s| s);
        let low = chain.add(0, add_constant(1), |s| s);
        let second = chain.add(10, add_constant(1), |s| s);

        assert_eq!(chain.handles(), vec![low, first, second]);
    }

    #[test]
    fn test_expected_shape_folds_in_priority_order() {
        let mut chain = PostProcessorChain::new();
        // Added out of order: the crop of two rows must run after halving
        chain.add(200, crop_top_rows, minus_two_rows);
        chain.add(100, crop_left_half, half_width);

        let base = PixelShape::new(640, 480);
        assert_eq!(chain.expected_shape(base), PixelShape::new(320, 478));
    }

    #[test]
    fn test_apply_matches_expected_shape() {
        let mut chain = PostProcessorChain::new();
        chain.add(100, crop_left_half, half_width);
        chain.add(200, crop_top_rows, minus_two_rows);
        chain.add(50, add_constant(3), |s| s);

        let frame = ramp(64, 32);
        let base = PixelShape::of_frame(&frame);
        let out = chain.apply(frame);

        assert_eq!(PixelShape::of_frame(&out), chain.expected_shape(base));
        assert_eq!(out[[0, 0]], 3);
    }

    #[test]
    fn test_apply_runs_left_to_right() {
        let mut chain = PostProcessorChain::new();
        chain.add(2, |f: Frame| f.mapv(|v| v * 2), |s| s);
        chain.add(1, add_constant(1), |s| s);

        let out = chain.apply(Array2::from_elem((1, 1), 5));
        // (5 + 1) * 2, not 5 * 2 + 1
        assert_eq!(out[[0, 0]], 12);
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = PostProcessorChain::new();
        let frame = ramp(8, 4);
        assert_eq!(chain.apply(frame.clone()), frame);
        assert_eq!(
            chain.expected_shape(PixelShape::new(8, 4)),
            PixelShape::new(8, 4)
        );
    }

    #[test]
    fn test_remove_from_empty_chain_fails() {
        let mut chain = PostProcessorChain::new();
        assert_eq!(
            chain.remove(100, None),
            Err(ChainError::NotFound {
                priority: 100,
                handle: None
            })
        );
    }

    #[test]
    fn test_remove_unknown_priority_fails() {
        let mut chain = PostProcessorChain::new();
        chain.add(100, |f| f, |s| s);
        assert!(chain.remove(50, None).is_err());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_remove_takes_first_candidate() {
        let mut chain = PostProcessorChain::new();
        let first = chain.add(10, |f| f, |s| s);
        let second = chain.add(10, |f| f, |s| s);

        assert_eq!(chain.remove(10, None), Ok(first));
        assert_eq!(chain.handles(), vec![second]);
    }

    #[test]
    fn test_remove_by_handle() {
        let mut chain = PostProcessorChain::new();
        let first = chain.add(10, |f| f, |s| s);
        let second = chain.add(10, |f| f, |s| s);

        assert_eq!(chain.remove(10, Some(second)), Ok(second));
        assert!(chain.contains(first));
        assert!(!chain.contains(second));

        // Handle no longer registered
        assert!(chain.remove(10, Some(second)).is_err());
        // Handle registered but under a different priority
        assert!(chain.remove(11, Some(first)).is_err());
    }

    #[test]
    fn test_remove_then_add_restores_behaviour() {
        let mut chain = PostProcessorChain::new();
        chain.add(100, crop_left_half, half_width);
        chain.add(10, add_constant(7), |s| s);

        let frame = ramp(16, 4);
        let before = chain.apply(frame.clone());

        chain.remove(100, None).unwrap();
        assert_eq!(PixelShape::of_frame(&chain.apply(frame.clone())).width, 16);

        chain.add(100, crop_left_half, half_width);
        assert_eq!(chain.apply(frame), before);
        assert_eq!(chain.priorities(), vec![10, 100]);
    }
}
