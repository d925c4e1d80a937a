//! Camera abstraction layer for the acquisition engine
//!
//! Cameras are fire-and-forget: [`CameraInterface::take_image`] requests a
//! capture and the frame arrives later, on another thread, through the
//! camera's [`FrameDispatcher`]. The dispatcher runs every frame through the
//! camera's post-processing chain before publishing it to subscribers.

pub mod mock;

use crate::image_size::PixelShape;
use crate::post_processing::{ChainError, PostProcessorChain, ProcessorHandle};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ndarray::Array2;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Raw or processed sensor frame, indexed (row, column)
pub type Frame = Array2<u16>;

/// Timestamp structure aligned with V4L2 format
/// Represents time as seconds and nanoseconds since an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Seconds component
    pub seconds: u64,
    /// Nanoseconds component (0-999,999,999)
    pub nanos: u64,
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(seconds: u64, nanos: u64) -> Self {
        Self { seconds, nanos }
    }

    /// Create a timestamp from a Duration since epoch
    pub fn from_duration(duration: Duration) -> Self {
        let total_nanos = duration.as_nanos();
        let seconds = (total_nanos / 1_000_000_000) as u64;
        let nanos = (total_nanos % 1_000_000_000) as u64;
        Self { seconds, nanos }
    }

    /// Convert to Duration
    pub fn to_duration(&self) -> Duration {
        Duration::new(self.seconds, self.nanos as u32)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// Error type for camera operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    /// Hardware communication error
    HardwareError(String),
    /// Frame capture error
    CaptureError(String),
    /// Configuration error
    ConfigError(String),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraError::HardwareError(msg) => write!(f, "Hardware error: {msg}"),
            CameraError::CaptureError(msg) => write!(f, "Capture error: {msg}"),
            CameraError::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl Error for CameraError {}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Sensor readout geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readout {
    /// Region of interest width in unbinned pixels
    pub roi_width: usize,
    /// Region of interest height in unbinned pixels
    pub roi_height: usize,
    /// Horizontal binning factor
    pub bin_h: usize,
    /// Vertical binning factor
    pub bin_v: usize,
}

impl Readout {
    /// Unbinned full readout of the given shape
    pub fn full(shape: PixelShape) -> Self {
        Self {
            roi_width: shape.width,
            roi_height: shape.height,
            bin_h: 1,
            bin_v: 1,
        }
    }

    /// Shape of a raw frame as delivered by the sensor
    pub fn base_shape(&self) -> PixelShape {
        PixelShape::new(self.roi_width, self.roi_height).binned(self.bin_h, self.bin_v)
    }
}

/// Trait for cameras driven by the acquisition engine
///
/// Captures are requested with `take_image` and delivered asynchronously
/// through the dispatcher returned by `dispatcher`.
pub trait CameraInterface: Send + Sync {
    /// Get camera name/identifier
    fn name(&self) -> &str;

    /// Request a single capture
    ///
    /// # Returns
    /// * `Ok(())` once the request has been accepted
    /// * `Err(CameraError)` if the camera refused the request
    fn take_image(&self) -> CameraResult<()>;

    /// Get current exposure duration
    fn get_exposure(&self) -> Duration;

    /// Get current readout geometry
    fn readout(&self) -> Readout;

    /// Dispatcher publishing this camera's processed frames
    fn dispatcher(&self) -> &FrameDispatcher;
}

impl<C: CameraInterface + ?Sized> CameraInterface for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn take_image(&self) -> CameraResult<()> {
        (**self).take_image()
    }

    fn get_exposure(&self) -> Duration {
        (**self).get_exposure()
    }

    fn readout(&self) -> Readout {
        (**self).readout()
    }

    fn dispatcher(&self) -> &FrameDispatcher {
        (**self).dispatcher()
    }
}

/// A processed frame as seen by subscribers
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    /// Name of the camera that produced the frame
    pub camera: String,
    /// Sequence number assigned by the dispatcher
    pub frame_number: u64,
    /// Processed pixel data
    pub frame: Arc<Frame>,
    /// Capture timestamp reported by the camera
    pub timestamp: Timestamp,
    /// True when the capture failed and `frame` is a zero-filled placeholder
    pub dropped: bool,
}

struct DispatcherInner {
    camera: String,
    readout: RwLock<Readout>,
    chain: RwLock<PostProcessorChain>,
    subscribers: Mutex<HashMap<u64, Sender<PublishedFrame>>>,
    next_subscriber: AtomicU64,
    frame_count: AtomicU64,
}

/// Fan-out point between a camera and its consumers.
///
/// Cloning is cheap and every clone refers to the same chain and subscriber
/// set.
#[derive(Clone)]
pub struct FrameDispatcher {
    inner: Arc<DispatcherInner>,
}

impl FrameDispatcher {
    pub fn new(camera: impl Into<String>, readout: Readout) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                camera: camera.into(),
                readout: RwLock::new(readout),
                chain: RwLock::new(PostProcessorChain::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
                frame_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn camera(&self) -> &str {
        &self.inner.camera
    }

    pub fn readout(&self) -> Readout {
        *self.inner.readout.read().unwrap()
    }

    /// Shape of published frames: the binned readout folded through the chain
    pub fn expected_image_size(&self) -> PixelShape {
        let base = self.readout().base_shape();
        self.inner.chain.read().unwrap().expected_shape(base)
    }

    /// Register a post-processor on this camera's chain
    pub fn add_post_processor<T, S>(&self, priority: i32, transform: T, shape_fn: S) -> ProcessorHandle
    where
        T: Fn(Frame) -> Frame + Send + Sync + 'static,
        S: Fn(PixelShape) -> PixelShape + Send + Sync + 'static,
    {
        let handle = self
            .inner
            .chain
            .write()
            .unwrap()
            .add(priority, transform, shape_fn);
        debug!(
            "Added post-processor {} at priority {} to {}",
            handle, priority, self.inner.camera
        );
        handle
    }

    /// Remove a post-processor from this camera's chain
    pub fn remove_post_processor(
        &self,
        priority: i32,
        handle: Option<ProcessorHandle>,
    ) -> Result<ProcessorHandle, ChainError> {
        let removed = self.inner.chain.write().unwrap().remove(priority, handle)?;
        debug!(
            "Removed post-processor {} at priority {} from {}",
            removed, priority, self.inner.camera
        );
        Ok(removed)
    }

    /// Priorities of the registered post-processors, in application order
    pub fn post_processor_priorities(&self) -> Vec<i32> {
        self.inner.chain.read().unwrap().priorities()
    }

    /// Open a subscription to every frame published from now on
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = unbounded();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().unwrap().insert(id, sender);
        Subscription {
            id,
            receiver,
            dispatcher: self.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Entry point for frames arriving from the camera.
    ///
    /// A successful capture is run through the chain and published. A failed
    /// capture still publishes a zero-filled frame of the expected output
    /// shape so that waiting consumers are released, then the capture error
    /// is returned to the caller.
    pub fn receive(&self, raw: CameraResult<Frame>, timestamp: Timestamp) -> CameraResult<()> {
        match raw {
            Ok(frame) => {
                let processed = self.inner.chain.read().unwrap().apply(frame);
                self.publish(processed, timestamp, false);
                Ok(())
            }
            Err(e) => {
                let shape = self.expected_image_size();
                warn!(
                    "{}: capture failed ({}), publishing empty {} frame",
                    self.inner.camera, e, shape
                );
                self.publish(Array2::zeros(shape.to_dim()), timestamp, true);
                Err(e)
            }
        }
    }

    fn publish(&self, frame: Frame, timestamp: Timestamp, dropped: bool) {
        let published = PublishedFrame {
            camera: self.inner.camera.clone(),
            frame_number: self.inner.frame_count.fetch_add(1, Ordering::SeqCst),
            frame: Arc::new(frame),
            timestamp,
            dropped,
        };

        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|_, sender| sender.send(published.clone()).is_ok());
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().unwrap().remove(&id);
    }
}

impl fmt::Debug for FrameDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDispatcher")
            .field("camera", &self.inner.camera)
            .field("readout", &self.readout())
            .finish()
    }
}

/// Receiving end of a dispatcher subscription; unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    receiver: Receiver<PublishedFrame>,
    dispatcher: FrameDispatcher,
}

impl Subscription {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<PublishedFrame, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<PublishedFrame, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn camera(&self) -> &str {
        self.dispatcher.camera()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn dispatcher() -> FrameDispatcher {
        FrameDispatcher::new(
            "test-cam",
            Readout {
                roi_width: 64,
                roi_height: 32,
                bin_h: 2,
                bin_v: 1,
            },
        )
    }

    #[test]
    fn test_timestamp_from_duration() {
        let ts = Timestamp::from_duration(Duration::from_millis(1500));
        assert_eq!(ts.seconds, 1);
        assert_eq!(ts.nanos, 500_000_000);
        assert_eq!(ts.to_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::new(42, 123_456_789).to_string(), "42.123456789");
        assert_eq!(Timestamp::new(0, 1).to_string(), "0.000000001");
    }

    #[test]
    fn test_readout_base_shape_divides_by_binning() {
        let readout = Readout {
            roi_width: 2048,
            roi_height: 1024,
            bin_h: 2,
            bin_v: 4,
        };
        assert_eq!(readout.base_shape(), PixelShape::new(1024, 256));
    }

    #[test]
    fn test_expected_size_follows_chain() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.expected_image_size(), PixelShape::new(32, 32));

        dispatcher.add_post_processor(
            100,
            |f: Frame| {
                let half = f.ncols() / 2;
                f.slice(s![.., ..half]).to_owned()
            },
            |s| PixelShape::new(s.width / 2, s.height),
        );
        assert_eq!(dispatcher.expected_image_size(), PixelShape::new(16, 32));

        dispatcher.remove_post_processor(100, None).unwrap();
        assert_eq!(dispatcher.expected_image_size(), PixelShape::new(32, 32));
    }

    #[test]
    fn test_receive_publishes_processed_frame() {
        let dispatcher = dispatcher();
        dispatcher.add_post_processor(10, |f: Frame| f.mapv(|v| v + 1), |s| s);
        let subscription = dispatcher.subscribe();

        dispatcher
            .receive(Ok(Array2::from_elem((32, 32), 9)), Timestamp::new(1, 0))
            .unwrap();

        let published = subscription.try_recv().unwrap();
        assert_eq!(published.camera, "test-cam");
        assert_eq!(published.frame[[0, 0]], 10);
        assert_eq!(published.timestamp, Timestamp::new(1, 0));
        assert!(!published.dropped);
    }

    #[test]
    fn test_failed_capture_publishes_zero_frame_and_errors() {
        let dispatcher = dispatcher();
        let subscription = dispatcher.subscribe();

        let result = dispatcher.receive(
            Err(CameraError::CaptureError("sensor fault".to_string())),
            Timestamp::default(),
        );
        assert!(matches!(result, Err(CameraError::CaptureError(_))));

        let published = subscription.try_recv().unwrap();
        assert!(published.dropped);
        assert_eq!(published.frame.dim(), (32, 32));
        assert!(published.frame.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_subscription_only_sees_later_frames() {
        let dispatcher = dispatcher();
        dispatcher
            .receive(Ok(Array2::zeros((32, 32))), Timestamp::default())
            .unwrap();

        let subscription = dispatcher.subscribe();
        assert!(subscription.try_recv().is_err());

        dispatcher
            .receive(Ok(Array2::zeros((32, 32))), Timestamp::default())
            .unwrap();
        assert_eq!(subscription.try_recv().unwrap().frame_number, 1);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let dispatcher = dispatcher();
        let first = dispatcher.subscribe();
        let second = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count(), 2);

        drop(first);
        assert_eq!(dispatcher.subscriber_count(), 1);
        drop(second);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
