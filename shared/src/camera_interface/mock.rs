use super::{
    CameraError, CameraInterface, CameraResult, Frame, FrameDispatcher, Readout, Timestamp,
};
use crate::image_size::PixelShape;
use ndarray::Array2;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// In-process camera that delivers frames from a background thread.
///
/// Frames are taken from `frames` in rotation, one per `take_image` request.
/// Individual requests can be made silent (never delivered) or failing
/// (delivered as a capture error).
pub struct MockCamera {
    name: String,
    dispatcher: FrameDispatcher,
    frames: Vec<Frame>,
    exposure: Duration,
    latency: Duration,
    silent: HashSet<usize>,
    failing: HashSet<usize>,
    requests: AtomicUsize,
    started: Instant,
}

impl MockCamera {
    pub fn new(name: &str, frames: Vec<Frame>) -> Self {
        let shape = frames
            .first()
            .map(PixelShape::of_frame)
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            dispatcher: FrameDispatcher::new(name, Readout::full(shape)),
            frames,
            exposure: Duration::from_millis(10),
            latency: Duration::from_millis(1),
            silent: HashSet::new(),
            failing: HashSet::new(),
            requests: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn new_repeating(name: &str, frame: Frame) -> Self {
        Self::new(name, vec![frame])
    }

    pub fn new_zeros(name: &str, shape: PixelShape) -> Self {
        Self::new_repeating(name, Array2::zeros(shape.to_dim()))
    }

    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Delay between a request and the frame being delivered
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Never deliver anything for the given request indices (zero-based)
    pub fn silent_on(mut self, requests: impl IntoIterator<Item = usize>) -> Self {
        self.silent.extend(requests);
        self
    }

    /// Deliver a capture error for the given request indices (zero-based)
    pub fn fail_on(mut self, requests: impl IntoIterator<Item = usize>) -> Self {
        self.failing.extend(requests);
        self
    }

    /// Number of capture requests received so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl CameraInterface for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn take_image(&self) -> CameraResult<()> {
        if self.frames.is_empty() {
            return Err(CameraError::ConfigError(
                "mock camera has no frames".to_string(),
            ));
        }

        let request = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.silent.contains(&request) {
            debug!("{}: request {} will not be delivered", self.name, request);
            return Ok(());
        }

        let raw = if self.failing.contains(&request) {
            Err(CameraError::CaptureError(format!(
                "request {request} failed"
            )))
        } else {
            Ok(self.frames[request % self.frames.len()].clone())
        };

        let dispatcher = self.dispatcher.clone();
        let latency = self.latency;
        let timestamp = Timestamp::from_duration(self.started.elapsed() + latency);
        std::thread::spawn(move || {
            std::thread::sleep(latency);
            if let Err(e) = dispatcher.receive(raw, timestamp) {
                warn!("{}: {}", dispatcher.camera(), e);
            }
        });
        Ok(())
    }

    fn get_exposure(&self) -> Duration {
        self.exposure
    }

    fn readout(&self) -> Readout {
        self.dispatcher.readout()
    }

    fn dispatcher(&self) -> &FrameDispatcher {
        &self.dispatcher
    }
}
