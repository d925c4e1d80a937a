//! Blocking bridge between asynchronous frame delivery and a synchronous caller.

use crate::camera_interface::{CameraError, FrameDispatcher, PublishedFrame};
use crossbeam_channel::RecvTimeoutError;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Errors from a gated capture
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("no frame from {camera} within {timeout:?}")]
    CaptureTimeout { camera: String, timeout: Duration },

    #[error("capture request rejected: {0}")]
    Trigger(#[source] CameraError),

    #[error("frame source {camera} disconnected")]
    Disconnected { camera: String },
}

/// Timeout for one capture: the exposure plus a fixed readout margin
pub fn capture_timeout(exposure: Duration, margin: Duration) -> Duration {
    exposure + margin
}

/// Waits for the next frame published by one camera.
pub struct AcquisitionTimeoutGate {
    dispatcher: FrameDispatcher,
}

impl AcquisitionTimeoutGate {
    pub fn new(dispatcher: FrameDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn camera(&self) -> &str {
        self.dispatcher.camera()
    }

    /// Trigger a capture and block until the resulting frame arrives.
    ///
    /// The subscription is opened before `trigger` runs, so a frame delivered
    /// immediately by the producer thread cannot be missed. Frames published
    /// before the call are never returned.
    ///
    /// # Errors
    /// * [`GateError::Trigger`] if `trigger` fails; nothing is awaited
    /// * [`GateError::CaptureTimeout`] if no frame arrives within `timeout`
    pub fn wait_for_next_frame<F>(
        &self,
        trigger: F,
        timeout: Duration,
    ) -> Result<PublishedFrame, GateError>
    where
        F: FnOnce() -> Result<(), CameraError>,
    {
        let subscription = self.dispatcher.subscribe();
        trigger().map_err(GateError::Trigger)?;

        match subscription.recv_timeout(timeout) {
            Ok(frame) => {
                debug!(
                    "{}: frame {} arrived",
                    self.dispatcher.camera(),
                    frame.frame_number
                );
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "{}: no frame within {:?}",
                    self.dispatcher.camera(),
                    timeout
                );
                Err(GateError::CaptureTimeout {
                    camera: self.dispatcher.camera().to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(GateError::Disconnected {
                camera: self.dispatcher.camera().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::mock::MockCamera;
    use crate::camera_interface::{CameraInterface, Timestamp};
    use ndarray::Array2;
    use std::time::Instant;

    fn camera() -> MockCamera {
        MockCamera::new_repeating("gate-cam", Array2::from_elem((8, 8), 42))
            .with_latency(Duration::from_millis(20))
    }

    #[test]
    fn test_capture_timeout_adds_margin() {
        assert_eq!(
            capture_timeout(Duration::from_millis(100), Duration::from_secs(2)),
            Duration::from_millis(2100)
        );
    }

    #[test]
    fn test_returns_frame_from_other_thread() {
        let camera = camera();
        let gate = AcquisitionTimeoutGate::new(camera.dispatcher().clone());

        let frame = gate
            .wait_for_next_frame(|| camera.take_image(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(frame.camera, "gate-cam");
        assert_eq!(frame.frame[[3, 3]], 42);
    }

    #[test]
    fn test_immediate_delivery_is_not_missed() {
        let camera = camera();
        let dispatcher = camera.dispatcher().clone();
        let gate = AcquisitionTimeoutGate::new(dispatcher.clone());

        // Deliver synchronously inside the trigger
        let frame = gate
            .wait_for_next_frame(
                || dispatcher.receive(Ok(Array2::from_elem((8, 8), 7)), Timestamp::default()),
                Duration::from_millis(100),
            )
            .unwrap();
        assert_eq!(frame.frame[[0, 0]], 7);
    }

    #[test]
    fn test_times_out_without_spinning_forever() {
        let camera = camera().silent_on([0]);
        let gate = AcquisitionTimeoutGate::new(camera.dispatcher().clone());

        let start = Instant::now();
        let result = gate.wait_for_next_frame(|| camera.take_image(), Duration::from_millis(80));
        let elapsed = start.elapsed();

        assert_eq!(
            result.unwrap_err(),
            GateError::CaptureTimeout {
                camera: "gate-cam".to_string(),
                timeout: Duration::from_millis(80),
            }
        );
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_trigger_failure_is_reported() {
        let camera = MockCamera::new("empty", Vec::new());
        let gate = AcquisitionTimeoutGate::new(camera.dispatcher().clone());

        let result = gate.wait_for_next_frame(|| camera.take_image(), Duration::from_millis(10));
        assert!(matches!(result, Err(GateError::Trigger(_))));
        assert_eq!(camera.dispatcher().subscriber_count(), 0);
    }

    #[test]
    fn test_failed_capture_releases_waiter() {
        let camera = camera().fail_on([0]);
        let gate = AcquisitionTimeoutGate::new(camera.dispatcher().clone());

        let frame = gate
            .wait_for_next_frame(|| camera.take_image(), Duration::from_secs(2))
            .unwrap();
        assert!(frame.dropped);
        assert_eq!(frame.frame.dim(), (8, 8));
    }
}
