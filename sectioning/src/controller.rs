//! Sectioning unit controller.
//!
//! Ties a [`SectioningUnit`] to a camera's post-processing chain. When
//! sectioning is on, every frame from the camera is processed with the
//! calibration of whichever channel the turret reports at that moment.

use hardware::{DeviceResult, DiskPosition, SectioningUnit};
use shared::camera_interface::{Frame, FrameDispatcher};
use shared::frame_writer::FrameSink;
use shared::post_processing::ProcessorHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationError, CalibrationStore, CHANNEL_COUNT};
use crate::callback::{CallbackId, DeviceStatus, SectioningCallback, SectioningEvent, StatusReport};
use crate::config::ClarityConfig;
use crate::processor::{left_half, sectioned_shape, ProcessorFitter};

/// Priority of the sectioning post-processor in the camera chain
pub const PRIORITY_SECTIONING: i32 = 100;

/// Period at which callers are expected to call [`SectioningController::poll`]
pub const STATUS_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// How long to wait for the turret to report a definite position
#[derive(Debug, Clone, Copy)]
pub struct SettlePolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(5),
        }
    }
}

pub struct SectioningController {
    unit: Arc<dyn SectioningUnit>,
    store: Arc<RwLock<CalibrationStore>>,
    dispatcher: FrameDispatcher,
    config: ClarityConfig,
    settle: SettlePolicy,
    /// Chain registration while sectioning is on
    sectioning: Mutex<Option<ProcessorHandle>>,
    last_status: Mutex<Option<DeviceStatus>>,
    /// Registered callbacks
    callbacks: Arc<Mutex<HashMap<CallbackId, SectioningCallback>>>,
    /// Next callback ID
    next_callback_id: Arc<Mutex<CallbackId>>,
}

impl SectioningController {
    /// Create a controller for `unit` feeding the camera behind `dispatcher`.
    ///
    /// `dispatcher` must belong to the camera named in `config`.
    pub fn new(
        unit: Arc<dyn SectioningUnit>,
        dispatcher: FrameDispatcher,
        config: ClarityConfig,
        fitter: Box<dyn ProcessorFitter>,
    ) -> Self {
        if dispatcher.camera() != config.camera {
            warn!(
                "Sectioning configured for camera '{}' but attached to '{}'",
                config.camera,
                dispatcher.camera()
            );
        }
        let store = CalibrationStore::new(&config, fitter);
        Self {
            unit,
            store: Arc::new(RwLock::new(store)),
            dispatcher,
            config,
            settle: SettlePolicy::default(),
            sectioning: Mutex::new(None),
            last_status: Mutex::new(None),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_callback_id: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_settle_policy(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn config(&self) -> &ClarityConfig {
        &self.config
    }

    /// Shared handle to the calibration store
    pub fn store(&self) -> Arc<RwLock<CalibrationStore>> {
        self.store.clone()
    }

    /// Register a callback for sectioning events
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&SectioningEvent) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock().unwrap();
        let mut next_id = self.next_callback_id.lock().unwrap();

        let callback_id = *next_id;
        *next_id += 1;

        callbacks.insert(callback_id, Arc::new(callback));
        callback_id
    }

    /// Deregister a callback
    pub fn deregister_callback(&self, callback_id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.remove(&callback_id).is_some()
    }

    fn emit_event(&self, event: &SectioningEvent) {
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.values() {
            callback(event);
        }
    }

    fn publish_status(&self, status: DeviceStatus) {
        let changed = self.last_status.lock().unwrap().replace(status) != Some(status);
        if changed {
            debug!("Sectioning unit status: {}", status);
            self.emit_event(&SectioningEvent::StatusChanged(status));
        }
    }

    /// Enable or disable the unit, then refresh status
    pub fn toggle_state(&self, enabled: bool) -> Result<StatusReport, CalibrationError> {
        if enabled {
            self.unit.enable()?;
        } else {
            self.unit.disable()?;
        }
        Ok(self.poll())
    }

    pub fn set_channel_position(&self, channel: usize) -> Result<(), CalibrationError> {
        if channel >= CHANNEL_COUNT {
            return Err(CalibrationError::ChannelOutOfRange { channel });
        }
        info!(
            "Moving turret to channel {} ({})",
            channel, self.config.filter_cubes[channel]
        );
        self.unit.set_channel_position(channel)?;
        Ok(())
    }

    pub fn set_disk_position(&self, position: DiskPosition) -> Result<(), CalibrationError> {
        info!("Moving disk to {}", position);
        self.unit.set_disk_position(position)?;
        Ok(())
    }

    pub fn set_calibration_led(&self, on: bool) -> Result<(), CalibrationError> {
        self.unit.set_calibration_led(on)?;
        Ok(())
    }

    /// Block until the turret reports a definite channel.
    ///
    /// # Errors
    /// [`CalibrationError::ChannelUnsettled`] if the position is still
    /// indeterminate after the settle policy's maximum wait.
    pub fn wait_for_stable_channel(&self) -> Result<usize, CalibrationError> {
        let start = Instant::now();
        loop {
            if let Some(channel) = self.unit.get_channel_position()? {
                return Ok(channel);
            }
            let waited = start.elapsed();
            if waited >= self.settle.max_wait {
                return Err(CalibrationError::ChannelUnsettled { waited });
            }
            std::thread::sleep(self.settle.poll_interval);
        }
    }

    /// Calibrate the live channel from `frame`.
    ///
    /// `frame` must be a raw frame taken at the current turret position.
    /// Returns the calibrated channel.
    pub fn calibrate(&self, frame: &Frame) -> Result<usize, CalibrationError> {
        if self.is_sectioning() {
            return Err(CalibrationError::SectioningActive);
        }

        self.publish_status(DeviceStatus::Busy);
        let result = self
            .wait_for_stable_channel()
            .and_then(|channel| {
                self.store.write().unwrap().calibrate(channel, frame)?;
                Ok(channel)
            });

        match result {
            Ok(channel) => {
                self.publish_status(DeviceStatus::Enabled);
                self.emit_event(&SectioningEvent::Calibrated {
                    channel,
                    label: self.config.filter_cubes[channel].clone(),
                });
                Ok(channel)
            }
            Err(e) => {
                warn!("Calibration failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn is_sectioning(&self) -> bool {
        self.sectioning.lock().unwrap().is_some()
    }

    /// Switch sectioning on or off.
    ///
    /// Turning it on requires the live channel to be calibrated. Returns
    /// whether anything changed.
    pub fn set_sectioning(&self, enabled: bool) -> Result<bool, CalibrationError> {
        self.set_sectioning_inner(enabled, false)
    }

    fn set_sectioning_inner(&self, enabled: bool, automatic: bool) -> Result<bool, CalibrationError> {
        let mut sectioning = self.sectioning.lock().unwrap();
        if sectioning.is_some() == enabled {
            return Ok(false);
        }

        if enabled {
            let channel = self.unit.get_channel_position()?.ok_or(
                CalibrationError::ChannelUnsettled {
                    waited: Duration::ZERO,
                },
            )?;
            if !self.store.read().unwrap().is_calibrated(channel) {
                return Err(CalibrationError::NotCalibrated { channel });
            }

            let handle = self.dispatcher.add_post_processor(
                PRIORITY_SECTIONING,
                section_frames(self.unit.clone(), self.store.clone()),
                sectioned_shape,
            );
            *sectioning = Some(handle);
            info!("Sectioning enabled on {}", self.dispatcher.camera());
        } else if let Some(handle) = *sectioning {
            self.dispatcher
                .remove_post_processor(PRIORITY_SECTIONING, Some(handle))?;
            *sectioning = None;
            if automatic {
                info!("Live channel is not calibrated, sectioning disabled");
            } else {
                info!("Sectioning disabled on {}", self.dispatcher.camera());
            }
        }
        drop(sectioning);

        self.emit_event(&SectioningEvent::SectioningToggled { enabled, automatic });
        Ok(true)
    }

    fn query_unit(&self) -> DeviceResult<(bool, Option<DiskPosition>, Option<usize>, bool, bool)> {
        Ok((
            self.unit.get_is_enabled()?,
            self.unit.get_disk_position()?,
            self.unit.get_channel_position()?,
            self.unit.door_closed()?,
            self.unit.calibration_led()?,
        ))
    }

    /// Query the unit, publish its status and keep sectioning consistent.
    ///
    /// If sectioning is on and the live channel is not calibrated (including
    /// while the turret is moving), sectioning is switched off and a
    /// `SectioningToggled { automatic: true }` event is emitted.
    pub fn poll(&self) -> StatusReport {
        let (enabled, disk, channel, door_closed, led) = match self.query_unit() {
            Ok(state) => state,
            Err(e) => {
                warn!("Sectioning unit status query failed: {}", e);
                self.publish_status(DeviceStatus::Error);
                return StatusReport {
                    status: DeviceStatus::Error,
                    channel: None,
                    disk: None,
                    calibrated: false,
                    door_closed: None,
                    calibration_led: None,
                    sectioning: self.is_sectioning(),
                };
            }
        };

        let status = if disk.is_none() || channel.is_none() || !door_closed {
            DeviceStatus::Busy
        } else if enabled {
            DeviceStatus::Enabled
        } else {
            DeviceStatus::Disabled
        };
        self.publish_status(status);

        let calibrated = channel.map_or(false, |c| self.store.read().unwrap().is_calibrated(c));
        if !calibrated && self.is_sectioning() {
            if let Err(e) = self.set_sectioning_inner(false, true) {
                warn!("Failed to disable sectioning: {}", e);
            }
        }

        StatusReport {
            status,
            channel,
            disk,
            calibrated,
            door_closed: Some(door_closed),
            calibration_led: Some(led),
            sectioning: self.is_sectioning(),
        }
    }

    /// Persist the deformation maps of every calibrated channel under `name`.
    ///
    /// Returns the number of channels written.
    pub fn export_deforms(&self, sink: &dyn FrameSink, name: &str) -> Result<usize, CalibrationError> {
        let archive = self.store.read().unwrap().export_deforms()?;
        sink.write_archive(&archive, name)
            .map_err(|e| CalibrationError::Persistence(format!("{e:#}")))?;
        info!("Saved deformation maps for {} channels", archive.len());
        Ok(archive.len())
    }
}

/// Frame transform applying the live channel's calibration.
///
/// When the channel is indeterminate or uncalibrated the left field is passed
/// through unprocessed so the output shape still matches `sectioned_shape`.
fn section_frames(
    unit: Arc<dyn SectioningUnit>,
    store: Arc<RwLock<CalibrationStore>>,
) -> impl Fn(Frame) -> Frame + Send + Sync {
    move |frame: Frame| {
        let channel = match unit.get_channel_position() {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Channel query failed during sectioning: {}", e);
                None
            }
        };
        match channel.and_then(|c| store.read().unwrap().processor(c)) {
            Some(processor) => processor.process(&frame),
            None => left_half(&frame),
        }
    }
}
