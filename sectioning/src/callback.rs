use hardware::DiskPosition;
use std::fmt;
use std::sync::Arc;

/// Coarse device state shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Disabled,
    Enabled,
    /// A mechanism is moving, the door is open or a calibration is running
    Busy,
    /// The unit did not answer a status query
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Disabled => "disabled",
            DeviceStatus::Enabled => "enabled",
            DeviceStatus::Busy => "busy",
            DeviceStatus::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Snapshot returned by a status poll
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: DeviceStatus,
    pub channel: Option<usize>,
    pub disk: Option<DiskPosition>,
    /// Live channel is known and calibrated
    pub calibrated: bool,
    pub door_closed: Option<bool>,
    pub calibration_led: Option<bool>,
    pub sectioning: bool,
}

/// Events emitted for external callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum SectioningEvent {
    StatusChanged(DeviceStatus),
    /// Sectioning was switched; `automatic` is set when the controller did
    /// it itself because the live channel lost its calibration
    SectioningToggled { enabled: bool, automatic: bool },
    Calibrated { channel: usize, label: String },
}

/// Callback ID for registration/deregistration
pub type CallbackId = u64;

/// Callback function type
pub type SectioningCallback = Arc<dyn Fn(&SectioningEvent) + Send + Sync>;
