use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Device did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
