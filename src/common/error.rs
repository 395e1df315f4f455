use thiserror::Error;

#[derive(Error, Debug)]
pub enum RidgelineError {
    #[error("Device is already in use")]
    AlreadyInUse,

    #[error("Client must claim the device first")]
    ClaimRequired,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("No such device")]
    NoSuchDevice,

    #[error("Enrollment produced no usable frames")]
    LowQuality,

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Device is shut down")]
    DeviceGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RidgelineError>;
