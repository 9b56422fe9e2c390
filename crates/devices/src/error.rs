use thiserror::Error;
use types::ids::DeviceId;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
