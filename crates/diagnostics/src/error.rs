use thiserror::Error;
use types::{DeviceId, ProbeKind};

#[derive(Error, Debug)]
pub enum DiagError {
    #[error("{kind} already running on {device}")]
    ProbeInProgress { device: DeviceId, kind: ProbeKind },

    #[error("probe command failed: {0}")]
    CommandFailed(String),

    #[error("probe returned an unusable result: {0}")]
    BadResult(String),

    #[error("unknown schedule: {0}")]
    UnknownSchedule(String),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

pub type DiagResult<T> = std::result::Result<T, DiagError>;
