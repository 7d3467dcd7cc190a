use crate::platform::{PlatformError, RadId};

/// Custom error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("output buffer too small: {} buckets required, {} supplied", required, capacity)]
    BufferTooSmall { required: usize, capacity: usize },
    #[error("insufficient memory for topology table")]
    OutOfMemory,
    #[error("RAD {} out of range for {} RADs", rad, max_rads)]
    InvalidRad { rad: RadId, max_rads: usize },
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("{}", _0)]
    Io(#[from] ::std::io::Error),
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Error {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
