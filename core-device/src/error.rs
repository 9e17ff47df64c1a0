use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("SysInfo not found at {0}")]
    SysInfoMissing(PathBuf),

    #[error("FireWire GUID unavailable: {0}")]
    FirewireGuidMissing(String),

    #[error("HashInfo file is malformed: {0}")]
    BadHashInfo(String),

    #[error("Atomic replace of {path} failed: {message}")]
    AtomicWriteFailed { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
