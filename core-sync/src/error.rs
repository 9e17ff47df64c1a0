use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Required tool not found: {0}")]
    PreflightMissingTool(String),

    #[error("Insufficient storage on device: need {required} bytes, {available} available")]
    StorageInsufficient { required: u64, available: u64 },

    #[error("Fingerprinting failed for {path}: {message}")]
    Fingerprint { path: PathBuf, message: String },

    #[error("Transcode failed for {path}: {message}")]
    Transcode { path: PathBuf, message: String },

    #[error("Copy failed for {path}: {message}")]
    Copy { path: PathBuf, message: String },

    #[error("Mapping file error: {0}")]
    Mapping(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Db(#[from] core_db::DbError),

    #[error(transparent)]
    Device(#[from] core_device::DeviceError),

    #[error(transparent)]
    Bridge(#[from] bridge_traits::BridgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
