use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("Bad chunk magic at offset {offset}: {found:?}")]
    BadMagic { offset: usize, found: String },

    #[error("Codec invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Signer input missing: {0}")]
    SignerInputMissing(String),

    #[error("Play Counts file is malformed: {0}")]
    BadPlayCounts(String),

    #[error("Artwork encoding failed: {0}")]
    Artwork(String),

    #[error(transparent)]
    Device(#[from] core_device::DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
