//! Device storage probe capability.
//!
//! Mount discovery and filesystem statistics are host concerns; the core
//! only needs the free-byte count of the volume the iPod is mounted on for
//! the pre-flight storage check.

use crate::error::Result;
use std::path::Path;

pub trait DeviceStorage: Send + Sync {
    /// Free bytes on the volume containing `path`.
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// Fixed-value probe, useful for tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedStorage(pub u64);

impl DeviceStorage for FixedStorage {
    fn free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}
