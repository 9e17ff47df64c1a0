//! # Device Module
//!
//! Everything about the iPod as a mounted filesystem: where the files live,
//! what the `Device/` identification files say, and how replacements of the
//! database and mapping are committed atomically.
//!
//! ## Components
//!
//! - **Layout** (`layout`): paths under the mount point, colon-location
//!   conversion
//! - **SysInfo** (`sysinfo`): model/GUID parsing, checksum-type detection
//! - **HashInfo** (`hashinfo`): the 54-byte HASH72 keying artifact
//! - **Commit** (`commit`): temp-file-plus-fsync-plus-rename replacement
//!   with a prior backup

pub mod commit;
pub mod error;
pub mod hashinfo;
pub mod layout;
pub mod sysinfo;

pub use commit::{atomic_write, backup_and_replace};
pub use error::{DeviceError, Result};
pub use hashinfo::HashInfo;
pub use layout::{DeviceLayout, MUSIC_FOLDER_COUNT};
pub use sysinfo::{detect_checksum_kind, ChecksumKind, SysInfo};
