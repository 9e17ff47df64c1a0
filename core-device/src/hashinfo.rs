//! HashInfo artifact parsing.
//!
//! `/iPod_Control/Device/HashInfo` is written by a genuine iTunes sync on
//! HASH72-capable devices. 54 bytes:
//!
//! | offset | len | field |
//! |--------|-----|-------------------|
//! | 0      | 6   | `HASHv0` tag      |
//! | 6      | 20  | device UUID       |
//! | 26     | 12  | rndpart           |
//! | 38     | 16  | AES IV            |

use crate::error::{DeviceError, Result};
use crate::layout::DeviceLayout;
use std::fs;

const HASHINFO_TAG: &[u8; 6] = b"HASHv0";
const HASHINFO_LEN: usize = 54;

/// IV and random bytes required to produce HASH72 signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashInfo {
    pub uuid: [u8; 20],
    pub rndpart: [u8; 12],
    pub iv: [u8; 16],
}

impl HashInfo {
    /// Parse the 54-byte HashInfo layout.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HASHINFO_LEN {
            return Err(DeviceError::BadHashInfo(format!(
                "expected {HASHINFO_LEN} bytes, got {}",
                data.len()
            )));
        }
        if &data[..6] != HASHINFO_TAG {
            return Err(DeviceError::BadHashInfo("missing HASHv0 tag".into()));
        }
        let mut uuid = [0u8; 20];
        uuid.copy_from_slice(&data[6..26]);
        let mut rndpart = [0u8; 12];
        rndpart.copy_from_slice(&data[26..38]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&data[38..54]);
        Ok(Self { uuid, rndpart, iv })
    }

    /// Read from the device, `Ok(None)` when the file does not exist.
    pub fn read(layout: &DeviceLayout) -> Result<Option<Self>> {
        let path = layout.hashinfo();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Self::parse(&data).map(Some)
    }

    /// Serialize back to the on-disk layout.
    pub fn to_bytes(&self) -> [u8; HASHINFO_LEN] {
        let mut out = [0u8; HASHINFO_LEN];
        out[..6].copy_from_slice(HASHINFO_TAG);
        out[6..26].copy_from_slice(&self.uuid);
        out[26..38].copy_from_slice(&self.rndpart);
        out[38..54].copy_from_slice(&self.iv);
        out
    }

    /// Write to the device (plain write; the file is tiny and re-creatable).
    pub fn write(&self, layout: &DeviceLayout) -> Result<()> {
        let path = layout.hashinfo();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, self.to_bytes())?;
        Ok(())
    }
}
