//! SysInfo parsing and checksum-type detection.
//!
//! `/iPod_Control/Device/SysInfo` is a `key: value` text file carrying the
//! model string, serial number, firmware build, and — on post-2006 devices —
//! the FireWire GUID that keys the HASH58 signature.

use crate::error::{DeviceError, Result};
use crate::layout::DeviceLayout;
use std::collections::HashMap;
use std::fs;
use tracing::debug;

/// Which database signature a device's firmware verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// Pre-2007 devices: no signature required.
    None,
    /// Nano 3G/4G and the Classic line. The Classic firmware checks HASH58
    /// but iTunes writes HASH72 as well, and HASH58 covers those bytes.
    Hash58,
    /// Nano 5G: HASH72 only.
    Hash72,
    /// Nano 6G/7G (HASHAB, never reverse-engineered). Writing a database
    /// for these devices must fail.
    Unsupported,
    /// Device not in the model table and no other signal.
    Unknown,
}

// Model-number prefixes, reduced to the checksum-relevant subset of the
// full device table.
const HASH58_MODELS: &[&str] = &[
    // Classic 1G-3G
    "MB029", "MB147", "MB150", "MB562", "MB565", "MC293", "MC297",
    // Nano 3G
    "MA978", "MA979", "MA980", "MB245", "MB249", "MB253", "MB257", "MB261",
    // Nano 4G
    "MB598", "MB654", "MB732", "MB742", "MB748", "MB754", "MB903", "MB907", "MB909",
];

const HASH72_MODELS: &[&str] = &[
    // Nano 5G
    "MC027", "MC031", "MC040", "MC049", "MC050", "MC060", "MC062", "MC064", "MC066", "MC068",
    "MC072",
];

const UNSUPPORTED_MODELS: &[&str] = &[
    // Nano 6G
    "MC525", "MC526", "MC540", "MC688", "MC689", "MC690", "MC691", "MC692", "MC693",
    // Nano 7G
    "MD476", "MD477", "MD478", "MD479", "MD480", "MD481",
];

/// Parsed SysInfo contents.
#[derive(Debug, Clone, Default)]
pub struct SysInfo {
    values: HashMap<String, String>,
}

impl SysInfo {
    /// Read and parse the SysInfo file for a mounted device.
    pub fn read(layout: &DeviceLayout) -> Result<Self> {
        let path = layout.sysinfo();
        if !path.exists() {
            return Err(DeviceError::SysInfoMissing(path));
        }
        let text = fs::read_to_string(&path)?;
        Ok(Self::parse(&text))
    }

    /// Parse `key: value` lines; later duplicates win.
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Model number normalized to `M?NNN` form. Some devices report
    /// `xA623`-style strings where the leading `x` stands for `M`.
    pub fn model_number(&self) -> Option<String> {
        let raw = self.get("ModelNumStr")?;
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let normalized = if let Some(rest) = raw.strip_prefix('x') {
            format!("M{rest}")
        } else {
            raw.to_string()
        };
        Some(normalized.to_uppercase())
    }

    /// The 8-byte FireWire GUID, when present and non-zero.
    pub fn firewire_guid(&self) -> Result<[u8; 8]> {
        let raw = self
            .get("FirewireGuid")
            .ok_or_else(|| DeviceError::FirewireGuidMissing("no FirewireGuid key".into()))?;
        let raw = raw.trim_start_matches("0x").trim_start_matches("0X");
        let bytes = hex::decode(raw)
            .map_err(|e| DeviceError::FirewireGuidMissing(format!("bad hex: {e}")))?;
        if bytes.len() != 8 {
            return Err(DeviceError::FirewireGuidMissing(format!(
                "expected 8 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes.iter().all(|&b| b == 0) {
            return Err(DeviceError::FirewireGuidMissing("GUID is all zeros".into()));
        }
        let mut guid = [0u8; 8];
        guid.copy_from_slice(&bytes);
        Ok(guid)
    }
}

/// Detect the signature a device requires.
///
/// Order: model table, then HashInfo presence (a leftover iTunes sync
/// implies a HASH72-capable device), then FirewireGuid presence as a
/// conservative "unknown post-2007 device" signal.
pub fn detect_checksum_kind(layout: &DeviceLayout) -> ChecksumKind {
    let sysinfo = match SysInfo::read(layout) {
        Ok(s) => s,
        Err(_) => return ChecksumKind::None,
    };

    if let Some(model) = sysinfo.model_number() {
        for prefix in UNSUPPORTED_MODELS {
            if model.starts_with(prefix) {
                return ChecksumKind::Unsupported;
            }
        }
        for prefix in HASH58_MODELS {
            if model.starts_with(prefix) {
                return ChecksumKind::Hash58;
            }
        }
        for prefix in HASH72_MODELS {
            if model.starts_with(prefix) {
                return ChecksumKind::Hash72;
            }
        }
        debug!(model = %model, "model not in checksum table");
    }

    if layout.hashinfo().exists() {
        return ChecksumKind::Hash72;
    }

    if sysinfo.get("FirewireGuid").is_some() {
        return ChecksumKind::Unknown;
    }

    ChecksumKind::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let s = SysInfo::parse(
            "BoardHwName: iPod Q45\npszSerialNumber: ABC123\nFirewireGuid: 0x000A270012345678\n",
        );
        assert_eq!(s.get("pszSerialNumber"), Some("ABC123"));
        assert_eq!(
            s.firewire_guid().unwrap(),
            [0x00, 0x0A, 0x27, 0x00, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn model_number_normalizes_x_prefix() {
        let s = SysInfo::parse("ModelNumStr: xB147LL\n");
        assert_eq!(s.model_number().as_deref(), Some("MB147LL"));
    }

    #[test]
    fn zero_guid_is_rejected() {
        let s = SysInfo::parse("FirewireGuid: 0000000000000000\n");
        assert!(s.firewire_guid().is_err());
    }
}
