//! Artwork pixel-encoding capability.
//!
//! The device stores album art as raw RGB565 little-endian pixel rows inside
//! `.ithmb` files. Resampling source JPEG/PNG bytes down to the device
//! formats is host-provided; the core only decides which formats to produce
//! and where the encoded rows land in the pixel files.

use crate::error::Result;
use bytes::Bytes;

/// One pixel format the device firmware reads.
///
/// `stride` is the padded row width in pixels; for most formats it equals
/// `width`. `pixel_bytes()` is the exact per-image byte count the `.ithmb`
/// file advances by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtworkFormat {
    /// Correlation id used in the ArtworkDB and the `F<id>_1.ithmb` name.
    pub correlation_id: u32,
    pub width: u16,
    pub height: u16,
    pub stride: u16,
}

impl ArtworkFormat {
    pub const fn new(correlation_id: u32, width: u16, height: u16) -> Self {
        Self {
            correlation_id,
            width,
            height,
            stride: width,
        }
    }

    /// Byte length of one encoded image: stride × height × 2.
    pub fn pixel_bytes(&self) -> u32 {
        self.stride as u32 * self.height as u32 * 2
    }
}

/// An image encoded to one device format.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub format: ArtworkFormat,
    /// RGB565 little-endian rows, `format.pixel_bytes()` long.
    pub data: Bytes,
}

/// Encode source artwork bytes (JPEG/PNG) into a device pixel format.
pub trait ImageEncoder: Send + Sync {
    /// Resample and convert to RGB565. Must return exactly
    /// `format.pixel_bytes()` bytes.
    fn encode(&self, source: &[u8], format: ArtworkFormat) -> Result<EncodedImage>;
}
