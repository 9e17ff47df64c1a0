//! Audio tag access capability.
//!
//! Tag parsing and rewriting is host-provided: the core never links a tag
//! library itself. A desktop host typically backs this trait with lofty or
//! TagLib; tests back it with an in-memory stub.

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metadata read from an audio file's tags and stream properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub composer: Option<String>,
    pub comment: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub track_total: Option<u32>,
    pub disc_number: Option<u32>,
    pub disc_total: Option<u32>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Bitrate in kbps.
    pub bitrate: Option<u32>,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Rating on the 0-100 scale (stars × 20), already normalized from the
    /// container's native scale by the provider.
    pub rating: Option<u8>,
}

/// Container-appropriate encoding of a rating write-back.
///
/// The core decides the scaling per container; the provider only has to
/// store the value in the right frame/atom/comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingTag {
    /// ID3v2 POPM frame, 0-255.
    Popm(u8),
    /// MP4 freeform atom, 0-100.
    FreeformAtom(u8),
    /// Vorbis comment, 0-100.
    VorbisComment(u8),
}

impl RatingTag {
    /// Pick the container encoding for a file extension and scale the
    /// 0-100 rating accordingly. Returns `None` for containers without a
    /// conventional rating tag.
    pub fn for_extension(ext: &str, rating: u8) -> Option<RatingTag> {
        let rating = rating.min(100);
        match ext {
            "mp3" | "aif" | "aiff" | "wav" => {
                // POPM star boundaries: 0, 1, 64, 128, 196, 255.
                let popm = match rating {
                    0 => 0,
                    1..=20 => 1,
                    21..=40 => 64,
                    41..=60 => 128,
                    61..=80 => 196,
                    _ => 255,
                };
                Some(RatingTag::Popm(popm))
            }
            "m4a" | "m4b" | "m4p" | "aac" | "mp4" | "alac" => Some(RatingTag::FreeformAtom(rating)),
            "flac" | "ogg" | "opus" => Some(RatingTag::VorbisComment(rating)),
            _ => None,
        }
    }
}

/// Read and write audio file tags on behalf of the core.
///
/// All methods are synchronous; the sync pipeline runs on one thread and
/// calls them between cancellation checks.
pub trait MetadataProvider: Send + Sync {
    /// Read tags and stream properties from a file.
    fn read(&self, path: &Path) -> Result<AudioMetadata>;

    /// First embedded artwork image (raw JPEG/PNG bytes), if any.
    fn embedded_artwork(&self, path: &Path) -> Result<Option<Bytes>>;

    /// Read a previously stored acoustic-fingerprint tag
    /// (`ACOUSTID_FINGERPRINT` or the container's equivalent).
    fn read_fingerprint_tag(&self, path: &Path) -> Result<Option<String>>;

    /// Store an acoustic fingerprint in the file's tags.
    fn write_fingerprint_tag(&self, path: &Path, fingerprint: &str) -> Result<()>;

    /// Write a cumulative play count to the file's tags.
    fn write_play_count(&self, path: &Path, play_count: u32) -> Result<()>;

    /// Write a rating, already scaled for the container by the core.
    fn write_rating(&self, path: &Path, rating: RatingTag) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn popm_scaling_hits_star_boundaries() {
        assert_eq!(RatingTag::for_extension("mp3", 0), Some(RatingTag::Popm(0)));
        assert_eq!(RatingTag::for_extension("mp3", 20), Some(RatingTag::Popm(1)));
        assert_eq!(RatingTag::for_extension("mp3", 40), Some(RatingTag::Popm(64)));
        assert_eq!(RatingTag::for_extension("mp3", 60), Some(RatingTag::Popm(128)));
        assert_eq!(RatingTag::for_extension("mp3", 80), Some(RatingTag::Popm(196)));
        assert_eq!(RatingTag::for_extension("mp3", 100), Some(RatingTag::Popm(255)));
    }

    #[test]
    fn mp4_and_vorbis_keep_the_ipod_scale() {
        assert_eq!(
            RatingTag::for_extension("m4a", 80),
            Some(RatingTag::FreeformAtom(80))
        );
        assert_eq!(
            RatingTag::for_extension("flac", 60),
            Some(RatingTag::VorbisComment(60))
        );
        assert_eq!(RatingTag::for_extension("xyz", 60), None);
    }
}
