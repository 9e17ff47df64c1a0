//! In-memory records for the device database.
//!
//! Field layouts mirror the on-disk mhit/mhia/mhyp chunks; timestamps are
//! kept as Unix seconds in memory and converted to the Mac epoch at the
//! codec boundary.

use serde::{Deserialize, Serialize};

/// Seconds between 1904-01-01 (Mac epoch) and 1970-01-01 (Unix epoch).
pub const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

pub fn unix_to_mac(unix: u64) -> u32 {
    if unix == 0 {
        0
    } else {
        (unix + MAC_EPOCH_OFFSET) as u32
    }
}

pub fn mac_to_unix(mac: u32) -> u64 {
    if mac == 0 {
        0
    } else {
        mac as u64 - MAC_EPOCH_OFFSET.min(mac as u64)
    }
}

/// mhod type words used by tracks, albums, and playlists.
pub mod mhod_type {
    pub const TITLE: u32 = 1;
    pub const LOCATION: u32 = 2;
    pub const ALBUM: u32 = 3;
    pub const ARTIST: u32 = 4;
    pub const GENRE: u32 = 5;
    pub const FILETYPE: u32 = 6;
    pub const COMMENT: u32 = 8;
    pub const COMPOSER: u32 = 12;
    pub const ALBUM_ARTIST: u32 = 22;
    pub const SORT_ARTIST: u32 = 23;
    pub const SORT_TITLE: u32 = 27;
    pub const SORT_ALBUM: u32 = 28;
    pub const LIBRARY_INDEX: u32 = 52;
    pub const LIBRARY_JUMP_TABLE: u32 = 53;
    pub const PLAYLIST_POSITION: u32 = 100;
    pub const MHIA_ALBUM: u32 = 200;
    pub const MHIA_ARTIST: u32 = 201;
    pub const MHIA_SORT_ARTIST: u32 = 202;

    /// String mhods carry the 16-byte string sub-header; everything else
    /// has a type-specific binary layout.
    pub fn is_string(t: u32) -> bool {
        matches!(t, 1..=31 | 200..=300)
    }
}

/// Media-type word at mhit offset 0xD0.
pub mod media_type {
    pub const AUDIO: u32 = 0x01;
    pub const VIDEO: u32 = 0x02;
    pub const PODCAST: u32 = 0x04;
    pub const VIDEO_PODCAST: u32 = 0x08;
    pub const AUDIOBOOK: u32 = 0x10;
    pub const MUSIC_VIDEO: u32 = 0x20;
    pub const TV_SHOW: u32 = 0x40;
    pub const RINGTONE: u32 = 0x100;
}

/// File type as the four-character ASCII word stored big-endian in a
/// little-endian u32 (`"MP3 "` reads back as `0x4D503320`).
pub fn filetype_code(filetype: &str) -> u32 {
    let word: &[u8; 4] = match filetype.to_ascii_lowercase().as_str() {
        "mp3" => b"MP3 ",
        "m4a" | "alac" => b"M4A ",
        "m4p" => b"M4P ",
        "m4b" => b"M4B ",
        "wav" => b"WAV ",
        "aif" | "aiff" => b"AIFF",
        "aac" => b"AAC ",
        _ => b"MP3 ",
    };
    u32::from_be_bytes(*word)
}

pub fn filetype_from_code(code: u32) -> String {
    let bytes = code.to_be_bytes();
    let text: String = bytes
        .iter()
        .filter(|b| b.is_ascii_alphanumeric())
        .map(|&b| b.to_ascii_lowercase() as char)
        .collect();
    if text.is_empty() {
        "mp3".to_string()
    } else {
        text
    }
}

/// One track record (mhit plus its string children).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Database-scoped id referenced by playlist items. Reassigned on every
    /// write; zero means "not yet assigned".
    pub track_id: u32,
    /// Globally unique 64-bit id, generated once and never reused.
    pub dbid: u64,

    pub title: String,
    /// Colon-separated device path, e.g. `:iPod_Control:Music:F00:ABCD.mp3`.
    pub location: String,
    pub size: u32,
    pub duration_ms: u32,
    pub filetype: String,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub vbr: bool,

    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub composer: Option<String>,
    pub comment: Option<String>,
    pub filetype_desc: Option<String>,
    pub sort_artist: Option<String>,
    pub sort_title: Option<String>,
    pub sort_album: Option<String>,

    pub year: u32,
    pub track_number: u32,
    pub total_tracks: u32,
    pub disc_number: u32,
    pub total_discs: u32,
    pub bpm: u16,
    pub compilation: bool,

    /// Rating 0-100 (stars × 20).
    pub rating: u8,
    /// Cumulative play count.
    pub play_count: u32,
    /// Plays since the last sync; reset to zero on write.
    pub play_count_2: u32,
    /// Unix seconds.
    pub last_played: u64,
    pub skip_count: u32,
    pub last_skipped: u64,
    pub volume: i32,
    pub start_time_ms: u32,
    pub stop_time_ms: u32,
    pub date_added: u64,
    pub date_released: u64,

    pub media_type: u32,
    pub artwork_count: u16,
    pub artwork_size: u32,
    /// Artwork record link; zero when the track has no art.
    pub mhii_link: u32,
    /// Link into the album list; assigned at write time.
    pub album_id: u32,
    /// Assigned at write time, after the track-id range.
    pub artist_id: u32,
    pub composer_id: u32,
}

impl Default for Track {
    fn default() -> Self {
        Self {
            track_id: 0,
            dbid: 0,
            title: String::new(),
            location: String::new(),
            size: 0,
            duration_ms: 0,
            filetype: "mp3".to_string(),
            bitrate: 0,
            sample_rate: 44_100,
            vbr: false,
            artist: None,
            album: None,
            album_artist: None,
            genre: None,
            composer: None,
            comment: None,
            filetype_desc: None,
            sort_artist: None,
            sort_title: None,
            sort_album: None,
            year: 0,
            track_number: 0,
            total_tracks: 0,
            disc_number: 1,
            total_discs: 1,
            bpm: 0,
            compilation: false,
            rating: 0,
            play_count: 0,
            play_count_2: 0,
            last_played: 0,
            skip_count: 0,
            last_skipped: 0,
            volume: 0,
            start_time_ms: 0,
            stop_time_ms: 0,
            date_added: 0,
            date_released: 0,
            media_type: media_type::AUDIO,
            artwork_count: 0,
            artwork_size: 0,
            mhii_link: 0,
            album_id: 0,
            artist_id: 0,
            composer_id: 0,
        }
    }
}

impl Track {
    /// Effective album artist for album grouping: album_artist, else artist.
    pub fn effective_album_artist(&self) -> &str {
        self.album_artist
            .as_deref()
            .or(self.artist.as_deref())
            .unwrap_or("")
    }
}

/// One album record (mhia).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub album_id: u32,
    pub name: String,
    pub artist: String,
    pub sort_artist: Option<String>,
}

/// One playlist item (mhip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    /// References a [`Track::track_id`] in the same database.
    pub track_id: u32,
    pub position: u32,
}

/// One playlist (mhyp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    /// The hidden flag marks the master playlist.
    pub is_master: bool,
    pub playlist_id: u64,
    /// Unix seconds.
    pub timestamp: u64,
    pub sort_order: u32,
    pub items: Vec<PlaylistItem>,
}

/// Device-identity fields of the mhbd header, preserved across rewrites so
/// the firmware keeps recognizing the database as its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFields {
    pub db_id: u64,
    /// 1 = Mac, 2 = Windows.
    pub platform: u16,
    pub unk_0x22: u16,
    /// Secondary 64-bit id echoed into every mhit at 0x124.
    pub id_0x24: u64,
    pub lib_persistent_id: u64,
    /// Two-letter language code.
    pub language: String,
    pub unk_0x50: u32,
    pub unk_0x54: u32,
    /// Seconds east of UTC.
    pub timezone_offset: i32,
    pub unk_0x70: u16,
    pub audio_language: u16,
    pub subtitle_language: u16,
    pub unk_0xa4: u16,
    pub unk_0xa6: u16,
    pub unk_0xa8: u16,
}

impl Default for DeviceFields {
    fn default() -> Self {
        Self {
            db_id: 0,
            platform: 2,
            unk_0x22: 611,
            id_0x24: 0,
            lib_persistent_id: 0,
            language: "en".to_string(),
            unk_0x50: 1,
            unk_0x54: 15,
            timezone_offset: 0,
            unk_0x70: 3,
            audio_language: 0,
            subtitle_language: 0,
            unk_0xa4: 0,
            unk_0xa6: 0,
            unk_0xa8: 0,
        }
    }
}

/// A parsed or about-to-be-emitted database.
#[derive(Debug, Clone, Default)]
pub struct Database {
    /// mhbd version word (0x4F is emitted).
    pub version: u32,
    pub device: DeviceFields,
    /// Hashing-scheme selector read from offset 0x30.
    pub hash_scheme: u16,
    pub tracks: Vec<Track>,
    pub albums: Vec<Album>,
    /// Playlists including the master (first when present).
    pub playlists: Vec<Playlist>,
    /// Strictly greater than every assigned track id; maintained by the
    /// writer (the 244-byte header has no byte slot for it).
    pub next_track_id: u32,
    /// Tags of chunks the reader skipped.
    pub unknown_chunks: Vec<String>,
}

impl Database {
    pub fn track_by_dbid(&self, dbid: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.dbid == dbid)
    }

    pub fn track_by_dbid_mut(&mut self, dbid: u64) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.dbid == dbid)
    }

    /// Remove a track by dbid; returns the removed record.
    pub fn remove_track(&mut self, dbid: u64) -> Option<Track> {
        let idx = self.tracks.iter().position(|t| t.dbid == dbid)?;
        Some(self.tracks.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_epoch_round_trip() {
        assert_eq!(unix_to_mac(0), 0);
        assert_eq!(mac_to_unix(0), 0);
        let unix = 1_200_000_000u64;
        assert_eq!(mac_to_unix(unix_to_mac(unix)), unix);
    }

    #[test]
    fn filetype_codes_match_device_words() {
        assert_eq!(filetype_code("mp3"), 0x4D50_3320);
        assert_eq!(filetype_code("m4a"), 0x4D34_4120);
        assert_eq!(filetype_code("aiff"), 0x4149_4646);
        assert_eq!(filetype_from_code(0x4D50_3320), "mp3");
        assert_eq!(filetype_from_code(0x4149_4646), "aiff");
    }

    #[test]
    fn string_mhod_type_ranges() {
        assert!(mhod_type::is_string(mhod_type::TITLE));
        assert!(mhod_type::is_string(mhod_type::MHIA_SORT_ARTIST));
        assert!(!mhod_type::is_string(mhod_type::LIBRARY_INDEX));
        assert!(!mhod_type::is_string(mhod_type::PLAYLIST_POSITION));
    }
}
