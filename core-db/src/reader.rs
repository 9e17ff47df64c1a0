//! iTunesDB parser.
//!
//! Recursive by chunk tag. Every chunk parser returns the offset of the
//! next sibling (tag offset plus total length for containers, header length
//! for leaves) so callers iterate siblings without trusting child counts.
//! Unknown chunk tags are tolerated: the reader skips by total length and
//! records the tag on the database.

use crate::error::{DbError, Result};
use crate::record::{
    filetype_from_code, mac_to_unix, mhod_type, Album, Database, DeviceFields, Playlist,
    PlaylistItem, Track,
};
use tracing::{debug, warn};

pub const MHBD_HEADER_LEN: usize = 244;

/// Highest mhbd version word the reader has been exercised against.
const KNOWN_VERSION_MAX: u32 = 0x75;

fn need(data: &[u8], offset: usize, len: usize) -> Result<()> {
    if offset + len > data.len() {
        Err(DbError::Truncated { offset })
    } else {
        Ok(())
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    need(data, offset, 2)?;
    Ok(u16::from_le_bytes([data[offset], data[offset + 1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    need(data, offset, 4)?;
    Ok(u32::from_le_bytes(
        data[offset..offset + 4].try_into().unwrap(),
    ))
}

fn read_i32(data: &[u8], offset: usize) -> Result<i32> {
    Ok(read_u32(data, offset)? as i32)
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    need(data, offset, 8)?;
    Ok(u64::from_le_bytes(
        data[offset..offset + 8].try_into().unwrap(),
    ))
}

/// Read a four-character tag; every tag byte must be printable ASCII.
fn read_tag(data: &[u8], offset: usize) -> Result<[u8; 4]> {
    need(data, offset, 4)?;
    let tag: [u8; 4] = data[offset..offset + 4].try_into().unwrap();
    if tag.iter().any(|b| !b.is_ascii_graphic()) {
        return Err(DbError::BadMagic {
            offset,
            found: String::from_utf8_lossy(&tag).into_owned(),
        });
    }
    Ok(tag)
}

fn expect_tag(data: &[u8], offset: usize, expected: &[u8; 4]) -> Result<()> {
    let tag = read_tag(data, offset)?;
    if &tag != expected {
        return Err(DbError::BadMagic {
            offset,
            found: String::from_utf8_lossy(&tag).into_owned(),
        });
    }
    Ok(())
}

/// Declared extent of a chunk, bounds-checked against the buffer.
fn chunk_end(data: &[u8], offset: usize, total_len: u32) -> Result<usize> {
    let end = offset + total_len as usize;
    if total_len < 12 || end > data.len() {
        return Err(DbError::Truncated { offset });
    }
    Ok(end)
}

/// Parse a complete iTunesDB image.
pub fn parse(data: &[u8]) -> Result<Database> {
    expect_tag(data, 0, b"mhbd")?;
    let header_len = read_u32(data, 4)? as usize;
    let total_len = read_u32(data, 8)?;
    chunk_end(data, 0, total_len)?;
    if header_len < 0x72 {
        return Err(DbError::Truncated { offset: 4 });
    }

    let version = read_u32(data, 0x10)?;
    if version > KNOWN_VERSION_MAX {
        warn!(version, "unrecognized database version, parsing anyway");
    }

    let child_count = read_u32(data, 0x14)?;

    let device = DeviceFields {
        db_id: read_u64(data, 0x18)?,
        platform: read_u16(data, 0x20)?,
        unk_0x22: read_u16(data, 0x22)?,
        id_0x24: read_u64(data, 0x24)?,
        lib_persistent_id: read_u64(data, 0x48)?,
        language: {
            need(data, 0x46, 2)?;
            String::from_utf8_lossy(&data[0x46..0x48])
                .trim_end_matches('\0')
                .to_string()
        },
        unk_0x50: read_u32(data, 0x50)?,
        unk_0x54: read_u32(data, 0x54)?,
        timezone_offset: read_i32(data, 0x6C)?,
        unk_0x70: read_u16(data, 0x70)?,
        audio_language: read_u16(data, 0xA0).unwrap_or(0),
        subtitle_language: read_u16(data, 0xA2).unwrap_or(0),
        unk_0xa4: read_u16(data, 0xA4).unwrap_or(0),
        unk_0xa6: read_u16(data, 0xA6).unwrap_or(0),
        unk_0xa8: read_u16(data, 0xA8).unwrap_or(0),
    };

    let mut db = Database {
        version,
        device,
        hash_scheme: read_u16(data, 0x30)?,
        ..Database::default()
    };

    let mut offset = header_len;
    for _ in 0..child_count {
        if offset >= data.len() {
            return Err(DbError::Truncated { offset });
        }
        offset = parse_dataset(data, offset, &mut db)?;
    }

    let max_id = db.tracks.iter().map(|t| t.track_id).max().unwrap_or(0);
    db.next_track_id = max_id + 1;

    debug!(
        tracks = db.tracks.len(),
        albums = db.albums.len(),
        playlists = db.playlists.len(),
        "parsed database"
    );
    Ok(db)
}

/// Parse one mhsd dataset envelope; returns the next sibling offset.
fn parse_dataset(data: &[u8], offset: usize, db: &mut Database) -> Result<usize> {
    expect_tag(data, offset, b"mhsd")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let total_len = read_u32(data, offset + 8)?;
    let end = chunk_end(data, offset, total_len)?;
    let ds_type = read_u32(data, offset + 12)?;

    let child = offset + header_len;
    match ds_type {
        1 => parse_track_list(data, child, db)?,
        2 => parse_playlist_list(data, child, db)?,
        3 => {
            // Podcast dataset duplicates the playlist list bytes; the
            // playlist dataset is authoritative.
            debug!("skipping podcast dataset");
        }
        4 => parse_album_list(data, child, db)?,
        5 => {
            debug!("skipping smart playlist dataset");
        }
        other => {
            warn!(dataset_type = other, "unknown dataset type, skipping");
            db.unknown_chunks.push(format!("mhsd:{other}"));
        }
    }

    Ok(end)
}

fn parse_track_list(data: &[u8], offset: usize, db: &mut Database) -> Result<()> {
    expect_tag(data, offset, b"mhlt")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let count = read_u32(data, offset + 8)?;

    let mut child = offset + header_len;
    for _ in 0..count {
        let (track, next) = parse_track(data, child)?;
        db.tracks.push(track);
        child = next;
    }
    Ok(())
}

fn parse_track(data: &[u8], offset: usize) -> Result<(Track, usize)> {
    expect_tag(data, offset, b"mhit")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let total_len = read_u32(data, offset + 8)?;
    let end = chunk_end(data, offset, total_len)?;
    let child_count = read_u32(data, offset + 12)?;

    need(data, offset, header_len)?;

    // Fields beyond an older, shorter header read as zero.
    let u8_at = |rel: usize| -> u8 {
        if rel < header_len {
            data[offset + rel]
        } else {
            0
        }
    };
    let u16_at = |rel: usize| -> u16 {
        if rel + 2 <= header_len {
            u16::from_le_bytes([data[offset + rel], data[offset + rel + 1]])
        } else {
            0
        }
    };
    let u32_at = |rel: usize| -> u32 {
        if rel + 4 <= header_len {
            u32::from_le_bytes(data[offset + rel..offset + rel + 4].try_into().unwrap())
        } else {
            0
        }
    };
    let u64_at = |rel: usize| -> u64 {
        if rel + 8 <= header_len {
            u64::from_le_bytes(data[offset + rel..offset + rel + 8].try_into().unwrap())
        } else {
            0
        }
    };

    let mut track = Track {
        track_id: u32_at(0x10),
        filetype: filetype_from_code(u32_at(0x18)),
        vbr: u8_at(0x1C) != 0,
        compilation: u8_at(0x1E) != 0,
        rating: u8_at(0x1F),
        size: u32_at(0x24),
        duration_ms: u32_at(0x28),
        track_number: u32_at(0x2C),
        total_tracks: u32_at(0x30),
        year: u32_at(0x34),
        bitrate: u32_at(0x38),
        sample_rate: u32_at(0x3C) >> 16,
        volume: u32_at(0x40) as i32,
        start_time_ms: u32_at(0x44),
        stop_time_ms: u32_at(0x48),
        play_count: u32_at(0x50),
        play_count_2: u32_at(0x54),
        last_played: mac_to_unix(u32_at(0x58)),
        disc_number: u32_at(0x5C),
        total_discs: u32_at(0x60),
        date_added: mac_to_unix(u32_at(0x68)),
        dbid: u64_at(0x70),
        bpm: u16_at(0x7A),
        artwork_count: u16_at(0x7C),
        artwork_size: u32_at(0x80),
        date_released: mac_to_unix(u32_at(0x8C)),
        skip_count: u32_at(0x9C),
        last_skipped: mac_to_unix(u32_at(0xA0)),
        media_type: u32_at(0xD0),
        album_id: u32_at(0x120),
        mhii_link: u32_at(0x160),
        ..Track::default()
    };

    let mut child = offset + header_len;
    for _ in 0..child_count {
        let (mhod_kind, text, next) = parse_mhod(data, child)?;
        if let Some(text) = text {
            match mhod_kind {
                mhod_type::TITLE => track.title = text,
                mhod_type::LOCATION => track.location = text,
                mhod_type::ALBUM => track.album = Some(text),
                mhod_type::ARTIST => track.artist = Some(text),
                mhod_type::GENRE => track.genre = Some(text),
                mhod_type::FILETYPE => track.filetype_desc = Some(text),
                mhod_type::COMMENT => track.comment = Some(text),
                mhod_type::COMPOSER => track.composer = Some(text),
                mhod_type::ALBUM_ARTIST => track.album_artist = Some(text),
                mhod_type::SORT_ARTIST => track.sort_artist = Some(text),
                mhod_type::SORT_TITLE => track.sort_title = Some(text),
                mhod_type::SORT_ALBUM => track.sort_album = Some(text),
                other => debug!(mhod = other, "ignoring string mhod on track"),
            }
        }
        child = next;
    }

    Ok((track, end))
}

/// Parse an mhod. String types return the decoded payload; binary types
/// return `None`. The next-sibling offset is `offset + total_length` either
/// way.
fn parse_mhod(data: &[u8], offset: usize) -> Result<(u32, Option<String>, usize)> {
    expect_tag(data, offset, b"mhod")?;
    let total_len = read_u32(data, offset + 8)?;
    let end = chunk_end(data, offset, total_len)?;
    let mhod_kind = read_u32(data, offset + 12)?;

    if !mhod_type::is_string(mhod_kind) {
        return Ok((mhod_kind, None, end));
    }

    let encoding = read_u32(data, offset + 24)?;
    let byte_len = read_u32(data, offset + 28)? as usize;
    let payload_start = offset + 40;
    need(data, payload_start, byte_len)?;
    let payload = &data[payload_start..payload_start + byte_len];

    let text = if encoding == 2 {
        String::from_utf8_lossy(payload).into_owned()
    } else {
        // Encoding word 0 or 1: UTF-16LE.
        let units: Vec<u16> = payload
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    };

    Ok((mhod_kind, Some(text), end))
}

fn parse_album_list(data: &[u8], offset: usize, db: &mut Database) -> Result<()> {
    expect_tag(data, offset, b"mhla")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let count = read_u32(data, offset + 8)?;

    let mut child = offset + header_len;
    for _ in 0..count {
        let (album, next) = parse_album(data, child)?;
        db.albums.push(album);
        child = next;
    }
    Ok(())
}

fn parse_album(data: &[u8], offset: usize) -> Result<(Album, usize)> {
    expect_tag(data, offset, b"mhia")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let total_len = read_u32(data, offset + 8)?;
    let end = chunk_end(data, offset, total_len)?;
    let child_count = read_u32(data, offset + 12)?;

    let mut album = Album {
        album_id: read_u32(data, offset + 0x10)?,
        name: String::new(),
        artist: String::new(),
        sort_artist: None,
    };

    let mut child = offset + header_len;
    for _ in 0..child_count {
        let (mhod_kind, text, next) = parse_mhod(data, child)?;
        if let Some(text) = text {
            match mhod_kind {
                mhod_type::MHIA_ALBUM => album.name = text,
                mhod_type::MHIA_ARTIST => album.artist = text,
                mhod_type::MHIA_SORT_ARTIST => album.sort_artist = Some(text),
                other => debug!(mhod = other, "ignoring mhod on album"),
            }
        }
        child = next;
    }

    Ok((album, end))
}

fn parse_playlist_list(data: &[u8], offset: usize, db: &mut Database) -> Result<()> {
    expect_tag(data, offset, b"mhlp")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let count = read_u32(data, offset + 8)?;

    let mut child = offset + header_len;
    for _ in 0..count {
        let (playlist, next) = parse_playlist(data, child)?;
        db.playlists.push(playlist);
        child = next;
    }
    Ok(())
}

fn parse_playlist(data: &[u8], offset: usize) -> Result<(Playlist, usize)> {
    expect_tag(data, offset, b"mhyp")?;
    let header_len = read_u32(data, offset + 4)? as usize;
    let total_len = read_u32(data, offset + 8)?;
    let end = chunk_end(data, offset, total_len)?;
    let mhod_count = read_u32(data, offset + 0x0C)?;
    let item_count = read_u32(data, offset + 0x10)?;

    let mut playlist = Playlist {
        name: String::new(),
        is_master: read_u32(data, offset + 0x14)? != 0,
        timestamp: mac_to_unix(read_u32(data, offset + 0x18)?),
        playlist_id: read_u64(data, offset + 0x1C)?,
        sort_order: read_u32(data, offset + 0x2C)?,
        items: Vec::with_capacity(item_count as usize),
    };

    let mut child = offset + header_len;
    for _ in 0..mhod_count {
        let (mhod_kind, text, next) = parse_mhod(data, child)?;
        if mhod_kind == mhod_type::TITLE {
            if let Some(text) = text {
                playlist.name = text;
            }
        }
        child = next;
    }

    for position in 0..item_count {
        let (track_id, next) = parse_playlist_item(data, child)?;
        playlist.items.push(PlaylistItem { track_id, position });
        child = next;
    }

    Ok((playlist, end))
}

fn parse_playlist_item(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    expect_tag(data, offset, b"mhip")?;
    let total_len = read_u32(data, offset + 8)?;
    let end = chunk_end(data, offset, total_len)?;
    let track_id = read_u32(data, offset + 0x18)?;
    Ok((track_id, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_database_bytes() {
        assert!(matches!(
            parse(b"not a database at all"),
            Err(DbError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(b"mhbd");
        data[4..8].copy_from_slice(&244u32.to_le_bytes());
        data[8..12].copy_from_slice(&500u32.to_le_bytes());
        assert!(matches!(parse(&data), Err(DbError::Truncated { .. })));
    }

    #[test]
    fn tag_with_unprintable_byte_is_bad_magic() {
        let data = [0x6D, 0x68, 0x00, 0x64, 0, 0, 0, 0];
        assert!(matches!(
            read_tag(&data, 0),
            Err(DbError::BadMagic { .. })
        ));
    }
}
