//! iTunesDB emitter.
//!
//! Emits the whole database in one pass into a [`DbBuffer`], backpatching
//! every container's total-length field as the container closes. Chunks are
//! never emitted speculatively and already-emitted children are never
//! rewritten.
//!
//! Dataset order is albums (4), tracks (1), podcasts (3), playlists (2),
//! smart playlists (5); the podcast dataset carries the same playlist-list
//! bytes as the playlist dataset because the device rejects a database with
//! an empty podcast section. The master playlist is emitted first in the
//! playlist list and references every track.

use crate::buffer::{ChunkFrame, DbBuffer};
use crate::error::{DbError, Result};
use crate::record::{
    filetype_code, mhod_type, unix_to_mac, Album, Database, Playlist, PlaylistItem, Track,
};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

pub const MHBD_HEADER_SIZE: usize = 244;
pub const MHSD_HEADER_SIZE: usize = 96;
pub const MHLT_HEADER_SIZE: usize = 92;
pub const MHLP_HEADER_SIZE: usize = 92;
pub const MHLA_HEADER_SIZE: usize = 92;
pub const MHIT_HEADER_SIZE: usize = 0x248;
pub const MHYP_HEADER_SIZE: usize = 184;
pub const MHIP_HEADER_SIZE: usize = 76;
pub const MHIA_HEADER_SIZE: usize = 88;
pub const MHOD_HEADER_SIZE: usize = 24;

/// mhbd version word this writer produces.
pub const DATABASE_VERSION: u32 = 0x4F;

/// Sort categories for the master playlist's library indices.
const SORT_TITLE: u32 = 0x03;
const SORT_ALBUM: u32 = 0x04;
const SORT_ARTIST: u32 = 0x05;
const SORT_GENRE: u32 = 0x07;
const SORT_COMPOSER: u32 = 0x12;
const ALL_SORT_TYPES: [u32; 5] = [SORT_TITLE, SORT_ALBUM, SORT_ARTIST, SORT_GENRE, SORT_COMPOSER];

/// `trackID`/`dbid` handed out for one input track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackAssignment {
    /// Position in the input track list.
    pub index: usize,
    pub dbid: u64,
    pub track_id: u32,
}

/// Result of one emit.
#[derive(Debug)]
pub struct WriteResult {
    pub bytes: Vec<u8>,
    /// Per-input-index id assignments, for mapping backpatch of new tracks.
    pub assignments: Vec<TrackAssignment>,
    /// Strictly greater than every assigned track id.
    pub next_track_id: u32,
}

pub fn generate_dbid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut [u8], offset: usize, v: i32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut [u8], offset: usize, v: f32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

/// Emit the complete database.
///
/// Assigns missing `dbid`s, sequential `trackID`s starting at 1, album ids,
/// and artist/composer ids in place, regenerates the master playlist, and
/// remaps surviving user playlists onto the new track ids.
///
/// # Errors
///
/// `InvariantViolation` on duplicate dbids or a length-accounting mismatch.
#[instrument(skip_all, fields(tracks = db.tracks.len()))]
pub fn write(db: &mut Database, master_name: &str) -> Result<WriteResult> {
    // Old track ids, for remapping parsed user playlists after reassignment.
    let old_track_ids: Vec<u32> = db.tracks.iter().map(|t| t.track_id).collect();

    for track in db.tracks.iter_mut() {
        if track.dbid == 0 {
            track.dbid = generate_dbid();
        }
        if track.date_added == 0 {
            track.date_added = now_unix();
        }
    }

    let mut seen = HashSet::with_capacity(db.tracks.len());
    for track in &db.tracks {
        if !seen.insert(track.dbid) {
            return Err(DbError::InvariantViolation(format!(
                "duplicate dbid {:#018x}",
                track.dbid
            )));
        }
    }

    rebuild_albums(db);
    assign_ids(db);

    let assignments: Vec<TrackAssignment> = db
        .tracks
        .iter()
        .enumerate()
        .map(|(index, t)| TrackAssignment {
            index,
            dbid: t.dbid,
            track_id: t.track_id,
        })
        .collect();
    let next_track_id = db.tracks.len() as u32 + 1;

    remap_playlists(db, &old_track_ids, master_name);
    check_playlist_references(db)?;
    if next_track_id <= db.tracks.iter().map(|t| t.track_id).max().unwrap_or(0) {
        return Err(DbError::InvariantViolation(format!(
            "next track id {next_track_id} is not above the assigned id range"
        )));
    }

    if db.device.db_id == 0 {
        db.device.db_id = rand::thread_rng().gen();
    }
    if db.device.id_0x24 == 0 {
        db.device.id_0x24 = rand::thread_rng().gen();
    }
    if db.device.lib_persistent_id == 0 {
        db.device.lib_persistent_id = db.device.db_id;
    }
    db.version = DATABASE_VERSION;
    db.next_track_id = next_track_id;

    let mut buf = DbBuffer::with_capacity(64 * 1024 + db.tracks.len() * 1024);
    let mhbd = ChunkFrame::open(&buf);
    write_mhbd_header(&mut buf, db);

    write_album_dataset(&mut buf, db);
    write_track_dataset(&mut buf, db);
    // Type 3 then type 2 carry identical playlist bytes.
    write_playlist_dataset(&mut buf, db, 3);
    write_playlist_dataset(&mut buf, db, 2);
    write_smart_playlist_dataset(&mut buf);

    mhbd.close(&mut buf);

    let bytes = buf.into_bytes();
    let declared = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    if declared as usize != bytes.len() {
        return Err(DbError::InvariantViolation(format!(
            "mhbd total_length {declared} != emitted size {}",
            bytes.len()
        )));
    }

    debug!(size = bytes.len(), tracks = db.tracks.len(), "database emitted");
    Ok(WriteResult {
        bytes,
        assignments,
        next_track_id,
    })
}

/// Derive the album list from the tracks and link every track to its album.
fn rebuild_albums(db: &mut Database) {
    let mut grouped: BTreeMap<(String, String), Option<String>> = BTreeMap::new();
    for track in &db.tracks {
        let key = (
            track.album.clone().unwrap_or_default(),
            track.effective_album_artist().to_string(),
        );
        let entry = grouped.entry(key).or_insert(None);
        if entry.is_none() {
            *entry = track.sort_artist.clone();
        }
    }

    let mut album_ids: HashMap<(String, String), u32> = HashMap::new();
    let mut albums = Vec::with_capacity(grouped.len());
    for (album_id, ((name, artist), sort_artist)) in grouped.into_iter().enumerate() {
        let album_id = album_id as u32 + 1;
        album_ids.insert((name.clone(), artist.clone()), album_id);
        albums.push(Album {
            album_id,
            name,
            artist,
            sort_artist,
        });
    }

    for track in db.tracks.iter_mut() {
        let key = (
            track.album.clone().unwrap_or_default(),
            track.effective_album_artist().to_string(),
        );
        track.album_id = album_ids.get(&key).copied().unwrap_or(0);
    }

    db.albums = albums;
}

/// Sequential track ids from 1, then artist/composer ids after the track-id
/// range (one shared counter, artists deduplicated, composers per-track).
fn assign_ids(db: &mut Database) {
    let mut track_id = 1u32;
    for track in db.tracks.iter_mut() {
        track.track_id = track_id;
        track_id += 1;
    }

    let mut next_id = track_id;
    let mut artist_ids: HashMap<String, u32> = HashMap::new();
    for track in db.tracks.iter_mut() {
        let artist_key = track
            .artist
            .as_deref()
            .unwrap_or("")
            .to_lowercase();
        let artist_id = *artist_ids.entry(artist_key).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        track.artist_id = artist_id;
        track.composer_id = next_id;
        next_id += 1;
    }
}

/// Regenerate the master playlist and carry surviving user playlists over
/// to the new track ids. Items whose track left the working set since the
/// last parse (removed tracks) are dropped here; anything still dangling
/// after the remap fails the pre-emit self-check.
fn remap_playlists(db: &mut Database, old_track_ids: &[u32], master_name: &str) {
    let mut old_to_new: HashMap<u32, u32> = HashMap::new();
    for (track, &old_id) in db.tracks.iter().zip(old_track_ids) {
        if old_id != 0 {
            old_to_new.insert(old_id, track.track_id);
        }
    }

    let mut playlists = Vec::with_capacity(db.playlists.len().max(1));
    playlists.push(Playlist {
        name: master_name.to_string(),
        is_master: true,
        playlist_id: rand::thread_rng().gen(),
        timestamp: now_unix(),
        sort_order: 5,
        items: db
            .tracks
            .iter()
            .enumerate()
            .map(|(position, t)| PlaylistItem {
                track_id: t.track_id,
                position: position as u32,
            })
            .collect(),
    });

    for playlist in db.playlists.drain(..).collect::<Vec<_>>() {
        if playlist.is_master {
            continue;
        }
        let before = playlist.items.len();
        let mut items: Vec<PlaylistItem> = playlist
            .items
            .iter()
            .filter_map(|item| old_to_new.get(&item.track_id).copied())
            .enumerate()
            .map(|(position, track_id)| PlaylistItem {
                track_id,
                position: position as u32,
            })
            .collect();
        if items.len() < before {
            warn!(
                playlist = %playlist.name,
                dropped = before - items.len(),
                "playlist items referenced removed tracks"
            );
        }
        items.shrink_to_fit();
        playlists.push(Playlist { items, ..playlist });
    }

    db.playlists = playlists;
}

/// Pre-emit self-check: every playlist item must resolve to an assigned
/// track id.
fn check_playlist_references(db: &Database) -> Result<()> {
    let valid: HashSet<u32> = db.tracks.iter().map(|t| t.track_id).collect();
    for playlist in &db.playlists {
        for item in &playlist.items {
            if !valid.contains(&item.track_id) {
                return Err(DbError::InvariantViolation(format!(
                    "playlist {:?} references missing track id {}",
                    playlist.name, item.track_id
                )));
            }
        }
    }
    Ok(())
}

fn write_mhbd_header(buf: &mut DbBuffer, db: &Database) {
    let mut header = [0u8; MHBD_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhbd");
    put_u32(&mut header, 0x04, MHBD_HEADER_SIZE as u32);
    // 0x08: total length, patched by the mhbd frame.
    put_u32(&mut header, 0x0C, 1);
    put_u32(&mut header, 0x10, db.version);
    put_u32(&mut header, 0x14, 5); // dataset count
    put_u64(&mut header, 0x18, db.device.db_id);
    put_u16(&mut header, 0x20, db.device.platform);
    put_u16(&mut header, 0x22, db.device.unk_0x22);
    put_u64(&mut header, 0x24, db.device.id_0x24);
    // 0x30: hashing scheme; the signer rewrites this for unsigned devices.
    put_u16(&mut header, 0x30, 1);
    let mut lang = db.device.language.as_bytes().to_vec();
    lang.resize(2, 0);
    header[0x46..0x48].copy_from_slice(&lang[..2]);
    put_u64(&mut header, 0x48, db.device.lib_persistent_id);
    put_u32(&mut header, 0x50, db.device.unk_0x50);
    put_u32(&mut header, 0x54, db.device.unk_0x54);
    // 0x58: hash58 slot, zeros until signed.
    put_i32(&mut header, 0x6C, db.device.timezone_offset);
    put_u16(&mut header, 0x70, db.device.unk_0x70);
    // 0x72: hash72 slot, zeros until signed.
    put_u16(&mut header, 0xA0, db.device.audio_language);
    put_u16(&mut header, 0xA2, db.device.subtitle_language);
    put_u16(&mut header, 0xA4, db.device.unk_0xa4);
    put_u16(&mut header, 0xA6, db.device.unk_0xa6);
    put_u16(&mut header, 0xA8, db.device.unk_0xa8);
    buf.append(&header);
}

fn open_mhsd(buf: &mut DbBuffer, ds_type: u32) -> ChunkFrame {
    let frame = ChunkFrame::open(buf);
    let mut header = [0u8; MHSD_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhsd");
    put_u32(&mut header, 0x04, MHSD_HEADER_SIZE as u32);
    put_u32(&mut header, 0x0C, ds_type);
    buf.append(&header);
    frame
}

fn write_album_dataset(buf: &mut DbBuffer, db: &Database) {
    let frame = open_mhsd(buf, 4);
    let mut header = [0u8; MHLA_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhla");
    put_u32(&mut header, 0x04, MHLA_HEADER_SIZE as u32);
    put_u32(&mut header, 0x08, db.albums.len() as u32);
    buf.append(&header);
    for album in &db.albums {
        write_mhia(buf, album);
    }
    frame.close(buf);
}

fn write_mhia(buf: &mut DbBuffer, album: &Album) {
    let frame = ChunkFrame::open(buf);

    let mut mhods: Vec<(u32, &str)> = Vec::new();
    if !album.name.is_empty() {
        mhods.push((mhod_type::MHIA_ALBUM, album.name.as_str()));
    }
    if !album.artist.is_empty() {
        mhods.push((mhod_type::MHIA_ARTIST, album.artist.as_str()));
    }
    if let Some(sort_artist) = album.sort_artist.as_deref() {
        if !sort_artist.is_empty() {
            mhods.push((mhod_type::MHIA_SORT_ARTIST, sort_artist));
        }
    }

    let mut header = [0u8; MHIA_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhia");
    put_u32(&mut header, 0x04, MHIA_HEADER_SIZE as u32);
    put_u32(&mut header, 0x0C, mhods.len() as u32);
    put_u32(&mut header, 0x10, album.album_id);
    // 0x14: id used by the device's internal SQLite mirror; must be non-zero.
    put_u64(&mut header, 0x14, generate_dbid());
    put_u32(&mut header, 0x1C, 2);
    buf.append(&header);

    for (kind, text) in mhods {
        write_string_mhod(buf, kind, text);
    }
    frame.close(buf);
}

fn write_track_dataset(buf: &mut DbBuffer, db: &Database) {
    let frame = open_mhsd(buf, 1);
    let mut header = [0u8; MHLT_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhlt");
    put_u32(&mut header, 0x04, MHLT_HEADER_SIZE as u32);
    put_u32(&mut header, 0x08, db.tracks.len() as u32);
    buf.append(&header);
    for track in &db.tracks {
        write_mhit(buf, track, db.device.id_0x24);
    }
    frame.close(buf);
}

/// String children a track carries, in emission order.
fn track_mhods(track: &Track) -> Vec<(u32, &str)> {
    let mut mhods: Vec<(u32, &str)> = Vec::new();
    fn push<'a>(mhods: &mut Vec<(u32, &'a str)>, kind: u32, value: Option<&'a str>) {
        if let Some(text) = value {
            if !text.is_empty() {
                mhods.push((kind, text));
            }
        }
    }
    push(&mut mhods, mhod_type::TITLE, Some(track.title.as_str()));
    push(&mut mhods, mhod_type::LOCATION, Some(track.location.as_str()));
    push(&mut mhods, mhod_type::ARTIST, track.artist.as_deref());
    push(&mut mhods, mhod_type::ALBUM, track.album.as_deref());
    push(&mut mhods, mhod_type::GENRE, track.genre.as_deref());
    push(&mut mhods, mhod_type::ALBUM_ARTIST, track.album_artist.as_deref());
    push(&mut mhods, mhod_type::COMPOSER, track.composer.as_deref());
    push(&mut mhods, mhod_type::COMMENT, track.comment.as_deref());
    push(&mut mhods, mhod_type::FILETYPE, track.filetype_desc.as_deref());
    push(&mut mhods, mhod_type::SORT_ARTIST, track.sort_artist.as_deref());
    push(&mut mhods, mhod_type::SORT_TITLE, track.sort_title.as_deref());
    push(&mut mhods, mhod_type::SORT_ALBUM, track.sort_album.as_deref());
    mhods
}

fn write_mhit(buf: &mut DbBuffer, track: &Track, id_0x24: u64) {
    let frame = ChunkFrame::open(buf);
    let mhods = track_mhods(track);

    let mut header = [0u8; MHIT_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhit");
    put_u32(&mut header, 0x04, MHIT_HEADER_SIZE as u32);
    put_u32(&mut header, 0x0C, mhods.len() as u32);
    put_u32(&mut header, 0x10, track.track_id);
    put_u32(&mut header, 0x14, 1); // visible
    put_u32(&mut header, 0x18, filetype_code(&track.filetype));
    header[0x1C] = track.vbr as u8;
    header[0x1D] = 1; // track type, always 1 for audio
    header[0x1E] = track.compilation as u8;
    header[0x1F] = track.rating.min(100);
    put_u32(&mut header, 0x20, unix_to_mac(track.date_added)); // time modified
    put_u32(&mut header, 0x24, track.size);
    put_u32(&mut header, 0x28, track.duration_ms);
    put_u32(&mut header, 0x2C, track.track_number);
    put_u32(&mut header, 0x30, track.total_tracks);
    put_u32(&mut header, 0x34, track.year);
    put_u32(&mut header, 0x38, track.bitrate);
    put_u32(&mut header, 0x3C, track.sample_rate << 16);
    put_i32(&mut header, 0x40, track.volume);
    put_u32(&mut header, 0x44, track.start_time_ms);
    put_u32(&mut header, 0x48, track.stop_time_ms);
    put_u32(&mut header, 0x50, track.play_count);
    put_u32(&mut header, 0x54, track.play_count_2);
    put_u32(&mut header, 0x58, unix_to_mac(track.last_played));
    put_u32(&mut header, 0x5C, track.disc_number);
    put_u32(&mut header, 0x60, track.total_discs);
    put_u32(&mut header, 0x68, unix_to_mac(track.date_added));
    put_u64(&mut header, 0x70, track.dbid);
    put_u16(&mut header, 0x7A, track.bpm);
    put_u16(&mut header, 0x7C, track.artwork_count);
    put_u16(&mut header, 0x7E, 0xFFFF);
    put_u32(&mut header, 0x80, track.artwork_size);
    put_f32(&mut header, 0x88, track.sample_rate as f32);
    put_u32(&mut header, 0x8C, unix_to_mac(track.date_released));
    put_u32(&mut header, 0x9C, track.skip_count);
    put_u32(&mut header, 0xA0, unix_to_mac(track.last_skipped));
    header[0xA4] = if track.artwork_count > 0 { 1 } else { 2 };
    // 0xB2: unplayed bullet marker.
    header[0xB2] = 0x02;
    put_u32(&mut header, 0xD0, track.media_type);
    put_u32(&mut header, 0x120, track.album_id);
    put_u64(&mut header, 0x124, id_0x24);
    put_u32(&mut header, 0x12C, track.size);
    put_u64(&mut header, 0x134, 0x8080_8080_8080);
    put_u32(&mut header, 0x160, track.mhii_link);
    put_u32(&mut header, 0x168, 1);
    put_u32(&mut header, 0x1E0, track.artist_id);
    put_u32(&mut header, 0x1F4, track.composer_id);
    buf.append(&header);

    for (kind, text) in mhods {
        write_string_mhod(buf, kind, text);
    }
    frame.close(buf);
}

/// Emit a string mhod: 24-byte header, 16-byte string sub-header
/// (encoding word, byte length, 1, 0), payload. Pure-ASCII strings are
/// stored UTF-8 (encoding 2), everything else UTF-16LE (encoding 1).
fn write_string_mhod(buf: &mut DbBuffer, kind: u32, text: &str) {
    let (payload, encoding): (Vec<u8>, u32) = if text.is_ascii() {
        (text.as_bytes().to_vec(), 2)
    } else {
        (
            text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            1,
        )
    };

    let total = (MHOD_HEADER_SIZE + 16 + payload.len()) as u32;
    buf.append(b"mhod");
    buf.write_u32_le(MHOD_HEADER_SIZE as u32);
    buf.write_u32_le(total);
    buf.write_u32_le(kind);
    buf.write_u32_le(0);
    buf.write_u32_le(0);
    buf.write_u32_le(encoding);
    buf.write_u32_le(payload.len() as u32);
    buf.write_u32_le(1);
    buf.write_u32_le(0);
    buf.append(&payload);
}

fn write_playlist_dataset(buf: &mut DbBuffer, db: &Database, ds_type: u32) {
    let frame = open_mhsd(buf, ds_type);
    let mut header = [0u8; MHLP_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhlp");
    put_u32(&mut header, 0x04, MHLP_HEADER_SIZE as u32);
    put_u32(&mut header, 0x08, db.playlists.len() as u32);
    buf.append(&header);
    for playlist in &db.playlists {
        write_mhyp(buf, playlist, db);
    }
    frame.close(buf);
}

fn write_smart_playlist_dataset(buf: &mut DbBuffer) {
    let frame = open_mhsd(buf, 5);
    let mut header = [0u8; MHLP_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhlp");
    put_u32(&mut header, 0x04, MHLP_HEADER_SIZE as u32);
    buf.append(&header);
    frame.close(buf);
}

fn write_mhyp(buf: &mut DbBuffer, playlist: &Playlist, db: &Database) {
    let frame = ChunkFrame::open(buf);

    // Title + prefs, plus index/jump-table pairs on a non-empty master.
    let index_mhods = if playlist.is_master && !db.tracks.is_empty() {
        10u32
    } else {
        0
    };
    let mhod_count = 2 + index_mhods;

    let mut header = [0u8; MHYP_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhyp");
    put_u32(&mut header, 0x04, MHYP_HEADER_SIZE as u32);
    put_u32(&mut header, 0x0C, mhod_count);
    put_u32(&mut header, 0x10, playlist.items.len() as u32);
    put_u32(&mut header, 0x14, playlist.is_master as u32); // hidden flag
    put_u32(&mut header, 0x18, unix_to_mac(playlist.timestamp));
    put_u64(&mut header, 0x1C, playlist.playlist_id);
    put_u16(&mut header, 0x28, 1); // string mhod count
    put_u32(&mut header, 0x2C, playlist.sort_order);
    if !playlist.is_master {
        put_u64(&mut header, 0x3C, db.device.id_0x24);
        put_u64(&mut header, 0x44, playlist.playlist_id);
    }
    put_u32(&mut header, 0x58, unix_to_mac(playlist.timestamp));
    buf.append(&header);

    write_string_mhod(buf, mhod_type::TITLE, &playlist.name);
    write_playlist_prefs_mhod(buf);
    if playlist.is_master {
        write_library_indices(buf, &db.tracks);
    }
    for item in &playlist.items {
        write_mhip(buf, item);
    }
    frame.close(buf);
}

/// Playlist preferences mhod (type 100): a fixed 648-byte display-settings
/// blob; the non-zero words are column-layout values observed in clean
/// iTunes databases.
fn write_playlist_prefs_mhod(buf: &mut DbBuffer) {
    let total = 0x288usize;
    let mut blob = vec![0u8; total];
    blob[..4].copy_from_slice(b"mhod");
    put_u32(&mut blob, 0x04, MHOD_HEADER_SIZE as u32);
    put_u32(&mut blob, 0x08, total as u32);
    put_u32(&mut blob, 0x0C, mhod_type::PLAYLIST_POSITION);
    put_u32(&mut blob, 0x30, 0x010084);
    put_u32(&mut blob, 0x34, 0x05);
    put_u32(&mut blob, 0x38, 0x09);
    put_u32(&mut blob, 0x3C, 0x03);
    put_u32(&mut blob, 0x40, 0x120001);
    put_u32(&mut blob, 0x4C, 0x640014);
    put_u32(&mut blob, 0x50, 0x01);
    put_u32(&mut blob, 0x5C, 0x320014);
    put_u32(&mut blob, 0x60, 0x01);
    put_u32(&mut blob, 0x6C, 0x5A0014);
    put_u32(&mut blob, 0x70, 0x01);
    put_u32(&mut blob, 0x7C, 0x500014);
    put_u32(&mut blob, 0x80, 0x01);
    put_u32(&mut blob, 0x8C, 0x7D0015);
    put_u32(&mut blob, 0x90, 0x01);
    buf.append(&blob);
}

fn write_mhip(buf: &mut DbBuffer, item: &PlaylistItem) {
    let total = MHIP_HEADER_SIZE as u32 + 44;
    let mut header = [0u8; MHIP_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhip");
    put_u32(&mut header, 0x04, MHIP_HEADER_SIZE as u32);
    put_u32(&mut header, 0x08, total);
    put_u32(&mut header, 0x0C, 1); // one child mhod
    put_u32(&mut header, 0x18, item.track_id);
    buf.append(&header);

    // Child mhod type 100 carrying the playlist position.
    buf.append(b"mhod");
    buf.write_u32_le(MHOD_HEADER_SIZE as u32);
    buf.write_u32_le(44);
    buf.write_u32_le(mhod_type::PLAYLIST_POSITION);
    buf.write_u32_le(0);
    buf.write_u32_le(0);
    buf.write_u32_le(item.position);
    buf.pad(16);
}

// ---------------------------------------------------------------------------
// Library indices (master playlist mhod 52/53 pairs)
// ---------------------------------------------------------------------------

/// Case-insensitive sort text; leading "The " is dropped, iTunes style.
fn sort_text(s: &str) -> String {
    let lower = s.to_lowercase();
    match lower.strip_prefix("the ") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// First alphanumeric character for jump-table grouping; digits group
/// under '0'.
fn jump_letter(s: &str) -> u16 {
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            if ch.is_ascii_digit() {
                return b'0' as u16;
            }
            let upper = ch.to_uppercase().next().unwrap_or(ch);
            return upper as u32 as u16;
        }
    }
    b'0' as u16
}

type SortKey = (String, String, String, u32, u32, String);

fn sort_key(track: &Track, sort_type: u32) -> SortKey {
    let title = sort_text(&track.title);
    let album = sort_text(track.album.as_deref().unwrap_or(""));
    let artist = sort_text(
        track
            .sort_artist
            .as_deref()
            .or(track.artist.as_deref())
            .unwrap_or(""),
    );
    let genre = sort_text(track.genre.as_deref().unwrap_or(""));
    let composer = sort_text(track.composer.as_deref().unwrap_or(""));
    let disc = track.disc_number;
    let number = track.track_number;

    match sort_type {
        SORT_ALBUM => (album, String::new(), String::new(), disc, number, title),
        SORT_ARTIST => (artist, album, String::new(), disc, number, title),
        SORT_GENRE => (genre, artist, album, disc, number, title),
        SORT_COMPOSER => (composer, album, String::new(), disc, number, title),
        _ => (title.clone(), String::new(), String::new(), 0, 0, title),
    }
}

fn jump_source(track: &Track, sort_type: u32) -> &str {
    match sort_type {
        SORT_ALBUM => track.album.as_deref().unwrap_or(""),
        SORT_ARTIST => track
            .sort_artist
            .as_deref()
            .or(track.artist.as_deref())
            .unwrap_or(""),
        SORT_GENRE => track.genre.as_deref().unwrap_or(""),
        SORT_COMPOSER => track.composer.as_deref().unwrap_or(""),
        _ => &track.title,
    }
}

/// Pre-sorted position arrays (mhod 52) and letter jump tables (mhod 53)
/// for the five browse categories. Without these the device shows an empty
/// library even though tracks exist.
fn write_library_indices(buf: &mut DbBuffer, tracks: &[Track]) {
    if tracks.is_empty() {
        return;
    }

    for sort_type in ALL_SORT_TYPES {
        let mut indexed: Vec<(SortKey, usize)> = tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (sort_key(t, sort_type), i))
            .collect();
        indexed.sort();

        // Jump entries: (letter, start position, run length).
        let mut jump_entries: Vec<(u16, u32, u32)> = Vec::new();
        for (position, (_, track_index)) in indexed.iter().enumerate() {
            let letter = jump_letter(jump_source(&tracks[*track_index], sort_type));
            match jump_entries.last_mut() {
                Some((last, _, count)) if *last == letter => *count += 1,
                _ => jump_entries.push((letter, position as u32, 1)),
            }
        }

        // mhod 52: header + sort_type + count + 40 pad + indices.
        let total52 = (4 * indexed.len() + 72) as u32;
        buf.append(b"mhod");
        buf.write_u32_le(MHOD_HEADER_SIZE as u32);
        buf.write_u32_le(total52);
        buf.write_u32_le(mhod_type::LIBRARY_INDEX);
        buf.write_u32_le(0);
        buf.write_u32_le(0);
        buf.write_u32_le(sort_type);
        buf.write_u32_le(indexed.len() as u32);
        buf.pad(40);
        for (_, track_index) in &indexed {
            buf.write_u32_le(*track_index as u32);
        }

        // mhod 53: header + sort_type + count + 8 pad + 12-byte entries.
        let total53 = (12 * jump_entries.len() + 40) as u32;
        buf.append(b"mhod");
        buf.write_u32_le(MHOD_HEADER_SIZE as u32);
        buf.write_u32_le(total53);
        buf.write_u32_le(mhod_type::LIBRARY_JUMP_TABLE);
        buf.write_u32_le(0);
        buf.write_u32_le(0);
        buf.write_u32_le(sort_type);
        buf.write_u32_le(jump_entries.len() as u32);
        buf.pad(8);
        for (letter, start, count) in jump_entries {
            buf.write_u16_le(letter);
            buf.write_u16_le(0);
            buf.write_u32_le(start);
            buf.write_u32_le(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(title: &str, artist: &str, album: &str) -> Track {
        Track {
            title: title.to_string(),
            location: format!(":iPod_Control:Music:F00:{title}.mp3"),
            artist: Some(artist.to_string()),
            album: Some(album.to_string()),
            size: 1000,
            duration_ms: 180_000,
            ..Track::default()
        }
    }

    #[test]
    fn duplicate_dbids_are_rejected() {
        let mut db = Database::default();
        let mut a = track("A", "X", "Z");
        let mut b = track("B", "X", "Z");
        a.dbid = 7;
        b.dbid = 7;
        db.tracks = vec![a, b];
        assert!(matches!(
            write(&mut db, "iPod"),
            Err(DbError::InvariantViolation(_))
        ));
    }

    #[test]
    fn ids_are_assigned_sequentially() {
        let mut db = Database::default();
        db.tracks = vec![track("A", "X", "Z"), track("B", "Y", "Z")];
        let result = write(&mut db, "iPod").unwrap();
        assert_eq!(result.assignments[0].track_id, 1);
        assert_eq!(result.assignments[1].track_id, 2);
        assert_eq!(result.next_track_id, 3);
        assert!(db.tracks.iter().all(|t| t.dbid != 0));
        // Artist ids land after the track-id range.
        assert!(db.tracks[0].artist_id > 2);
    }

    #[test]
    fn sort_text_strips_leading_the() {
        assert_eq!(sort_text("The Beatles"), "beatles");
        assert_eq!(sort_text("Theory"), "theory");
    }

    #[test]
    fn jump_letter_groups_digits() {
        assert_eq!(jump_letter("99 Luftballons"), b'0' as u16);
        assert_eq!(jump_letter("abba"), b'A' as u16);
        assert_eq!(jump_letter("...baroque"), b'B' as u16);
        assert_eq!(jump_letter(""), b'0' as u16);
    }

    #[test]
    fn dangling_playlist_reference_fails_the_self_check() {
        let mut db = Database::default();
        let mut a = track("A", "X", "Z");
        a.track_id = 1;
        db.tracks = vec![a];
        db.playlists = vec![Playlist {
            name: "broken".into(),
            is_master: false,
            playlist_id: 1,
            timestamp: 0,
            sort_order: 0,
            items: vec![PlaylistItem {
                track_id: 77,
                position: 0,
            }],
        }];
        assert!(matches!(
            check_playlist_references(&db),
            Err(DbError::InvariantViolation(_))
        ));
    }

    #[test]
    fn user_playlists_are_remapped_and_master_regenerated() {
        let mut db = Database::default();
        let mut a = track("A", "X", "Z");
        a.track_id = 40;
        let mut b = track("B", "Y", "Z");
        b.track_id = 41;
        db.tracks = vec![a, b];
        db.playlists = vec![
            Playlist {
                name: "old master".into(),
                is_master: true,
                playlist_id: 1,
                timestamp: 0,
                sort_order: 5,
                items: vec![],
            },
            Playlist {
                name: "Favourites".into(),
                is_master: false,
                playlist_id: 2,
                timestamp: 0,
                sort_order: 0,
                items: vec![
                    PlaylistItem {
                        track_id: 41,
                        position: 0,
                    },
                    PlaylistItem {
                        track_id: 999, // dangling, must be dropped
                        position: 1,
                    },
                ],
            },
        ];

        write(&mut db, "My iPod").unwrap();

        assert_eq!(db.playlists.len(), 2);
        assert!(db.playlists[0].is_master);
        assert_eq!(db.playlists[0].name, "My iPod");
        assert_eq!(db.playlists[0].items.len(), 2);
        let favourites = &db.playlists[1];
        assert_eq!(favourites.items.len(), 1);
        assert_eq!(favourites.items[0].track_id, db.tracks[1].track_id);
    }
}
