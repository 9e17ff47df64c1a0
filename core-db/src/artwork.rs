//! ArtworkDB codec and `.ithmb` pixel-file writer.
//!
//! Album art lives in two places: `Artwork/ArtworkDB` (metadata tree) and
//! `Artwork/F<id>_1.ithmb` (raw RGB565 rows, one file per pixel format).
//! Tracks point at an image record through `mhiiLink`.
//!
//! Tree layout:
//!
//! ```text
//! mhfd
//!   mhsd type 1 → mhli → mhii[]      image entries, one per unique image
//!     each mhii: mhod type 2 → mhni → mhod type 3 (ithmb filename)
//!                ... one per pixel format, plus one mhod type 6 (mhaf)
//!   mhsd type 2 → mhla               empty for music artwork
//!   mhsd type 3 → mhlf → mhif[]      per-format ithmb entry sizes
//! ```
//!
//! The whole ArtworkDB is rewritten on demand; art for tracks without a PC
//! source is preserved by reading the old pixel rows back out of the
//! existing ithmb files before they are truncated.

use crate::buffer::{ChunkFrame, DbBuffer};
use crate::error::{DbError, Result};
use bridge_traits::{ArtworkFormat, ImageEncoder};
use bytes::Bytes;
use core_device::{atomic_write, DeviceLayout};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use tracing::{debug, info, warn};

pub const MHFD_HEADER_SIZE: usize = 132;
pub const MHSD_HEADER_SIZE: usize = 96;
pub const MHLI_HEADER_SIZE: usize = 92;
pub const MHLA_HEADER_SIZE: usize = 92;
pub const MHLF_HEADER_SIZE: usize = 92;
pub const MHII_HEADER_SIZE: usize = 152;
pub const MHNI_HEADER_SIZE: usize = 76;
pub const MHIF_HEADER_SIZE: usize = 124;
pub const MHOD_HEADER_SIZE: usize = 24;

/// Image ids start here, matching what iTunes hands out.
pub const START_IMAGE_ID: u32 = 100;

/// Pixel formats written for Classic-generation devices.
pub const ARTWORK_FORMATS: [ArtworkFormat; 3] = [
    ArtworkFormat::new(1055, 140, 140), // 39200 bytes
    ArtworkFormat::new(1060, 100, 100), // 20000 bytes
    ArtworkFormat::new(1061, 56, 56),   // 6272 bytes
];

/// MD5 of the embedded image bytes, the dedup/change-detection key.
pub fn art_hash(art: &[u8]) -> String {
    let digest = Md5::digest(art);
    hex_string(&digest)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Input per track: its dbid, fresh source art when the PC file has any,
/// and the track's current `mhiiLink` for preservation.
#[derive(Debug, Clone)]
pub struct ArtworkSource {
    pub dbid: u64,
    pub art: Option<Bytes>,
    pub existing_mhii_link: u32,
}

/// Result per track: the image record id and the source image byte size
/// (both end up on the mhit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtworkLink {
    pub image_id: u32,
    pub source_size: u32,
}

#[derive(Debug)]
struct ImageEntry {
    image_id: u32,
    song_id: u64,
    source_size: u32,
    /// correlation id → pixel rows.
    formats: BTreeMap<u32, Vec<u8>>,
    dbids: Vec<u64>,
}

/// An image read back from an existing ArtworkDB + ithmb pair.
#[derive(Debug)]
struct ExistingImage {
    source_size: u32,
    formats: BTreeMap<u32, Vec<u8>>,
}

/// Rewrites the ArtworkDB and pixel files for a device.
pub struct ArtworkWriter<'a> {
    layout: DeviceLayout,
    encoder: &'a dyn ImageEncoder,
}

impl<'a> ArtworkWriter<'a> {
    pub fn new(layout: DeviceLayout, encoder: &'a dyn ImageEncoder) -> Self {
        Self { layout, encoder }
    }

    /// Rebuild the ArtworkDB and ithmb files from scratch.
    ///
    /// Sources with fresh art are deduplicated by content hash; sources
    /// without art keep their existing image when its pixel data can still
    /// be read. Returns the `dbid → (image id, source size)` map the
    /// executor assigns `mhiiLink`s from; the map is empty when no track
    /// has any art.
    pub fn rewrite(&self, sources: &[ArtworkSource]) -> Result<HashMap<u64, ArtworkLink>> {
        let existing = self.read_existing();

        // Deduplicate fresh art by hash.
        let mut fresh: BTreeMap<String, (Bytes, Vec<u64>)> = BTreeMap::new();
        // Preserve existing entries, keyed by old image id.
        let mut preserved: BTreeMap<u32, Vec<u64>> = BTreeMap::new();

        for source in sources {
            if let Some(art) = &source.art {
                fresh
                    .entry(art_hash(art))
                    .or_insert_with(|| (art.clone(), Vec::new()))
                    .1
                    .push(source.dbid);
            } else if source.existing_mhii_link != 0
                && existing.contains_key(&source.existing_mhii_link)
            {
                preserved
                    .entry(source.existing_mhii_link)
                    .or_default()
                    .push(source.dbid);
            }
        }

        if fresh.is_empty() && preserved.is_empty() {
            debug!("no artwork to write");
            return Ok(HashMap::new());
        }

        let mut entries: Vec<ImageEntry> = Vec::with_capacity(fresh.len() + preserved.len());
        let mut image_id = START_IMAGE_ID;

        for (hash, (art, dbids)) in &fresh {
            let mut formats = BTreeMap::new();
            for format in ARTWORK_FORMATS {
                match self.encoder.encode(art, format) {
                    Ok(encoded) => {
                        if encoded.data.len() != format.pixel_bytes() as usize {
                            return Err(DbError::Artwork(format!(
                                "encoder returned {} bytes for format {} (expected {})",
                                encoded.data.len(),
                                format.correlation_id,
                                format.pixel_bytes()
                            )));
                        }
                        formats.insert(format.correlation_id, encoded.data.to_vec());
                    }
                    Err(e) => {
                        warn!(hash = %hash, format = format.correlation_id, error = %e, "artwork encode failed");
                    }
                }
            }
            if formats.is_empty() {
                continue;
            }
            entries.push(ImageEntry {
                image_id,
                song_id: dbids[0],
                source_size: art.len() as u32,
                formats,
                dbids: dbids.clone(),
            });
            image_id += 1;
        }

        for (old_id, dbids) in &preserved {
            let image = &existing[old_id];
            entries.push(ImageEntry {
                image_id,
                song_id: dbids[0],
                source_size: image.source_size,
                formats: image.formats.clone(),
                dbids: dbids.clone(),
            });
            image_id += 1;
        }

        if entries.is_empty() {
            warn!("no artwork could be encoded");
            return Ok(HashMap::new());
        }

        // ithmb files: pixel rows appended in entry order, one file per
        // format; remember each entry's byte offset per format.
        fs::create_dir_all(self.layout.artwork_dir())?;
        let mut offsets: HashMap<(u32, u32), u32> = HashMap::new();
        for format in ARTWORK_FORMATS {
            let id = format.correlation_id;
            let mut pixels: Vec<u8> = Vec::new();
            for entry in &entries {
                if let Some(data) = entry.formats.get(&id) {
                    offsets.insert((entry.image_id, id), pixels.len() as u32);
                    pixels.extend_from_slice(data);
                }
            }
            fs::write(self.layout.ithmb_file(id), &pixels)?;
        }

        let next_image_id = image_id;
        let bytes = emit_artwork_db(&entries, &offsets, next_image_id);
        atomic_write(&self.layout.artwork_db(), &bytes)?;
        info!(
            images = entries.len(),
            bytes = bytes.len(),
            "ArtworkDB rewritten"
        );

        let mut links = HashMap::new();
        for entry in &entries {
            for dbid in &entry.dbids {
                links.insert(
                    *dbid,
                    ArtworkLink {
                        image_id: entry.image_id,
                        source_size: entry.source_size,
                    },
                );
            }
        }
        Ok(links)
    }

    /// Read existing image entries plus their pixel rows, for preservation.
    fn read_existing(&self) -> HashMap<u32, ExistingImage> {
        let path = self.layout.artwork_db();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => return HashMap::new(),
        };

        let parsed = match parse_artwork_db(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "existing ArtworkDB unreadable, ignoring");
                return HashMap::new();
            }
        };

        let mut images = HashMap::new();
        for image in parsed {
            let mut formats = BTreeMap::new();
            for (correlation_id, offset, size) in &image.locations {
                let ithmb = self.layout.ithmb_file(*correlation_id);
                if let Ok(pixels) = fs::read(&ithmb) {
                    let start = *offset as usize;
                    let end = start + *size as usize;
                    if end <= pixels.len() {
                        formats.insert(*correlation_id, pixels[start..end].to_vec());
                    }
                }
            }
            if !formats.is_empty() {
                images.insert(
                    image.image_id,
                    ExistingImage {
                        source_size: image.source_size,
                        formats,
                    },
                );
            }
        }
        images
    }
}

/// One image record parsed from an ArtworkDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage {
    pub image_id: u32,
    pub song_id: u64,
    pub source_size: u32,
    /// `(correlation id, ithmb byte offset, byte length)` per format.
    pub locations: Vec<(u32, u32, u32)>,
}

/// Parse the image list of an ArtworkDB.
pub fn parse_artwork_db(data: &[u8]) -> Result<Vec<ParsedImage>> {
    let need = |offset: usize, len: usize| -> Result<()> {
        if offset + len > data.len() {
            Err(DbError::Truncated { offset })
        } else {
            Ok(())
        }
    };
    let u16_at = |offset: usize| -> u16 { u16::from_le_bytes([data[offset], data[offset + 1]]) };
    let u32_at =
        |offset: usize| -> u32 { u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) };
    let u64_at =
        |offset: usize| -> u64 { u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap()) };

    need(0, 32)?;
    if &data[..4] != b"mhfd" {
        return Err(DbError::BadMagic {
            offset: 0,
            found: String::from_utf8_lossy(&data[..4]).into_owned(),
        });
    }
    let header_len = u32_at(4) as usize;
    let child_count = u32_at(20);

    let mut images = Vec::new();
    let mut offset = header_len;

    for _ in 0..child_count {
        need(offset, 16)?;
        if &data[offset..offset + 4] != b"mhsd" {
            break;
        }
        let mhsd_header = u32_at(offset + 4) as usize;
        let mhsd_total = u32_at(offset + 8) as usize;
        let ds_type = u16_at(offset + 12);

        if ds_type == 1 {
            let mhli = offset + mhsd_header;
            need(mhli, 12)?;
            if &data[mhli..mhli + 4] == b"mhli" {
                let mhli_header = u32_at(mhli + 4) as usize;
                let image_count = u32_at(mhli + 8);
                let mut at = mhli + mhli_header;
                for _ in 0..image_count {
                    need(at, MHII_HEADER_SIZE)?;
                    if &data[at..at + 4] != b"mhii" {
                        break;
                    }
                    let mhii_header = u32_at(at + 4) as usize;
                    let mhii_total = u32_at(at + 8) as usize;
                    let mhii_children = u32_at(at + 12);
                    let mut image = ParsedImage {
                        image_id: u32_at(at + 16),
                        song_id: u64_at(at + 20),
                        source_size: u32_at(at + 48),
                        locations: Vec::new(),
                    };

                    let mut child = at + mhii_header;
                    for _ in 0..mhii_children {
                        need(child, 14)?;
                        if &data[child..child + 4] != b"mhod" {
                            break;
                        }
                        let mhod_header = u32_at(child + 4) as usize;
                        let mhod_total = u32_at(child + 8) as usize;
                        let mhod_kind = u16_at(child + 12);
                        if mhod_kind == 2 {
                            let mhni = child + mhod_header;
                            need(mhni, 28)?;
                            if &data[mhni..mhni + 4] == b"mhni" {
                                image.locations.push((
                                    u32_at(mhni + 16),
                                    u32_at(mhni + 20),
                                    u32_at(mhni + 24),
                                ));
                            }
                        }
                        child += mhod_total.max(MHOD_HEADER_SIZE);
                    }

                    images.push(image);
                    at += mhii_total.max(MHII_HEADER_SIZE);
                }
            }
        }

        offset += mhsd_total.max(MHSD_HEADER_SIZE);
    }

    Ok(images)
}

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn emit_artwork_db(
    entries: &[ImageEntry],
    offsets: &HashMap<(u32, u32), u32>,
    next_image_id: u32,
) -> Vec<u8> {
    let mut buf = DbBuffer::with_capacity(4096 + entries.len() * 512);

    let mhfd = ChunkFrame::open(&buf);
    let mut header = [0u8; MHFD_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhfd");
    put_u32(&mut header, 4, MHFD_HEADER_SIZE as u32);
    put_u32(&mut header, 16, 6);
    put_u32(&mut header, 20, 3); // dataset count
    put_u32(&mut header, 28, next_image_id);
    put_u32(&mut header, 48, 2);
    buf.append(&header);

    // Dataset 1: image list.
    let ds1 = open_art_mhsd(&mut buf, 1);
    let mut mhli = [0u8; MHLI_HEADER_SIZE];
    mhli[..4].copy_from_slice(b"mhli");
    put_u32(&mut mhli, 4, MHLI_HEADER_SIZE as u32);
    put_u32(&mut mhli, 8, entries.len() as u32);
    buf.append(&mhli);
    for entry in entries {
        write_mhii(&mut buf, entry, offsets);
    }
    ds1.close(&mut buf);

    // Dataset 2: album list, unused for music artwork.
    let ds2 = open_art_mhsd(&mut buf, 2);
    let mut mhla = [0u8; MHLA_HEADER_SIZE];
    mhla[..4].copy_from_slice(b"mhla");
    put_u32(&mut mhla, 4, MHLA_HEADER_SIZE as u32);
    buf.append(&mhla);
    ds2.close(&mut buf);

    // Dataset 3: per-format file list.
    let ds3 = open_art_mhsd(&mut buf, 3);
    let mut mhlf = [0u8; MHLF_HEADER_SIZE];
    mhlf[..4].copy_from_slice(b"mhlf");
    put_u32(&mut mhlf, 4, MHLF_HEADER_SIZE as u32);
    put_u32(&mut mhlf, 8, ARTWORK_FORMATS.len() as u32);
    buf.append(&mhlf);
    for format in ARTWORK_FORMATS {
        let mut mhif = [0u8; MHIF_HEADER_SIZE];
        mhif[..4].copy_from_slice(b"mhif");
        put_u32(&mut mhif, 4, MHIF_HEADER_SIZE as u32);
        put_u32(&mut mhif, 8, MHIF_HEADER_SIZE as u32);
        put_u32(&mut mhif, 16, format.correlation_id);
        put_u32(&mut mhif, 20, format.pixel_bytes());
        buf.append(&mhif);
    }
    ds3.close(&mut buf);

    mhfd.close(&mut buf);
    buf.into_bytes()
}

fn open_art_mhsd(buf: &mut DbBuffer, ds_type: u16) -> ChunkFrame {
    let frame = ChunkFrame::open(buf);
    let mut header = [0u8; MHSD_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhsd");
    put_u32(&mut header, 4, MHSD_HEADER_SIZE as u32);
    put_u16(&mut header, 12, ds_type);
    buf.append(&header);
    frame
}

fn write_mhii(buf: &mut DbBuffer, entry: &ImageEntry, offsets: &HashMap<(u32, u32), u32>) {
    let frame = ChunkFrame::open(buf);
    let child_count = entry.formats.len() as u32 + 1; // + mhod type 6

    let mut header = [0u8; MHII_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhii");
    put_u32(&mut header, 4, MHII_HEADER_SIZE as u32);
    put_u32(&mut header, 12, child_count);
    put_u32(&mut header, 16, entry.image_id);
    put_u64(&mut header, 20, entry.song_id);
    put_u32(&mut header, 48, entry.source_size);
    put_u32(&mut header, 56, 9);
    put_u32(&mut header, 60, 1);
    buf.append(&header);

    for (correlation_id, pixels) in &entry.formats {
        let offset = offsets
            .get(&(entry.image_id, *correlation_id))
            .copied()
            .unwrap_or(0);
        write_image_container_mhod(buf, *correlation_id, offset, pixels.len() as u32);
    }
    write_mhaf_mhod(buf);

    frame.close(buf);
}

/// mhod type 2 wrapping an mhni that locates one format's pixels.
fn write_image_container_mhod(
    buf: &mut DbBuffer,
    correlation_id: u32,
    ithmb_offset: u32,
    img_size: u32,
) {
    let format = ARTWORK_FORMATS
        .iter()
        .find(|f| f.correlation_id == correlation_id)
        .copied()
        .unwrap_or(ArtworkFormat::new(correlation_id, 0, 0));

    let mhod = ChunkFrame::open(buf);
    let mut header = [0u8; MHOD_HEADER_SIZE];
    header[..4].copy_from_slice(b"mhod");
    put_u32(&mut header, 4, MHOD_HEADER_SIZE as u32);
    put_u16(&mut header, 12, 2);
    buf.append(&header);

    let mhni = ChunkFrame::open(buf);
    let mut body = [0u8; MHNI_HEADER_SIZE];
    body[..4].copy_from_slice(b"mhni");
    put_u32(&mut body, 4, MHNI_HEADER_SIZE as u32);
    put_u32(&mut body, 12, 1); // one child: the filename mhod
    put_u32(&mut body, 16, correlation_id);
    put_u32(&mut body, 20, ithmb_offset);
    put_u32(&mut body, 24, img_size);
    put_u16(&mut body, 32, format.height);
    put_u16(&mut body, 34, format.width);
    put_u32(&mut body, 40, img_size);
    buf.append(&body);

    write_filename_mhod(buf, &format!(":F{correlation_id}_1.ithmb"));
    mhni.close(buf);
    mhod.close(buf);
}

/// mhod type 3: the ithmb filename, UTF-16LE with a 12-byte string header
/// and 4-byte alignment padding.
fn write_filename_mhod(buf: &mut DbBuffer, filename: &str) {
    let encoded: Vec<u8> = filename.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let padding = (4 - encoded.len() % 4) % 4;
    let total = MHOD_HEADER_SIZE + 12 + encoded.len() + padding;

    buf.append(b"mhod");
    buf.write_u32_le(MHOD_HEADER_SIZE as u32);
    buf.write_u32_le(total as u32);
    buf.write_u16_le(3);
    buf.pad(10);
    buf.write_u32_le(encoded.len() as u32);
    buf.write_u8(2); // encoding: UTF-16LE
    buf.pad(3);
    buf.pad(4);
    buf.append(&encoded);
    buf.pad(padding);
}

/// mhod type 6 carrying an mhaf, present in device-generated databases.
/// The mhaf's length words are 96/60 as observed on real hardware.
fn write_mhaf_mhod(buf: &mut DbBuffer) {
    let mhaf_len = 96usize;
    buf.append(b"mhod");
    buf.write_u32_le(MHOD_HEADER_SIZE as u32);
    buf.write_u32_le((MHOD_HEADER_SIZE + mhaf_len) as u32);
    buf.write_u16_le(6);
    buf.pad(10);

    let mut mhaf = vec![0u8; mhaf_len];
    mhaf[..4].copy_from_slice(b"mhaf");
    put_u32(&mut mhaf, 4, mhaf_len as u32);
    put_u32(&mut mhaf, 8, 60);
    buf.append(&mhaf);
}
