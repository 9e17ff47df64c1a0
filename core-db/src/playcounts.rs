//! Play Counts file reader.
//!
//! The firmware appends `/iPod_Control/iTunes/Play Counts` during use
//! instead of rewriting the database. Layout: `mhdp` tag, header length,
//! entry length (0x1C on modern firmware), entry count, then one
//! fixed-size entry per track *in database track order*:
//!
//! | word | field        |
//! |------|--------------|
//! | 0    | play_count   |
//! | 1    | last_played  |
//! | 2    | bookmark_ms  |
//! | 3    | rating       |
//! | 4    | (unknown)    |
//! | 5    | skip_count   |
//! | 6    | last_skipped |
//!
//! Entries shorter than seven words (older firmware) simply stop early.

use crate::error::{DbError, Result};
use crate::record::{mac_to_unix, Track};
use tracing::{debug, warn};

/// One per-track entry, timestamps already converted to Unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayCountEntry {
    pub play_count: u32,
    pub last_played: u64,
    pub bookmark_ms: u32,
    pub rating: u32,
    pub skip_count: u32,
    pub last_skipped: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PlayCounts {
    pub entries: Vec<PlayCountEntry>,
}

/// Parse a Play Counts image.
pub fn parse(data: &[u8]) -> Result<PlayCounts> {
    if data.len() < 16 {
        return Err(DbError::BadPlayCounts("file shorter than header".into()));
    }
    if &data[..4] != b"mhdp" {
        return Err(DbError::BadPlayCounts("missing mhdp tag".into()));
    }

    let header_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let entry_len = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    let entry_count = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;

    if entry_len < 4 {
        return Err(DbError::BadPlayCounts(format!(
            "entry length {entry_len} too small"
        )));
    }
    if header_len + entry_len * entry_count > data.len() {
        return Err(DbError::BadPlayCounts(format!(
            "{entry_count} entries of {entry_len} bytes exceed file size {}",
            data.len()
        )));
    }

    let word = |entry: usize, index: usize| -> u32 {
        let rel = index * 4;
        if rel + 4 > entry_len {
            return 0;
        }
        let at = header_len + entry * entry_len + rel;
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    };

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        entries.push(PlayCountEntry {
            play_count: word(i, 0),
            last_played: mac_to_unix(word(i, 1)),
            bookmark_ms: word(i, 2),
            rating: word(i, 3),
            skip_count: word(i, 5),
            last_skipped: mac_to_unix(word(i, 6)),
        });
    }

    debug!(entries = entries.len(), "parsed Play Counts");
    Ok(PlayCounts { entries })
}

/// Fold device-side plays into the working set.
///
/// Entries align positionally with the track list the database was written
/// with. Plays land in `play_count_2` (plays since last sync); ratings set
/// the track's device-side rating so the diff engine sees them.
pub fn apply(counts: &PlayCounts, tracks: &mut [Track]) -> usize {
    if counts.entries.len() != tracks.len() {
        warn!(
            entries = counts.entries.len(),
            tracks = tracks.len(),
            "Play Counts entry count does not match track count; applying prefix"
        );
    }

    let mut touched = 0;
    for (track, entry) in tracks.iter_mut().zip(&counts.entries) {
        let mut changed = false;
        if entry.play_count > 0 {
            track.play_count_2 += entry.play_count;
            changed = true;
        }
        if entry.last_played > track.last_played {
            track.last_played = entry.last_played;
            changed = true;
        }
        if entry.skip_count > 0 {
            track.skip_count += entry.skip_count;
            changed = true;
        }
        if entry.rating <= 100 && entry.rating as u8 != track.rating && entry.rating != 0 {
            track.rating = entry.rating as u8;
            changed = true;
        }
        if changed {
            touched += 1;
        }
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::unix_to_mac;

    fn play_counts_image(entries: &[[u32; 7]]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"mhdp");
        data.extend_from_slice(&96u32.to_le_bytes());
        data.extend_from_slice(&0x1Cu32.to_le_bytes());
        data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        data.resize(96, 0);
        for entry in entries {
            for word in entry {
                data.extend_from_slice(&word.to_le_bytes());
            }
        }
        data
    }

    #[test]
    fn parses_entries() {
        let image = play_counts_image(&[
            [3, unix_to_mac(1_300_000_000), 0, 80, 0, 1, 0],
            [0, 0, 0, 0, 0, 0, 0],
        ]);
        let counts = parse(&image).unwrap();
        assert_eq!(counts.entries.len(), 2);
        assert_eq!(counts.entries[0].play_count, 3);
        assert_eq!(counts.entries[0].last_played, 1_300_000_000);
        assert_eq!(counts.entries[0].rating, 80);
        assert_eq!(counts.entries[1], PlayCountEntry::default());
    }

    #[test]
    fn rejects_bad_tag_and_truncation() {
        assert!(parse(b"mhdq0000000000000000").is_err());
        let mut image = play_counts_image(&[[1, 0, 0, 0, 0, 0, 0]]);
        image.truncate(100);
        assert!(parse(&image).is_err());
    }

    #[test]
    fn apply_folds_into_play_count_2() {
        let image = play_counts_image(&[[2, unix_to_mac(1_400_000_000), 0, 60, 0, 0, 0]]);
        let counts = parse(&image).unwrap();

        let mut tracks = vec![Track {
            play_count: 5,
            play_count_2: 1,
            rating: 40,
            ..Track::default()
        }];
        let touched = apply(&counts, &mut tracks);

        assert_eq!(touched, 1);
        assert_eq!(tracks[0].play_count_2, 3);
        assert_eq!(tracks[0].last_played, 1_400_000_000);
        assert_eq!(tracks[0].rating, 60);
    }
}
