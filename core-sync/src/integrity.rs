//! Integrity checker over the three sources of truth.
//!
//! Files on the device, tracks in the database, and entries in the mapping
//! can drift apart after an interrupted sync. Three checks run before the
//! diff, in order, so the plan is computed on consistent data:
//!
//! - **A. database → filesystem**: tracks whose audio file is gone leave
//!   the working set (silently, as if never there).
//! - **B. mapping → database**: entries whose dbid no longer exists are
//!   deleted.
//! - **C. filesystem → database**: audio files under `Music/F*` referenced
//!   by no track are deleted to reclaim space.
//!
//! Repairs are reported non-actionably on the plan; running the checker
//! twice in a row finds nothing the second time.

use crate::mapping::MappingFile;
use core_db::record::Track;
use core_device::DeviceLayout;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Audio extensions that may appear under `Music/F*`.
const DEVICE_AUDIO_EXTS: &[&str] = &[
    "mp3", "m4a", "m4b", "m4p", "mp4", "aac", "wav", "aif", "aiff", "alac",
];

/// What the integrity pass found and fixed.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Check A: descriptions of tracks dropped for missing files.
    pub missing_files: Vec<String>,
    /// Check B: `(fingerprint, dbid)` of deleted mapping entries.
    pub stale_mappings: Vec<(String, u64)>,
    /// Check C: orphan files deleted.
    pub orphans_removed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty()
            && self.stale_mappings.is_empty()
            && self.orphans_removed.is_empty()
            && self.errors.is_empty()
    }

    pub fn fix_count(&self) -> usize {
        self.missing_files.len() + self.stale_mappings.len() + self.orphans_removed.len()
    }

    pub fn summary(&self) -> String {
        if self.is_clean() {
            return "Integrity check passed".to_string();
        }
        let mut parts = Vec::new();
        if !self.missing_files.is_empty() {
            parts.push(format!(
                "{} tracks dropped (file missing)",
                self.missing_files.len()
            ));
        }
        if !self.stale_mappings.is_empty() {
            parts.push(format!(
                "{} stale mapping entries removed",
                self.stale_mappings.len()
            ));
        }
        if !self.orphans_removed.is_empty() {
            parts.push(format!("{} orphan files removed", self.orphans_removed.len()));
        }
        if !self.errors.is_empty() {
            parts.push(format!("{} errors", self.errors.len()));
        }
        format!("Integrity repairs: {}", parts.join(", "))
    }
}

/// Run checks A, B, C. Mutates the working set and the mapping in place and
/// deletes orphan files from the device.
pub fn check_integrity(
    layout: &DeviceLayout,
    tracks: &mut Vec<Track>,
    mapping: &mut MappingFile,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    check_db_files(layout, tracks, &mut report);
    check_mapping_dbids(tracks, mapping, &mut report);
    check_orphans(layout, tracks, &mut report);

    if report.is_clean() {
        info!("integrity check passed");
    } else {
        info!(summary = %report.summary(), "integrity repairs applied");
    }
    report
}

/// Check A: drop tracks whose file is gone.
fn check_db_files(layout: &DeviceLayout, tracks: &mut Vec<Track>, report: &mut IntegrityReport) {
    tracks.retain(|track| {
        if track.location.is_empty() {
            return true;
        }
        let path = layout.resolve_location(&track.location);
        if path.exists() {
            true
        } else {
            warn!(title = %track.title, location = %track.location, "file missing, dropping track from working set");
            report
                .missing_files
                .push(format!("{} ({})", track.title, track.location));
            false
        }
    });
}

/// Check B: prune mapping entries pointing at vanished dbids.
fn check_mapping_dbids(tracks: &[Track], mapping: &mut MappingFile, report: &mut IntegrityReport) {
    let valid: HashSet<u64> = tracks.iter().map(|t| t.dbid).collect();

    let stale: Vec<(String, u64)> = mapping
        .tracks
        .iter()
        .flat_map(|(fp, entries)| {
            entries
                .iter()
                .filter(|e| !valid.contains(&e.dbid))
                .map(|e| (fp.clone(), e.dbid))
                .collect::<Vec<_>>()
        })
        .collect();

    for (fingerprint, dbid) in &stale {
        mapping.remove(fingerprint, *dbid);
        debug!(fingerprint = %fingerprint, dbid, "removed stale mapping entry");
    }
    report.stale_mappings = stale;
}

/// Check C: delete audio files under `Music/F*` that no track references.
fn check_orphans(layout: &DeviceLayout, tracks: &[Track], report: &mut IntegrityReport) {
    let music_dir = layout.music_dir();
    if !music_dir.exists() {
        return;
    }

    let referenced: HashSet<PathBuf> = tracks
        .iter()
        .filter(|t| !t.location.is_empty())
        .map(|t| layout.resolve_location(&t.location))
        .collect();

    for entry in WalkDir::new(&music_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();

        let parent_is_f_folder = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|name| {
                let name = name.to_string_lossy();
                let name: &str = name.as_ref();
                name.len() >= 2
                    && name.starts_with('F')
                    && name[1..].chars().all(|c| c.is_ascii_digit())
            })
            .unwrap_or(false);
        if !parent_is_f_folder {
            continue;
        }

        let is_audio = path
            .extension()
            .map(|ext| DEVICE_AUDIO_EXTS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        if !is_audio || referenced.contains(&path) {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted orphan file");
                report.orphans_removed.push(path);
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("failed to delete orphan {}: {e}", path.display()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingEntry;
    use std::fs;
    use tempfile::TempDir;

    fn entry(dbid: u64) -> MappingEntry {
        MappingEntry {
            dbid,
            album_key: "a".into(),
            source_path_hint: None,
            source_size: 1,
            source_mtime: 1,
            art_hash: None,
            source_format: "mp3".into(),
            ipod_format: "mp3".into(),
            was_transcoded: false,
            last_sync: 0,
        }
    }

    fn device_track(layout: &DeviceLayout, dbid: u64, name: &str) -> Track {
        let folder = layout.music_folder(0);
        fs::create_dir_all(&folder).unwrap();
        let path = folder.join(name);
        fs::write(&path, b"audio").unwrap();
        Track {
            dbid,
            title: name.to_string(),
            location: layout.location_for(&path).unwrap(),
            ..Track::default()
        }
    }

    #[test]
    fn all_three_checks_repair_and_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());

        let mut tracks = vec![
            device_track(&layout, 1, "KEEP.mp3"),
            Track {
                dbid: 2,
                title: "ghost".into(),
                location: ":iPod_Control:Music:F00:GONE.mp3".into(),
                ..Track::default()
            },
        ];

        let mut mapping = MappingFile::default();
        mapping.upsert("fp-keep", entry(1));
        mapping.upsert("fp-ghost", entry(2));
        mapping.upsert("fp-stale", entry(99));

        // Orphan audio file plus a non-audio file that must be left alone.
        let f07 = layout.music_folder(7);
        fs::create_dir_all(&f07).unwrap();
        fs::write(f07.join("ORPH.mp3"), b"x").unwrap();
        fs::write(f07.join("notes.txt"), b"x").unwrap();

        let report = check_integrity(&layout, &mut tracks, &mut mapping);

        assert_eq!(report.missing_files.len(), 1);
        // dbid 2's entry and dbid 99's entry are both stale after check A.
        assert_eq!(report.stale_mappings.len(), 2);
        assert_eq!(report.orphans_removed.len(), 1);
        assert_eq!(tracks.len(), 1);
        assert_eq!(mapping.entry_count(), 1);
        assert!(!f07.join("ORPH.mp3").exists());
        assert!(f07.join("notes.txt").exists());

        // Second run finds nothing.
        let second = check_integrity(&layout, &mut tracks, &mut mapping);
        assert!(second.is_clean());
    }
}
