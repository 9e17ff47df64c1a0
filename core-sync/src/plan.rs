//! Sync plan: the diff engine's output, read-only once handed to the
//! executor.

use crate::integrity::IntegrityReport;
use crate::mapping::MappingEntry;
use crate::pc_library::PcTrack;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One of the eight compared metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Title,
    Artist,
    Album,
    AlbumArtist,
    Genre,
    Year,
    TrackNumber,
    DiscNumber,
}

pub const METADATA_FIELDS: [MetadataField; 8] = [
    MetadataField::Title,
    MetadataField::Artist,
    MetadataField::Album,
    MetadataField::AlbumArtist,
    MetadataField::Genre,
    MetadataField::Year,
    MetadataField::TrackNumber,
    MetadataField::DiscNumber,
];

/// Copy a new PC recording onto the device.
#[derive(Debug, Clone)]
pub struct AddAction {
    pub pc: PcTrack,
    pub fingerprint: String,
    pub album_key: String,
}

/// Delete a device track whose source left the PC library.
#[derive(Debug, Clone)]
pub struct RemoveAction {
    pub fingerprint: String,
    pub entry: MappingEntry,
    pub description: String,
}

/// Re-copy a matched track whose source file content changed.
#[derive(Debug, Clone)]
pub struct UpdateFileAction {
    pub dbid: u64,
    pub pc: PcTrack,
    pub fingerprint: String,
}

/// Apply changed tag fields to a matched track.
#[derive(Debug, Clone)]
pub struct UpdateMetadataAction {
    pub dbid: u64,
    pub pc: PcTrack,
    pub changed_fields: Vec<MetadataField>,
    pub fingerprint: String,
}

/// Record a changed (or removed) artwork hash on the mapping.
#[derive(Debug, Clone)]
pub struct UpdateArtworkAction {
    pub dbid: u64,
    pub new_hash: Option<String>,
    pub fingerprint: String,
}

/// Fold device-side plays back (and optionally into the PC file's tags).
#[derive(Debug, Clone)]
pub struct PlayCountAction {
    pub dbid: u64,
    pub pc: PcTrack,
    pub delta: u32,
}

/// Apply the resolved rating (device wins) to the track and optionally the
/// PC file.
#[derive(Debug, Clone)]
pub struct RatingAction {
    pub dbid: u64,
    pub pc: PcTrack,
    pub resolved: u8,
}

/// Several PC files with identical audio on the same album; only the first
/// syncs.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub fingerprint: String,
    pub album_key: String,
    pub canonical: PathBuf,
    pub duplicates: Vec<PathBuf>,
}

/// Multiple mapping entries matched a group and no path hint broke the tie;
/// nothing is synced or removed for these until resolved.
#[derive(Debug, Clone)]
pub struct UnresolvedCollision {
    pub fingerprint: String,
    pub album_key: String,
    pub candidate_dbids: Vec<u64>,
    pub pc_path: PathBuf,
}

/// Byte totals of the planned work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSummary {
    pub bytes_to_add: u64,
    pub bytes_to_remove: u64,
    pub bytes_to_update: u64,
    pub net_change: i64,
}

/// Complete categorized plan for one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub to_add: Vec<AddAction>,
    pub to_remove: Vec<RemoveAction>,
    pub to_update_file: Vec<UpdateFileAction>,
    pub to_update_metadata: Vec<UpdateMetadataAction>,
    pub to_update_artwork: Vec<UpdateArtworkAction>,
    pub to_sync_play_counts: Vec<PlayCountAction>,
    pub to_sync_ratings: Vec<RatingAction>,

    // Informational sections.
    pub integrity: IntegrityReport,
    pub fingerprint_errors: Vec<(PathBuf, String)>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub unresolved_collisions: Vec<UnresolvedCollision>,
    /// dbids of matched tracks with no artwork on the device.
    pub missing_artwork: Vec<u64>,
    /// When set, stage 7 rebuilds the whole ArtworkDB.
    pub rewrite_artwork: bool,

    /// dbid → PC source path for every matched track (artwork extraction).
    pub matched_paths: HashMap<u64, PathBuf>,

    pub total_pc_tracks: usize,
    pub total_device_tracks: usize,
    pub matched_tracks: usize,

    pub storage: StorageSummary,
}

impl SyncPlan {
    /// True when the executor would change nothing.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_remove.is_empty()
            && self.to_update_file.is_empty()
            && self.to_update_metadata.is_empty()
            && self.to_update_artwork.is_empty()
            && self.to_sync_play_counts.is_empty()
            && self.to_sync_ratings.is_empty()
            && !self.rewrite_artwork
    }

    /// One-line-per-category human summary.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if !self.to_add.is_empty() {
            lines.push(format!(
                "{} tracks to add ({})",
                self.to_add.len(),
                format_bytes(self.storage.bytes_to_add)
            ));
        }
        if !self.to_remove.is_empty() {
            lines.push(format!(
                "{} tracks to remove ({})",
                self.to_remove.len(),
                format_bytes(self.storage.bytes_to_remove)
            ));
        }
        if !self.to_update_file.is_empty() {
            lines.push(format!(
                "{} tracks to re-copy ({})",
                self.to_update_file.len(),
                format_bytes(self.storage.bytes_to_update)
            ));
        }
        if !self.to_update_metadata.is_empty() {
            lines.push(format!(
                "{} tracks with metadata updates",
                self.to_update_metadata.len()
            ));
        }
        if !self.to_update_artwork.is_empty() {
            lines.push(format!(
                "{} tracks with artwork changes",
                self.to_update_artwork.len()
            ));
        }
        if !self.to_sync_play_counts.is_empty() {
            lines.push(format!(
                "{} tracks with new play counts",
                self.to_sync_play_counts.len()
            ));
        }
        if !self.to_sync_ratings.is_empty() {
            lines.push(format!(
                "{} tracks with rating changes",
                self.to_sync_ratings.len()
            ));
        }
        if !self.missing_artwork.is_empty() {
            lines.push(format!(
                "{} tracks missing album art",
                self.missing_artwork.len()
            ));
        }
        if !self.duplicate_groups.is_empty() {
            lines.push(format!(
                "{} duplicate groups skipped",
                self.duplicate_groups.len()
            ));
        }
        if !self.unresolved_collisions.is_empty() {
            lines.push(format!(
                "{} unresolved collisions",
                self.unresolved_collisions.len()
            ));
        }
        if !self.fingerprint_errors.is_empty() {
            lines.push(format!(
                "{} files could not be fingerprinted",
                self.fingerprint_errors.len()
            ));
        }

        if lines.is_empty() {
            "Everything is in sync".to_string()
        } else {
            format!(
                "Sync plan ({} matched, {} PC, {} device):\n  {}",
                self.matched_tracks,
                self.total_pc_tracks,
                self.total_device_tracks,
                lines.join("\n  ")
            )
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KiB", "MiB", "GiB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TiB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_plan_reports_in_sync() {
        let plan = SyncPlan::default();
        assert!(plan.is_empty());
        assert_eq!(plan.summary(), "Everything is in sync");
    }

    #[test]
    fn bytes_format() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MiB");
    }
}
