//! Diff engine: turns the scanned PC library, the device working set, and
//! the mapping into a categorized [`SyncPlan`].
//!
//! Identity is the pair `(fingerprint, album_key)`: the fingerprint
//! survives re-tagging, renaming, and re-encoding; the album key separates
//! the same recording on different albums. Matching claims mapping entries
//! so each device track is matched at most once per run.

use crate::integrity::IntegrityReport;
use crate::mapping::MappingFile;
use crate::pc_library::PcTrack;
use crate::plan::{
    AddAction, DuplicateGroup, MetadataField, PlayCountAction, RatingAction, RemoveAction,
    StorageSummary, SyncPlan, UnresolvedCollision, UpdateArtworkAction, UpdateFileAction,
    UpdateMetadataAction, METADATA_FIELDS,
};
use core_db::record::Track;
use core_db::Database;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument, warn};

/// File-change threshold: the size delta must exceed both 1% of the mapped
/// size and 10 KiB, and the mtime must differ.
fn file_changed(pc_size: u64, pc_mtime: i64, mapped_size: u64, mapped_mtime: i64) -> bool {
    let delta = pc_size.abs_diff(mapped_size);
    let threshold = (mapped_size / 100).max(10 * 1024);
    delta > threshold && pc_mtime != mapped_mtime
}

fn text_differs(pc: Option<&str>, device: Option<&str>) -> bool {
    let normalize = |s: Option<&str>| s.unwrap_or("").trim().to_lowercase();
    normalize(pc) != normalize(device)
}

/// The eight compared fields, evaluated independently.
fn changed_fields(pc: &PcTrack, device: &Track) -> Vec<MetadataField> {
    let meta = &pc.metadata;
    let mut changed = Vec::new();
    for field in METADATA_FIELDS {
        let differs = match field {
            MetadataField::Title => text_differs(meta.title.as_deref(), Some(&device.title)),
            MetadataField::Artist => text_differs(meta.artist.as_deref(), device.artist.as_deref()),
            MetadataField::Album => text_differs(meta.album.as_deref(), device.album.as_deref()),
            MetadataField::AlbumArtist => {
                text_differs(meta.album_artist.as_deref(), device.album_artist.as_deref())
            }
            MetadataField::Genre => text_differs(meta.genre.as_deref(), device.genre.as_deref()),
            MetadataField::Year => meta.year.unwrap_or(0) != device.year,
            MetadataField::TrackNumber => meta.track_number.unwrap_or(0) != device.track_number,
            MetadataField::DiscNumber => {
                // Absent disc numbers read as the device default of 1.
                meta.disc_number.unwrap_or(1) != device.disc_number
            }
        };
        if differs {
            changed.push(field);
        }
    }
    changed
}

/// Compute the plan. The working set and mapping must already be through
/// the integrity pass; its report rides along on the plan.
#[instrument(skip_all, fields(pc_tracks = pc_tracks.len(), device_tracks = db.tracks.len()))]
pub fn compute_plan(
    pc_tracks: &[PcTrack],
    db: &Database,
    mapping: &MappingFile,
    integrity: IntegrityReport,
    fingerprint_errors: Vec<(std::path::PathBuf, String)>,
) -> SyncPlan {
    let mut plan = SyncPlan {
        integrity,
        fingerprint_errors,
        total_pc_tracks: pc_tracks.len(),
        total_device_tracks: db.tracks.len(),
        ..SyncPlan::default()
    };

    // Group PC tracks by identity; the first file in a group is canonical.
    let mut groups: BTreeMap<(String, String), Vec<&PcTrack>> = BTreeMap::new();
    for track in pc_tracks {
        groups
            .entry((track.fingerprint.clone(), track.album_key()))
            .or_default()
            .push(track);
    }

    // Claimed (fingerprint, dbid) pairs; frozen ones belong to unresolved
    // collisions and are exempt from removal.
    let mut claimed: HashSet<(String, u64)> = HashSet::new();
    let mut frozen: HashSet<(String, u64)> = HashSet::new();
    // dbid → whether the matched PC file carries embedded art.
    let mut matched_pc_art: std::collections::HashMap<u64, bool> =
        std::collections::HashMap::new();

    for ((fingerprint, album_key), group) in &groups {
        let canonical = group[0];
        if group.len() > 1 {
            plan.duplicate_groups.push(DuplicateGroup {
                fingerprint: fingerprint.clone(),
                album_key: album_key.clone(),
                canonical: canonical.path.clone(),
                duplicates: group[1..].iter().map(|t| t.path.clone()).collect(),
            });
            debug!(
                fingerprint = %fingerprint,
                extra = group.len() - 1,
                "true duplicates skipped"
            );
        }

        let entries = mapping.entries(fingerprint);
        let unclaimed: Vec<_> = entries
            .iter()
            .filter(|e| {
                e.album_key == *album_key && !claimed.contains(&(fingerprint.clone(), e.dbid))
            })
            .collect();

        let matched_entry = match unclaimed.len() {
            0 => {
                // Unknown recording, or a known recording on a new album.
                plan.to_add.push(AddAction {
                    pc: canonical.clone(),
                    fingerprint: fingerprint.clone(),
                    album_key: album_key.clone(),
                });
                plan.storage.bytes_to_add += canonical.size;
                continue;
            }
            1 => unclaimed[0],
            _ => {
                // Path hint breaks the tie; otherwise report and freeze.
                match unclaimed
                    .iter()
                    .find(|e| e.source_path_hint.as_deref() == Some(&canonical.relative_path))
                {
                    Some(entry) => *entry,
                    None => {
                        warn!(fingerprint = %fingerprint, album_key = %album_key, "unresolved mapping collision");
                        for entry in &unclaimed {
                            frozen.insert((fingerprint.clone(), entry.dbid));
                        }
                        plan.unresolved_collisions.push(UnresolvedCollision {
                            fingerprint: fingerprint.clone(),
                            album_key: album_key.clone(),
                            candidate_dbids: unclaimed.iter().map(|e| e.dbid).collect(),
                            pc_path: canonical.path.clone(),
                        });
                        continue;
                    }
                }
            }
        };

        claimed.insert((fingerprint.clone(), matched_entry.dbid));
        plan.matched_tracks += 1;

        let Some(device_track) = db.track_by_dbid(matched_entry.dbid) else {
            // The integrity pass removes these; a fresh add heals it anyway.
            warn!(dbid = matched_entry.dbid, "mapping entry without device track, re-adding");
            plan.to_add.push(AddAction {
                pc: canonical.clone(),
                fingerprint: fingerprint.clone(),
                album_key: album_key.clone(),
            });
            plan.storage.bytes_to_add += canonical.size;
            continue;
        };

        plan.matched_paths
            .insert(matched_entry.dbid, canonical.path.clone());
        matched_pc_art.insert(matched_entry.dbid, canonical.art_hash.is_some());

        // Change detection: each aspect evaluated independently.
        if file_changed(
            canonical.size,
            canonical.mtime,
            matched_entry.source_size,
            matched_entry.source_mtime,
        ) {
            plan.to_update_file.push(UpdateFileAction {
                dbid: matched_entry.dbid,
                pc: canonical.clone(),
                fingerprint: fingerprint.clone(),
            });
            plan.storage.bytes_to_update += canonical.size;
        }

        let fields = changed_fields(canonical, device_track);
        if !fields.is_empty() {
            plan.to_update_metadata.push(UpdateMetadataAction {
                dbid: matched_entry.dbid,
                pc: canonical.clone(),
                changed_fields: fields,
                fingerprint: fingerprint.clone(),
            });
        }

        if canonical.art_hash != matched_entry.art_hash {
            plan.to_update_artwork.push(UpdateArtworkAction {
                dbid: matched_entry.dbid,
                new_hash: canonical.art_hash.clone(),
                fingerprint: fingerprint.clone(),
            });
        }

        if device_track.play_count_2 > 0 {
            plan.to_sync_play_counts.push(PlayCountAction {
                dbid: matched_entry.dbid,
                pc: canonical.clone(),
                delta: device_track.play_count_2,
            });
        }

        let pc_rating = canonical.rating();
        if device_track.rating != pc_rating && (device_track.rating > 0 || pc_rating > 0) {
            // Device wins: it holds the most recent listening behavior.
            plan.to_sync_ratings.push(RatingAction {
                dbid: matched_entry.dbid,
                pc: canonical.clone(),
                resolved: device_track.rating,
            });
        }
    }

    // Every mapping entry neither claimed nor frozen is a removal.
    for (fingerprint, entries) in &mapping.tracks {
        for entry in entries {
            let key = (fingerprint.clone(), entry.dbid);
            if claimed.contains(&key) || frozen.contains(&key) {
                continue;
            }
            let description = db
                .track_by_dbid(entry.dbid)
                .map(|t| {
                    format!(
                        "{} - {}",
                        t.artist.as_deref().unwrap_or("Unknown"),
                        t.title
                    )
                })
                .unwrap_or_else(|| format!("dbid {:#x}", entry.dbid));
            if let Some(track) = db.track_by_dbid(entry.dbid) {
                plan.storage.bytes_to_remove += track.size as u64;
            }
            plan.to_remove.push(RemoveAction {
                fingerprint: fingerprint.clone(),
                entry: entry.clone(),
                description,
            });
        }
    }

    // Matched tracks with no art on the device, where the PC file has art
    // to supply, trigger a full ArtworkDB rewrite (image records cannot be
    // patched in place).
    for dbid in plan.matched_paths.keys() {
        if !matched_pc_art.get(dbid).copied().unwrap_or(false) {
            continue;
        }
        if let Some(track) = db.track_by_dbid(*dbid) {
            if track.artwork_count == 0 || track.mhii_link == 0 {
                plan.missing_artwork.push(*dbid);
            }
        }
    }
    plan.missing_artwork.sort_unstable();
    if !plan.missing_artwork.is_empty() {
        plan.rewrite_artwork = true;
    }

    plan.storage.net_change = plan.storage.bytes_to_add as i64
        + plan.storage.bytes_to_update as i64
        - plan.storage.bytes_to_remove as i64;

    info!(
        add = plan.to_add.len(),
        remove = plan.to_remove.len(),
        update_file = plan.to_update_file.len(),
        update_metadata = plan.to_update_metadata.len(),
        update_artwork = plan.to_update_artwork.len(),
        play_counts = plan.to_sync_play_counts.len(),
        ratings = plan.to_sync_ratings.len(),
        collisions = plan.unresolved_collisions.len(),
        "plan computed"
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingEntry;
    use bridge_traits::AudioMetadata;
    use std::path::PathBuf;

    fn pc_track(fingerprint: &str, album: &str, title: &str, path: &str) -> PcTrack {
        PcTrack {
            path: PathBuf::from(path),
            relative_path: path.trim_start_matches('/').to_string(),
            extension: "mp3".into(),
            size: 5_000_000,
            mtime: 1_700_000_000,
            metadata: AudioMetadata {
                title: Some(title.to_string()),
                artist: Some("Artist".to_string()),
                album: Some(album.to_string()),
                duration_ms: 200_000,
                ..AudioMetadata::default()
            },
            fingerprint: fingerprint.to_string(),
            art_hash: None,
        }
    }

    fn entry(dbid: u64, album_key: &str, size: u64, mtime: i64) -> MappingEntry {
        MappingEntry {
            dbid,
            album_key: album_key.to_string(),
            source_path_hint: None,
            source_size: size,
            source_mtime: mtime,
            art_hash: None,
            source_format: "mp3".into(),
            ipod_format: "mp3".into(),
            was_transcoded: false,
            last_sync: 0,
        }
    }

    fn device_track(dbid: u64, title: &str, album: &str) -> Track {
        Track {
            dbid,
            track_id: 1,
            title: title.to_string(),
            artist: Some("Artist".to_string()),
            album: Some(album.to_string()),
            mhii_link: 1,
            artwork_count: 1,
            ..Track::default()
        }
    }

    fn plan_for(
        pc: &[PcTrack],
        tracks: Vec<Track>,
        mapping: &MappingFile,
    ) -> SyncPlan {
        let db = Database {
            tracks,
            ..Database::default()
        };
        compute_plan(pc, &db, mapping, IntegrityReport::default(), Vec::new())
    }

    #[test]
    fn unknown_fingerprint_is_an_add() {
        let pc = [pc_track("fp-new", "Album", "Song", "/lib/song.mp3")];
        let plan = plan_for(&pc, vec![], &MappingFile::default());
        assert_eq!(plan.to_add.len(), 1);
        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.storage.bytes_to_add, 5_000_000);
    }

    #[test]
    fn same_recording_on_second_album_is_an_album_variant_add() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp", entry(1, "studio", 5_000_000, 1_700_000_000));

        let pc = [
            pc_track("fp", "Studio", "Song", "/lib/studio/song.flac"),
            pc_track("fp", "Greatest Hits", "Song", "/lib/hits/song.m4a"),
        ];
        let plan = plan_for(&pc, vec![device_track(1, "Song", "Studio")], &mapping);

        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_add[0].album_key, "greatest hits");
        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.matched_tracks, 1);
    }

    #[test]
    fn unchanged_matched_library_yields_empty_plan() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp", entry(1, "album", 5_000_000, 1_700_000_000));
        let pc = [pc_track("fp", "Album", "Song", "/lib/song.mp3")];
        let plan = plan_for(&pc, vec![device_track(1, "Song", "Album")], &mapping);
        assert!(plan.is_empty(), "plan: {}", plan.summary());
    }

    #[test]
    fn retag_emits_only_metadata_update_with_changed_fields() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp", entry(1, "album", 5_000_000, 1_700_000_000));
        let pc = [pc_track("fp", "Album", "New Title", "/lib/song.mp3")];
        let plan = plan_for(&pc, vec![device_track(1, "Old Title", "Album")], &mapping);

        assert!(plan.to_update_file.is_empty());
        assert_eq!(plan.to_update_metadata.len(), 1);
        assert_eq!(
            plan.to_update_metadata[0].changed_fields,
            vec![MetadataField::Title]
        );
    }

    #[test]
    fn file_change_requires_both_size_and_mtime() {
        // Size delta above threshold but identical mtime: not a change.
        assert!(!file_changed(6_000_000, 100, 5_000_000, 100));
        // mtime differs but delta below max(1%, 10 KiB): not a change.
        assert!(!file_changed(5_004_000, 200, 5_000_000, 100));
        // Both: change.
        assert!(file_changed(6_000_000, 200, 5_000_000, 100));
        // Threshold floor is 10 KiB for small files.
        assert!(!file_changed(105_000, 200, 100_000, 100));
        assert!(file_changed(120_000, 200, 100_000, 100));
    }

    #[test]
    fn removed_pc_file_emits_remove_per_entry() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp-gone", entry(1, "album", 1, 1));
        mapping.upsert("fp-gone", entry(2, "other album", 1, 1));

        let plan = plan_for(
            &[],
            vec![device_track(1, "A", "Album"), device_track(2, "A", "Other")],
            &mapping,
        );
        assert_eq!(plan.to_remove.len(), 2);
    }

    #[test]
    fn collision_without_hint_freezes_entries() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp", entry(1, "album", 1, 1));
        mapping.upsert("fp", entry(2, "album", 1, 1));

        let pc = [pc_track("fp", "Album", "Song", "/lib/song.mp3")];
        let plan = plan_for(
            &pc,
            vec![device_track(1, "Song", "Album"), device_track(2, "Song", "Album")],
            &mapping,
        );

        assert_eq!(plan.unresolved_collisions.len(), 1);
        assert!(plan.to_add.is_empty());
        // Frozen entries are exempt from removal.
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn collision_resolved_by_path_hint() {
        let mut mapping = MappingFile::default();
        let mut first = entry(1, "album", 5_000_000, 1_700_000_000);
        first.source_path_hint = Some("lib/song.mp3".to_string());
        let mut second = entry(2, "album", 5_000_000, 1_700_000_000);
        second.source_path_hint = Some("lib/elsewhere.mp3".to_string());
        mapping.upsert("fp", first);
        mapping.upsert("fp", second);

        let pc = [pc_track("fp", "Album", "Song", "/lib/song.mp3")];
        let plan = plan_for(
            &pc,
            vec![device_track(1, "Song", "Album"), device_track(2, "Song", "Album")],
            &mapping,
        );

        assert!(plan.unresolved_collisions.is_empty());
        assert_eq!(plan.matched_tracks, 1);
        // The unmatched twin is removed.
        assert_eq!(plan.to_remove.len(), 1);
        assert_eq!(plan.to_remove[0].entry.dbid, 2);
    }

    #[test]
    fn play_count_and_rating_come_from_the_device() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp", entry(1, "album", 5_000_000, 1_700_000_000));

        let mut device = device_track(1, "Song", "Album");
        device.play_count_2 = 3;
        device.rating = 80;

        let pc = [pc_track("fp", "Album", "Song", "/lib/song.mp3")];
        let plan = plan_for(&pc, vec![device], &mapping);

        assert_eq!(plan.to_sync_play_counts.len(), 1);
        assert_eq!(plan.to_sync_play_counts[0].delta, 3);
        assert_eq!(plan.to_sync_ratings.len(), 1);
        assert_eq!(plan.to_sync_ratings[0].resolved, 80);
    }

    #[test]
    fn missing_artwork_flags_full_rewrite() {
        let mut mapping = MappingFile::default();
        let mut mapped = entry(1, "album", 5_000_000, 1_700_000_000);
        mapped.art_hash = Some("cafe".into());
        mapping.upsert("fp", mapped);

        let mut device = device_track(1, "Song", "Album");
        device.mhii_link = 0;
        device.artwork_count = 0;

        let mut pc = pc_track("fp", "Album", "Song", "/lib/song.mp3");
        pc.art_hash = Some("cafe".into());
        let plan = plan_for(&[pc], vec![device], &mapping);

        assert_eq!(plan.missing_artwork, vec![1]);
        assert!(plan.rewrite_artwork);
        // The hash is unchanged, so no artwork-mapping action.
        assert!(plan.to_update_artwork.is_empty());
    }

    #[test]
    fn artless_matched_track_does_not_flag_artwork_rewrite() {
        let mut mapping = MappingFile::default();
        mapping.upsert("fp", entry(1, "album", 5_000_000, 1_700_000_000));

        let mut device = device_track(1, "Song", "Album");
        device.mhii_link = 0;
        device.artwork_count = 0;

        let pc = [pc_track("fp", "Album", "Song", "/lib/song.mp3")];
        let plan = plan_for(&pc, vec![device], &mapping);

        assert!(plan.missing_artwork.is_empty());
        assert!(!plan.rewrite_artwork);
        assert!(plan.is_empty());
    }

    #[test]
    fn duplicates_are_reported_and_only_first_considered() {
        let pc = [
            pc_track("fp", "Album", "Song", "/lib/a.mp3"),
            pc_track("fp", "Album", "Song copy", "/lib/b.mp3"),
        ];
        let plan = plan_for(&pc, vec![], &MappingFile::default());
        assert_eq!(plan.duplicate_groups.len(), 1);
        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_add[0].pc.path, PathBuf::from("/lib/a.mp3"));
    }
}
