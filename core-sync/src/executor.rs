//! Sync executor: runs a [`SyncPlan`] as seven ordered stages over the
//! in-memory working set.
//!
//! Nothing is persisted before stage 7: the codec and signer run exactly
//! once at the end, the database is replaced atomically with a backup of
//! its predecessor, and only then is the mapping saved. A failure or
//! cancellation anywhere earlier leaves both the database and the mapping
//! at their pre-sync contents; stray file mutations from stages 1-4 are
//! healed by the next run's integrity pass.
//!
//! The cancellation flag is polled between items; work in flight completes
//! normally.

use crate::coordinator::SyncOptions;
use crate::error::{Result, SyncError};
use crate::mapping::{MappingEntry, MappingFile, MappingStore};
use crate::pc_library::PcTrack;
use crate::plan::SyncPlan;
use crate::transcode::{target_for, TranscodeCache, TranscodeTarget, Transcoder};
use bridge_traits::{DeviceStorage, ImageEncoder, MetadataProvider, RatingTag};
use core_db::artwork::{ArtworkSource, ArtworkWriter};
use core_db::record::{media_type, Track};
use core_db::{generate_dbid, signer, writer, Database};
use core_device::{
    backup_and_replace, detect_checksum_kind, ChecksumKind, DeviceLayout, HashInfo, SysInfo,
    MUSIC_FOLDER_COUNT,
};
use core_runtime::{CancelFlag, EventBus, SyncEvent, SyncStage};
use rand::Rng;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

/// What one execute run did.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub added: usize,
    pub removed: usize,
    pub files_updated: usize,
    pub metadata_updated: usize,
    pub artwork_updated: usize,
    pub play_counts_synced: usize,
    pub ratings_synced: usize,
    /// Unique images written to the ArtworkDB (zero when not rewritten).
    pub artwork_images: usize,
    /// Size of the emitted database.
    pub database_bytes: usize,
    /// Per-item failures that did not abort the run.
    pub skipped: Vec<(String, String)>,
}

impl SyncOutcome {
    pub fn has_errors(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// A stage-4 add waiting for its writer-assigned ids.
#[derive(Debug)]
struct PendingAdd {
    track_index: usize,
    fingerprint: String,
    album_key: String,
    source_path: PathBuf,
    source_path_hint: String,
    source_size: u64,
    source_mtime: i64,
    art_hash: Option<String>,
    source_format: String,
    ipod_format: String,
    was_transcoded: bool,
}

/// A file landed on the device by copy or transcode.
#[derive(Debug)]
struct CopiedFile {
    location: String,
    size: u64,
    filetype: String,
    was_transcoded: bool,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct SyncExecutor<'a> {
    layout: &'a DeviceLayout,
    provider: &'a dyn MetadataProvider,
    encoder: &'a dyn ImageEncoder,
    storage: &'a dyn DeviceStorage,
    options: &'a SyncOptions,
    events: &'a EventBus,
    cancel: &'a CancelFlag,
    transcoder: Transcoder,
    cache: TranscodeCache,
    folder_counter: u32,
}

impl<'a> SyncExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: &'a DeviceLayout,
        provider: &'a dyn MetadataProvider,
        encoder: &'a dyn ImageEncoder,
        storage: &'a dyn DeviceStorage,
        options: &'a SyncOptions,
        events: &'a EventBus,
        cancel: &'a CancelFlag,
    ) -> Result<Self> {
        let cache = TranscodeCache::open(options.cache_dir())?;
        let transcoder =
            Transcoder::locate(Duration::from_secs(options.transcode_timeout_secs));
        Ok(Self {
            layout,
            provider,
            encoder,
            storage,
            options,
            events,
            cancel,
            transcoder,
            cache,
            folder_counter: 0,
        })
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.events.emit(SyncEvent::Cancelled);
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn stage_start(&self, stage: SyncStage, total: usize) {
        self.events.emit(SyncEvent::StageStarted { stage, total });
    }

    fn progress(&self, stage: SyncStage, current: usize, total: usize, item: &str) {
        self.events.emit(SyncEvent::Progress {
            stage,
            current,
            total,
            item: item.to_string(),
        });
    }

    fn stage_done(&self, stage: SyncStage) {
        self.events.emit(SyncEvent::StageFinished { stage });
    }

    /// Run the plan. The plan is read-only; the working set, the mapping,
    /// and the device are mutated.
    #[instrument(skip_all)]
    pub fn execute(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        mapping: &mut MappingFile,
        store: &MappingStore,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        self.preflight(plan)?;

        self.stage_remove(plan, db, mapping, &mut outcome)?;
        self.stage_update_files(plan, db, mapping, &mut outcome)?;
        self.stage_update_metadata(plan, db, mapping, &mut outcome)?;
        self.stage_update_artwork_mapping(plan, mapping, &mut outcome)?;
        let pending = self.stage_add(plan, db, &mut outcome)?;
        self.stage_play_counts(plan, db, &mut outcome)?;
        self.stage_ratings(plan, db, &mut outcome)?;
        self.stage_write(plan, db, mapping, store, &pending, &mut outcome)?;

        info!(
            added = outcome.added,
            removed = outcome.removed,
            files_updated = outcome.files_updated,
            skipped = outcome.skipped.len(),
            "sync executed"
        );
        Ok(outcome)
    }

    /// Adds require headroom: the bytes arriving minus the bytes leaving,
    /// plus a safety margin.
    fn preflight(&self, plan: &SyncPlan) -> Result<()> {
        if plan.to_add.is_empty() {
            return Ok(());
        }
        let required = plan
            .storage
            .bytes_to_add
            .saturating_sub(plan.storage.bytes_to_remove)
            + self.options.free_space_margin_bytes;
        let available = self.storage.free_bytes(self.layout.root())?;
        if available < required {
            return Err(SyncError::StorageInsufficient {
                required,
                available,
            });
        }
        Ok(())
    }

    // Stage 1: removals, then mapping entries orphaned by them.
    fn stage_remove(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        mapping: &mut MappingFile,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        if plan.to_remove.is_empty() {
            return Ok(());
        }
        let total = plan.to_remove.len();
        self.stage_start(SyncStage::Remove, total);

        for (i, action) in plan.to_remove.iter().enumerate() {
            self.check_cancel()?;
            self.progress(SyncStage::Remove, i + 1, total, &action.description);

            if let Some(track) = db.remove_track(action.entry.dbid) {
                if !track.location.is_empty() {
                    let path = self.layout.resolve_location(&track.location);
                    if path.exists() {
                        if let Err(e) = fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "could not delete file");
                            outcome
                                .skipped
                                .push((action.description.clone(), e.to_string()));
                        }
                    }
                }
            }
            mapping.remove(&action.fingerprint, action.entry.dbid);
            outcome.removed += 1;
        }

        let live: HashSet<u64> = db.tracks.iter().map(|t| t.dbid).collect();
        let pruned = mapping.retain_dbids(|dbid| live.contains(&dbid));
        if pruned > 0 {
            debug!(pruned, "mapping entries orphaned by removals pruned");
        }

        self.stage_done(SyncStage::Remove);
        Ok(())
    }

    // Stage 2: re-copy matched tracks whose source content changed.
    fn stage_update_files(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        mapping: &mut MappingFile,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        if plan.to_update_file.is_empty() {
            return Ok(());
        }
        let total = plan.to_update_file.len();
        self.stage_start(SyncStage::UpdateFile, total);

        for (i, action) in plan.to_update_file.iter().enumerate() {
            self.check_cancel()?;
            self.progress(SyncStage::UpdateFile, i + 1, total, &action.pc.describe());

            let old_location = match db.track_by_dbid(action.dbid) {
                Some(track) => track.location.clone(),
                None => {
                    outcome
                        .skipped
                        .push((action.pc.describe(), "track not in working set".into()));
                    continue;
                }
            };
            if !old_location.is_empty() {
                let old_path = self.layout.resolve_location(&old_location);
                if old_path.exists() {
                    let _ = fs::remove_file(&old_path);
                }
            }

            // The source content changed, so cached transcodes are stale.
            self.cache.invalidate(&action.fingerprint);

            let copied = match self.copy_to_device(&action.pc, &action.fingerprint) {
                Ok(copied) => copied,
                Err(e) => {
                    warn!(error = %e, "re-copy failed");
                    outcome.skipped.push((action.pc.describe(), e.to_string()));
                    continue;
                }
            };

            let meta = &action.pc.metadata;
            if let Some(track) = db.track_by_dbid_mut(action.dbid) {
                track.location = copied.location.clone();
                track.size = copied.size as u32;
                track.filetype = copied.filetype.clone();
                track.bitrate = meta.bitrate.unwrap_or(track.bitrate);
                track.sample_rate = meta.sample_rate.unwrap_or(track.sample_rate);
                track.duration_ms = meta.duration_ms as u32;
                track.vbr = false;
            }
            if let Some(entry) = mapping.entry_by_dbid_mut(action.dbid) {
                entry.source_size = action.pc.size;
                entry.source_mtime = action.pc.mtime;
                entry.source_format = action.pc.extension.clone();
                entry.ipod_format = copied.filetype.clone();
                entry.was_transcoded = copied.was_transcoded;
                entry.source_path_hint = Some(action.pc.relative_path.clone());
                entry.last_sync = now_unix();
            }
            outcome.files_updated += 1;
        }

        self.stage_done(SyncStage::UpdateFile);
        Ok(())
    }

    // Stage 3: apply changed tag fields; refresh the mapping's size/mtime
    // so tag-only edits don't read as file changes next run.
    fn stage_update_metadata(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        mapping: &mut MappingFile,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        if plan.to_update_metadata.is_empty() {
            return Ok(());
        }
        let total = plan.to_update_metadata.len();
        self.stage_start(SyncStage::UpdateMetadata, total);

        for (i, action) in plan.to_update_metadata.iter().enumerate() {
            self.check_cancel()?;
            self.progress(
                SyncStage::UpdateMetadata,
                i + 1,
                total,
                &action.pc.describe(),
            );

            let meta = &action.pc.metadata;
            if let Some(track) = db.track_by_dbid_mut(action.dbid) {
                use crate::plan::MetadataField::*;
                for field in &action.changed_fields {
                    match field {
                        Title => track.title = action.pc.title_or_filename(),
                        Artist => track.artist = meta.artist.clone(),
                        Album => track.album = meta.album.clone(),
                        AlbumArtist => track.album_artist = meta.album_artist.clone(),
                        Genre => track.genre = meta.genre.clone(),
                        Year => track.year = meta.year.unwrap_or(0),
                        TrackNumber => track.track_number = meta.track_number.unwrap_or(0),
                        DiscNumber => track.disc_number = meta.disc_number.unwrap_or(1),
                    }
                }
                outcome.metadata_updated += 1;
            }
            if let Some(entry) = mapping.entry_by_dbid_mut(action.dbid) {
                entry.source_size = action.pc.size;
                entry.source_mtime = action.pc.mtime;
                entry.album_key = action.pc.album_key();
                entry.last_sync = now_unix();
            }
        }

        self.stage_done(SyncStage::UpdateMetadata);
        Ok(())
    }

    // Stage 3b: record new artwork hashes on the mapping.
    fn stage_update_artwork_mapping(
        &mut self,
        plan: &SyncPlan,
        mapping: &mut MappingFile,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        for action in &plan.to_update_artwork {
            self.check_cancel()?;
            if let Some(entry) = mapping.entry_by_dbid_mut(action.dbid) {
                entry.art_hash = action.new_hash.clone();
                entry.last_sync = now_unix();
                outcome.artwork_updated += 1;
            }
        }
        Ok(())
    }

    // Stage 4: copy new tracks over and queue their mapping entries for
    // the post-write dbid backpatch.
    fn stage_add(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        outcome: &mut SyncOutcome,
    ) -> Result<Vec<PendingAdd>> {
        let mut pending = Vec::new();
        if plan.to_add.is_empty() {
            return Ok(pending);
        }
        let total = plan.to_add.len();
        self.stage_start(SyncStage::Add, total);

        for (i, action) in plan.to_add.iter().enumerate() {
            self.check_cancel()?;
            self.progress(SyncStage::Add, i + 1, total, &action.pc.describe());

            let copied = match self.copy_to_device(&action.pc, &action.fingerprint) {
                Ok(copied) => copied,
                Err(e) => {
                    warn!(error = %e, "add failed");
                    outcome.skipped.push((action.pc.describe(), e.to_string()));
                    continue;
                }
            };

            let track = track_from_pc(&action.pc, &copied);
            db.tracks.push(track);

            pending.push(PendingAdd {
                track_index: db.tracks.len() - 1,
                fingerprint: action.fingerprint.clone(),
                album_key: action.album_key.clone(),
                source_path: action.pc.path.clone(),
                source_path_hint: action.pc.relative_path.clone(),
                source_size: action.pc.size,
                source_mtime: action.pc.mtime,
                art_hash: action.pc.art_hash.clone(),
                source_format: action.pc.extension.clone(),
                ipod_format: copied.filetype.clone(),
                was_transcoded: copied.was_transcoded,
            });
            outcome.added += 1;
        }

        self.stage_done(SyncStage::Add);
        Ok(pending)
    }

    // Stage 5: fold plays-since-sync into the cumulative count; optionally
    // write the new totals back to the PC files.
    fn stage_play_counts(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        if !plan.to_sync_play_counts.is_empty() {
            let total = plan.to_sync_play_counts.len();
            self.stage_start(SyncStage::PlayCounts, total);

            for (i, action) in plan.to_sync_play_counts.iter().enumerate() {
                self.check_cancel()?;
                self.progress(SyncStage::PlayCounts, i + 1, total, &action.pc.describe());

                if self.options.write_back_play_counts {
                    let new_total = db
                        .track_by_dbid(action.dbid)
                        .map(|t| t.play_count + t.play_count_2)
                        .unwrap_or(action.delta);
                    if let Err(e) = self.provider.write_play_count(&action.pc.path, new_total) {
                        warn!(path = %action.pc.path.display(), error = %e, "play-count write-back failed");
                        outcome.skipped.push((action.pc.describe(), e.to_string()));
                    }
                }
                outcome.play_counts_synced += 1;
            }
            self.stage_done(SyncStage::PlayCounts);
        }

        // Every emitted track has its since-sync counter folded and reset.
        for track in db.tracks.iter_mut() {
            if track.play_count_2 > 0 {
                track.play_count += track.play_count_2;
                track.play_count_2 = 0;
            }
        }
        Ok(())
    }

    // Stage 6: apply resolved ratings (device wins); optional write-back in
    // the container-appropriate tag.
    fn stage_ratings(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        if plan.to_sync_ratings.is_empty() {
            return Ok(());
        }
        let total = plan.to_sync_ratings.len();
        self.stage_start(SyncStage::Ratings, total);

        for (i, action) in plan.to_sync_ratings.iter().enumerate() {
            self.check_cancel()?;
            self.progress(SyncStage::Ratings, i + 1, total, &action.pc.describe());

            if let Some(track) = db.track_by_dbid_mut(action.dbid) {
                track.rating = action.resolved;
            }
            if self.options.write_back_ratings {
                if let Some(tag) = RatingTag::for_extension(&action.pc.extension, action.resolved)
                {
                    if let Err(e) = self.provider.write_rating(&action.pc.path, tag) {
                        warn!(path = %action.pc.path.display(), error = %e, "rating write-back failed");
                        outcome.skipped.push((action.pc.describe(), e.to_string()));
                    }
                }
            }
            outcome.ratings_synced += 1;
        }

        self.stage_done(SyncStage::Ratings);
        Ok(())
    }

    // Stage 7: artwork rewrite, one codec emit, signing, atomic replace,
    // dbid backpatch into the mapping, mapping save.
    fn stage_write(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        mapping: &mut MappingFile,
        store: &MappingStore,
        pending: &[PendingAdd],
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        self.check_cancel()?;
        self.stage_start(SyncStage::WriteDatabase, 1);

        // dbids must exist before artwork so image records can key on them.
        for track in db.tracks.iter_mut() {
            if track.dbid == 0 {
                track.dbid = generate_dbid();
            }
        }

        let rewrite = plan.rewrite_artwork
            || !plan.to_update_artwork.is_empty()
            || pending.iter().any(|p| p.art_hash.is_some());
        if rewrite {
            self.events
                .emit(SyncEvent::StageStarted {
                    stage: SyncStage::Artwork,
                    total: db.tracks.len(),
                });
            outcome.artwork_images = self.rewrite_artwork(plan, db, pending)?;
            self.events
                .emit(SyncEvent::StageFinished {
                    stage: SyncStage::Artwork,
                });
        }

        // Signing inputs come off the old database, so resolve them before
        // the replace.
        let (kind, guid, hashinfo) = self.resolve_signing_inputs();

        let result = writer::write(db, &self.options.master_playlist_name)?;
        let mut bytes = result.bytes;
        signer::sign(&mut bytes, kind, guid.as_ref(), hashinfo.as_ref())?;

        backup_and_replace(
            &self.layout.itunes_db(),
            &self.layout.itunes_db_backup(),
            &bytes,
        )?;
        outcome.database_bytes = bytes.len();

        // The emitted database already folds the logged plays; a stale
        // sidecar would double-count them next run.
        let play_counts = self.layout.play_counts();
        if play_counts.exists() {
            if let Err(e) = fs::remove_file(&play_counts) {
                warn!(error = %e, "could not remove Play Counts sidecar");
            }
        }

        // Backpatch: the writer's id assignments become mapping entries for
        // the adds.
        for add in pending {
            let assignment = result
                .assignments
                .iter()
                .find(|a| a.index == add.track_index)
                .ok_or_else(|| {
                    SyncError::Mapping(format!(
                        "no id assignment for added track at index {}",
                        add.track_index
                    ))
                })?;
            mapping.upsert(
                &add.fingerprint,
                MappingEntry {
                    dbid: assignment.dbid,
                    album_key: add.album_key.clone(),
                    source_path_hint: Some(add.source_path_hint.clone()),
                    source_size: add.source_size,
                    source_mtime: add.source_mtime,
                    art_hash: add.art_hash.clone(),
                    source_format: add.source_format.clone(),
                    ipod_format: add.ipod_format.clone(),
                    was_transcoded: add.was_transcoded,
                    last_sync: now_unix(),
                },
            );
        }

        // The single commit point for the mapping.
        store.save(mapping)?;

        self.progress(SyncStage::WriteDatabase, 1, 1, "database written");
        self.stage_done(SyncStage::WriteDatabase);
        Ok(())
    }

    /// Extract art for every track that has a PC source, rebuild the
    /// ArtworkDB, and point each mhit at its image record.
    fn rewrite_artwork(
        &mut self,
        plan: &SyncPlan,
        db: &mut Database,
        pending: &[PendingAdd],
    ) -> Result<usize> {
        let mut sources = Vec::with_capacity(db.tracks.len());
        for (index, track) in db.tracks.iter().enumerate() {
            let pc_path = plan
                .matched_paths
                .get(&track.dbid)
                .cloned()
                .or_else(|| {
                    pending
                        .iter()
                        .find(|p| p.track_index == index)
                        .map(|p| p.source_path.clone())
                });
            let art = pc_path.and_then(|path| self.provider.embedded_artwork(&path).ok().flatten());
            sources.push(ArtworkSource {
                dbid: track.dbid,
                art,
                existing_mhii_link: track.mhii_link,
            });
        }

        let writer = ArtworkWriter::new(self.layout.clone(), self.encoder);
        let links = writer.rewrite(&sources)?;
        let image_count = {
            let mut ids: Vec<u32> = links.values().map(|l| l.image_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids.len()
        };

        // The old image records are gone, so every track is either linked
        // to a fresh record or cleared.
        for track in db.tracks.iter_mut() {
            match links.get(&track.dbid) {
                Some(link) => {
                    track.mhii_link = link.image_id;
                    track.artwork_count = 1;
                    track.artwork_size = link.source_size;
                }
                None => {
                    track.mhii_link = 0;
                    track.artwork_count = 0;
                    track.artwork_size = 0;
                }
            }
        }

        Ok(image_count)
    }

    /// Checksum class plus key material, with HashInfo recovered from the
    /// still-unreplaced database when the device file is missing.
    fn resolve_signing_inputs(&self) -> (ChecksumKind, Option<[u8; 8]>, Option<HashInfo>) {
        let kind = detect_checksum_kind(self.layout);
        let guid = SysInfo::read(self.layout)
            .ok()
            .and_then(|s| s.firewire_guid().ok());

        let mut hashinfo = HashInfo::read(self.layout).ok().flatten();
        if hashinfo.is_none() {
            if let Ok(existing) = fs::read(self.layout.itunes_db()) {
                if let Some((iv, rndpart)) = signer::extract_hash_info(&existing) {
                    info!("HashInfo recovered from the existing signed database");
                    let mut uuid = [0u8; 20];
                    if let Some(guid) = &guid {
                        uuid[..8].copy_from_slice(guid);
                    }
                    let recovered = HashInfo { uuid, rndpart, iv };
                    if let Err(e) = recovered.write(self.layout) {
                        warn!(error = %e, "could not persist recovered HashInfo");
                    }
                    hashinfo = Some(recovered);
                }
            }
        }

        (kind, guid, hashinfo)
    }

    /// Copy or transcode a PC file into a fresh device path: round-robin
    /// over `F00..F49` with a random 4-character alphanumeric stem.
    fn copy_to_device(&mut self, pc: &PcTrack, fingerprint: &str) -> Result<CopiedFile> {
        let folder = self.layout.music_folder(self.folder_counter);
        self.folder_counter = (self.folder_counter + 1) % MUSIC_FOLDER_COUNT;
        fs::create_dir_all(&folder)?;

        let stem = random_stem();
        let target = target_for(&pc.extension);

        let (dest, filetype, was_transcoded) = match target {
            TranscodeTarget::Copy => {
                let dest = folder.join(format!("{stem}.{}", pc.extension));
                fs::copy(&pc.path, &dest).map_err(|e| SyncError::Copy {
                    path: pc.path.clone(),
                    message: e.to_string(),
                })?;
                (dest, pc.extension.clone(), false)
            }
            TranscodeTarget::Alac | TranscodeTarget::Aac => {
                let bitrate = match target {
                    TranscodeTarget::Aac => Some(self.options.aac_bitrate),
                    _ => None,
                };
                let dest = folder.join(format!("{stem}.m4a"));
                match self.cache.get(fingerprint, target, pc.size, bitrate) {
                    Some(cached) => {
                        fs::copy(&cached, &dest).map_err(|e| SyncError::Copy {
                            path: cached.clone(),
                            message: e.to_string(),
                        })?;
                        debug!(source = %pc.path.display(), "transcode served from cache");
                    }
                    None => {
                        self.transcoder.transcode(
                            &pc.path,
                            &dest,
                            target,
                            self.options.aac_bitrate,
                        )?;
                        self.cache.add(
                            fingerprint,
                            &dest,
                            &pc.extension,
                            target,
                            pc.size,
                            bitrate,
                        );
                    }
                }
                (dest, "m4a".to_string(), true)
            }
        };

        let size = fs::metadata(&dest)?.len();
        let location = self
            .layout
            .location_for(&dest)
            .unwrap_or_default();

        Ok(CopiedFile {
            location,
            size,
            filetype,
            was_transcoded,
        })
    }
}

fn random_stem() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn track_from_pc(pc: &PcTrack, copied: &CopiedFile) -> Track {
    let meta = &pc.metadata;
    Track {
        title: pc.title_or_filename(),
        location: copied.location.clone(),
        size: copied.size as u32,
        duration_ms: meta.duration_ms as u32,
        filetype: copied.filetype.clone(),
        bitrate: meta.bitrate.unwrap_or(0),
        sample_rate: meta.sample_rate.unwrap_or(44_100),
        artist: meta.artist.clone(),
        album: meta.album.clone(),
        album_artist: meta.album_artist.clone(),
        genre: meta.genre.clone(),
        composer: meta.composer.clone(),
        comment: meta.comment.clone(),
        year: meta.year.unwrap_or(0),
        track_number: meta.track_number.unwrap_or(0),
        total_tracks: meta.track_total.unwrap_or(0),
        disc_number: meta.disc_number.unwrap_or(1),
        total_discs: meta.disc_total.unwrap_or(1),
        rating: pc.rating(),
        media_type: media_type::AUDIO,
        ..Track::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_stem_shape() {
        for _ in 0..50 {
            let stem = random_stem();
            assert_eq!(stem.len(), 4);
            assert!(stem
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}
