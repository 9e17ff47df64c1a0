//! End-to-end pipeline tests over a fake mounted device and an in-memory
//! tag provider: add, re-tag, multi-album identity, removal, orphan repair,
//! play-count merge, idempotence, and failure modes.

use bridge_traits::{
    ArtworkFormat, AudioMetadata, BridgeError, DeviceStorage, EncodedImage, FixedStorage,
    ImageEncoder, MetadataProvider, RatingTag,
};
use bytes::Bytes;
use core_db::{playcounts, reader};
use core_device::DeviceLayout;
use core_runtime::{CancelFlag, EventBus};
use core_sync::{
    Fingerprinter, MappingStore, SyncCoordinator, SyncError, SyncOptions,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use walkdir::WalkDir;

// ============================================================================
// Stub capability implementations
// ============================================================================

#[derive(Debug, Clone, Default)]
struct StubFile {
    metadata: AudioMetadata,
    art: Option<Bytes>,
    fingerprint_tag: Option<String>,
}

#[derive(Default)]
struct StubProvider {
    files: Mutex<HashMap<PathBuf, StubFile>>,
    play_count_writes: Mutex<Vec<(PathBuf, u32)>>,
    rating_writes: Mutex<Vec<(PathBuf, RatingTag)>>,
}

impl StubProvider {
    fn register(&self, path: &Path, file: StubFile) {
        self.files.lock().unwrap().insert(path.to_path_buf(), file);
    }

    fn set_title(&self, path: &Path, title: &str) {
        let mut files = self.files.lock().unwrap();
        files.get_mut(path).unwrap().metadata.title = Some(title.to_string());
    }
}

impl MetadataProvider for StubProvider {
    fn read(&self, path: &Path) -> bridge_traits::Result<AudioMetadata> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|f| f.metadata.clone())
            .ok_or_else(|| BridgeError::NotAvailable(path.display().to_string()))
    }

    fn embedded_artwork(&self, path: &Path) -> bridge_traits::Result<Option<Bytes>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .and_then(|f| f.art.clone()))
    }

    fn read_fingerprint_tag(&self, path: &Path) -> bridge_traits::Result<Option<String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .and_then(|f| f.fingerprint_tag.clone()))
    }

    fn write_fingerprint_tag(&self, path: &Path, fingerprint: &str) -> bridge_traits::Result<()> {
        if let Some(file) = self.files.lock().unwrap().get_mut(path) {
            file.fingerprint_tag = Some(fingerprint.to_string());
        }
        Ok(())
    }

    fn write_play_count(&self, path: &Path, play_count: u32) -> bridge_traits::Result<()> {
        self.play_count_writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), play_count));
        Ok(())
    }

    fn write_rating(&self, path: &Path, rating: RatingTag) -> bridge_traits::Result<()> {
        self.rating_writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), rating));
        Ok(())
    }
}

/// Per-path fingerprints, standing in for fpcalc.
#[derive(Default)]
struct StubFingerprinter {
    by_path: Mutex<HashMap<PathBuf, String>>,
}

impl StubFingerprinter {
    fn set(&self, path: &Path, fingerprint: &str) {
        self.by_path
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), fingerprint.to_string());
    }
}

impl Fingerprinter for StubFingerprinter {
    fn fingerprint(&self, path: &Path) -> core_sync::Result<String> {
        self.by_path
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::Fingerprint {
                path: path.to_path_buf(),
                message: "no stub fingerprint".to_string(),
            })
    }

    fn available(&self) -> bool {
        true
    }
}

struct FlatEncoder;

impl ImageEncoder for FlatEncoder {
    fn encode(&self, source: &[u8], format: ArtworkFormat) -> bridge_traits::Result<EncodedImage> {
        let fill = source.first().copied().unwrap_or(0);
        Ok(EncodedImage {
            format,
            data: Bytes::from(vec![fill; format.pixel_bytes() as usize]),
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    device: TempDir,
    library: TempDir,
    provider: StubProvider,
    fingerprinter: StubFingerprinter,
    storage: FixedStorage,
    encoder: FlatEncoder,
}

impl Fixture {
    fn new() -> Self {
        Self {
            device: TempDir::new().unwrap(),
            library: TempDir::new().unwrap(),
            provider: StubProvider::default(),
            fingerprinter: StubFingerprinter::default(),
            storage: FixedStorage(64 * 1024 * 1024 * 1024),
            encoder: FlatEncoder,
        }
    }

    fn layout(&self) -> DeviceLayout {
        DeviceLayout::new(self.device.path())
    }

    fn options(&self) -> SyncOptions {
        SyncOptions {
            library_root: self.library.path().to_path_buf(),
            cache_dir: Some(self.device.path().join(".cache")),
            ..SyncOptions::default()
        }
    }

    fn coordinator(&self, options: SyncOptions) -> SyncCoordinator<'_> {
        SyncCoordinator::new(
            self.layout(),
            &self.provider,
            &self.encoder,
            &self.storage,
            &self.fingerprinter,
            options,
            EventBus::new(1024),
            CancelFlag::new(),
        )
    }

    /// Create a library file with registered tags and fingerprint.
    fn add_song(
        &self,
        relative: &str,
        fingerprint: &str,
        artist: &str,
        album: &str,
        title: &str,
    ) -> PathBuf {
        let path = self.library.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0xAB; 120_000]).unwrap();

        self.provider.register(
            &path,
            StubFile {
                metadata: AudioMetadata {
                    title: Some(title.to_string()),
                    artist: Some(artist.to_string()),
                    album: Some(album.to_string()),
                    duration_ms: 180_000,
                    bitrate: Some(192),
                    sample_rate: Some(44_100),
                    ..AudioMetadata::default()
                },
                ..StubFile::default()
            },
        );
        self.fingerprinter.set(&path, fingerprint);
        path
    }

    fn device_audio_files(&self) -> Vec<PathBuf> {
        let music = self.layout().music_dir();
        if !music.exists() {
            return Vec::new();
        }
        WalkDir::new(music)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    fn parse_device_db(&self) -> core_db::Database {
        let bytes = fs::read(self.layout().itunes_db()).unwrap();
        reader::parse(&bytes).unwrap()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn add_one_mp3_to_an_empty_device() {
    let fixture = Fixture::new();
    fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let coordinator = fixture.coordinator(fixture.options());
    let mut prepared = coordinator.plan().unwrap();
    assert_eq!(prepared.plan.to_add.len(), 1);
    assert!(prepared.plan.to_remove.is_empty());

    let outcome = coordinator.execute(&mut prepared).unwrap();
    assert_eq!(outcome.added, 1);

    // One audio file landed under Music/F??.
    assert_eq!(fixture.device_audio_files().len(), 1);

    // The database holds one track referenced by the master playlist.
    let db = fixture.parse_device_db();
    assert_eq!(db.tracks.len(), 1);
    assert_eq!(db.tracks[0].title, "T");
    let master = db.playlists.iter().find(|p| p.is_master).unwrap();
    assert_eq!(master.items.len(), 1);
    assert_eq!(master.items[0].track_id, db.tracks[0].track_id);

    // The mapping gained one entry keyed by fingerprint and album.
    let mapping = MappingStore::new(&fixture.layout()).load();
    let entries = mapping.entries("fp-song");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].album_key, "b");
    assert_eq!(entries[0].dbid, db.tracks[0].dbid);

    // A second run has nothing to do.
    let prepared = coordinator.plan().unwrap();
    assert!(prepared.plan.is_empty(), "{}", prepared.plan.summary());
}

#[test]
fn retag_without_reencode_updates_metadata_only() {
    let fixture = Fixture::new();
    let path = fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let coordinator = fixture.coordinator(fixture.options());
    coordinator.run().unwrap();
    let before = fixture.device_audio_files();

    fixture.provider.set_title(&path, "T-prime");

    let mut prepared = coordinator.plan().unwrap();
    assert!(prepared.plan.to_add.is_empty());
    assert!(prepared.plan.to_update_file.is_empty());
    assert_eq!(prepared.plan.to_update_metadata.len(), 1);
    assert_eq!(
        prepared.plan.to_update_metadata[0].changed_fields,
        vec![core_sync::MetadataField::Title]
    );

    coordinator.execute(&mut prepared).unwrap();

    // Same file on the device, new title in the database.
    assert_eq!(fixture.device_audio_files(), before);
    let db = fixture.parse_device_db();
    assert_eq!(db.tracks[0].title, "T-prime");
}

#[test]
fn same_recording_on_two_albums_syncs_twice() {
    let fixture = Fixture::new();
    fixture.add_song("studio/song.mp3", "fp-same", "A", "Studio", "Song");
    fixture.add_song("hits/song.mp3", "fp-same", "A", "Greatest Hits", "Song");

    let coordinator = fixture.coordinator(fixture.options());
    let mut prepared = coordinator.plan().unwrap();
    assert_eq!(prepared.plan.to_add.len(), 2);

    coordinator.execute(&mut prepared).unwrap();

    let mapping = MappingStore::new(&fixture.layout()).load();
    let entries = mapping.entries("fp-same");
    assert_eq!(entries.len(), 2);
    let mut keys: Vec<&str> = entries.iter().map(|e| e.album_key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["greatest hits", "studio"]);

    // Both match on the next run; nothing to do.
    let prepared = coordinator.plan().unwrap();
    assert!(prepared.plan.is_empty(), "{}", prepared.plan.summary());
}

#[test]
fn removing_the_pc_file_removes_the_device_track() {
    let fixture = Fixture::new();
    let path = fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let coordinator = fixture.coordinator(fixture.options());
    coordinator.run().unwrap();
    assert_eq!(fixture.device_audio_files().len(), 1);

    fs::remove_file(&path).unwrap();
    fixture.provider.files.lock().unwrap().remove(&path);

    let mut prepared = coordinator.plan().unwrap();
    assert_eq!(prepared.plan.to_remove.len(), 1);
    let outcome = coordinator.execute(&mut prepared).unwrap();
    assert_eq!(outcome.removed, 1);

    assert!(fixture.device_audio_files().is_empty());
    assert!(fixture.parse_device_db().tracks.is_empty());
    let mapping = MappingStore::new(&fixture.layout()).load();
    assert!(mapping.entries("fp-song").is_empty());
}

#[test]
fn orphan_files_are_repaired_before_the_diff() {
    let fixture = Fixture::new();
    fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let coordinator = fixture.coordinator(fixture.options());
    coordinator.run().unwrap();

    // Drop a stray audio file into F07.
    let orphan_dir = fixture.layout().music_folder(7);
    fs::create_dir_all(&orphan_dir).unwrap();
    let orphan = orphan_dir.join("STRAY.mp3");
    fs::write(&orphan, b"leftover").unwrap();

    let prepared = coordinator.plan().unwrap();
    assert_eq!(prepared.plan.integrity.orphans_removed.len(), 1);
    assert!(!orphan.exists());
    // The repair is informational; the plan itself is clean.
    assert!(prepared.plan.is_empty(), "{}", prepared.plan.summary());
}

#[test]
fn device_play_counts_fold_additively() {
    let fixture = Fixture::new();
    let path = fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let mut options = fixture.options();
    options.write_back_play_counts = true;
    let coordinator = fixture.coordinator(options);
    coordinator.run().unwrap();

    // The firmware logged three plays since that sync.
    let mut play_counts = Vec::new();
    play_counts.extend_from_slice(b"mhdp");
    play_counts.extend_from_slice(&96u32.to_le_bytes());
    play_counts.extend_from_slice(&0x1Cu32.to_le_bytes());
    play_counts.extend_from_slice(&1u32.to_le_bytes());
    play_counts.resize(96, 0);
    play_counts.extend_from_slice(&3u32.to_le_bytes()); // play_count
    play_counts.extend_from_slice(&[0u8; 24]);
    fs::write(fixture.layout().play_counts(), &play_counts).unwrap();

    let mut prepared = coordinator.plan().unwrap();
    assert_eq!(prepared.plan.to_sync_play_counts.len(), 1);
    assert_eq!(prepared.plan.to_sync_play_counts[0].delta, 3);

    let outcome = coordinator.execute(&mut prepared).unwrap();
    assert_eq!(outcome.play_counts_synced, 1);

    let db = fixture.parse_device_db();
    assert_eq!(db.tracks[0].play_count, 3);
    assert_eq!(db.tracks[0].play_count_2, 0);

    // Write-back pushed the folded total to the PC file.
    let writes = fixture.provider.play_count_writes.lock().unwrap();
    assert_eq!(writes.as_slice(), &[(path, 3)]);
}

#[test]
fn artwork_rewrite_links_tracks_to_images() {
    let fixture = Fixture::new();
    let path = fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");
    {
        let mut files = fixture.provider.files.lock().unwrap();
        let file = files.get_mut(&path).unwrap();
        file.art = Some(Bytes::from_static(b"\x5Ajpeg"));
    }

    let coordinator = fixture.coordinator(fixture.options());
    let outcome = coordinator.run().unwrap();
    assert_eq!(outcome.artwork_images, 1);

    let db = fixture.parse_device_db();
    assert_ne!(db.tracks[0].mhii_link, 0);
    assert_eq!(db.tracks[0].artwork_count, 1);
    assert!(fixture.layout().artwork_db().exists());

    // The mapping recorded the art hash, so the next plan is clean.
    let prepared = coordinator.plan().unwrap();
    assert!(prepared.plan.is_empty(), "{}", prepared.plan.summary());
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn insufficient_storage_aborts_before_any_stage() {
    let fixture = Fixture::new();
    fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let tiny = FixedStorage(1024); // nowhere near enough
    let coordinator = SyncCoordinator::new(
        fixture.layout(),
        &fixture.provider,
        &fixture.encoder,
        &tiny,
        &fixture.fingerprinter,
        fixture.options(),
        EventBus::new(64),
        CancelFlag::new(),
    );

    match coordinator.run() {
        Err(SyncError::StorageInsufficient { .. }) => {}
        other => panic!("expected StorageInsufficient, got {other:?}"),
    }
    // Nothing was persisted.
    assert!(!fixture.layout().itunes_db().exists());
    assert!(!fixture.layout().mapping_file().exists());
}

#[test]
fn cancellation_persists_nothing() {
    let fixture = Fixture::new();
    fixture.add_song("Song.mp3", "fp-song", "A", "B", "T");

    let cancel = CancelFlag::new();
    let coordinator = SyncCoordinator::new(
        fixture.layout(),
        &fixture.provider,
        &fixture.encoder,
        &fixture.storage,
        &fixture.fingerprinter,
        fixture.options(),
        EventBus::new(64),
        cancel.clone(),
    );

    let mut prepared = coordinator.plan().unwrap();
    cancel.cancel();
    match coordinator.execute(&mut prepared) {
        Err(SyncError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(!fixture.layout().itunes_db().exists());
    assert!(!fixture.layout().mapping_file().exists());
}

#[test]
fn fingerprint_failures_skip_the_file_but_sync_continues() {
    let fixture = Fixture::new();
    fixture.add_song("Good.mp3", "fp-good", "A", "B", "Good");

    // Registered with the provider but unknown to the fingerprinter.
    let bad = fixture.library.path().join("Bad.mp3");
    fs::write(&bad, vec![1u8; 50_000]).unwrap();
    fixture.provider.register(
        &bad,
        StubFile {
            metadata: AudioMetadata {
                title: Some("Bad".to_string()),
                duration_ms: 1000,
                ..AudioMetadata::default()
            },
            ..StubFile::default()
        },
    );

    let coordinator = fixture.coordinator(fixture.options());
    let mut prepared = coordinator.plan().unwrap();
    assert_eq!(prepared.plan.fingerprint_errors.len(), 1);
    assert_eq!(prepared.plan.to_add.len(), 1);

    coordinator.execute(&mut prepared).unwrap();
    assert_eq!(fixture.parse_device_db().tracks.len(), 1);
}

#[test]
fn play_counts_sidecar_parses_what_the_fixture_writes() {
    // Guards the fixture format used above against drift.
    let mut data = Vec::new();
    data.extend_from_slice(b"mhdp");
    data.extend_from_slice(&96u32.to_le_bytes());
    data.extend_from_slice(&0x1Cu32.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes());
    data.resize(96, 0);
    data.extend_from_slice(&7u32.to_le_bytes());
    data.extend_from_slice(&[0u8; 24]);

    let counts = playcounts::parse(&data).unwrap();
    assert_eq!(counts.entries.len(), 1);
    assert_eq!(counts.entries[0].play_count, 7);
}
