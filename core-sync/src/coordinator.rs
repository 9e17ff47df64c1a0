//! # Sync Coordinator
//!
//! Orchestrates one complete sync run against a mounted device.
//!
//! ## Data flow
//!
//! ```text
//! filesystem + database + mapping
//!   → Play Counts merge
//!   → integrity checker (repairs the three sources of truth)
//!   → library scan (tags + fingerprints)
//!   → diff engine → SyncPlan
//!   → executor (seven stages; one codec emit + sign + atomic replace)
//!   → mapping persisted
//! ```
//!
//! The pipeline is synchronous and single-threaded; a host runs it on a
//! background thread, watches [`EventBus`] events, and cancels through the
//! shared [`CancelFlag`]. Callers serialize: one run per device at a time.

use crate::diff::compute_plan;
use crate::error::{Result, SyncError};
use crate::executor::{SyncExecutor, SyncOutcome};
use crate::fingerprint::Fingerprinter;
use crate::integrity::check_integrity;
use crate::mapping::{MappingFile, MappingStore};
use crate::pc_library::PcLibrary;
use crate::plan::SyncPlan;
use bridge_traits::{DeviceStorage, ImageEncoder, MetadataProvider};
use core_db::{playcounts, reader, Database};
use core_device::DeviceLayout;
use core_runtime::{CancelFlag, EventBus, SyncEvent, SyncStage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Sync run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Root of the PC music library.
    pub library_root: PathBuf,

    /// Name for the master playlist (usually the device name).
    pub master_playlist_name: String,

    /// Bitrate for AAC transcodes, in kbps.
    pub aac_bitrate: u32,

    /// Write folded play counts back into the PC files' tags.
    pub write_back_play_counts: bool,

    /// Write resolved ratings back into the PC files' tags.
    pub write_back_ratings: bool,

    /// Store computed fingerprints in the PC files' tags.
    pub write_fingerprint_tags: bool,

    /// Transcode cache directory; defaults next to the user's home.
    pub cache_dir: Option<PathBuf>,

    /// Hard timeout for one transcoder invocation.
    pub transcode_timeout_secs: u64,

    /// Safety margin on top of the net storage requirement.
    pub free_space_margin_bytes: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            library_root: PathBuf::new(),
            master_playlist_name: "iPod".to_string(),
            aac_bitrate: 256,
            write_back_play_counts: false,
            write_back_ratings: false,
            write_fingerprint_tags: true,
            cache_dir: None,
            transcode_timeout_secs: 600,
            free_space_margin_bytes: 10 * 1024 * 1024,
        }
    }
}

impl SyncOptions {
    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir);
                home.join(".iopenpod").join("transcode_cache")
            }
        }
    }
}

/// Everything a plan run loads and the executor consumes.
pub struct PreparedSync {
    pub plan: SyncPlan,
    pub database: Database,
    pub mapping: MappingFile,
}

/// One-device sync orchestrator.
pub struct SyncCoordinator<'a> {
    layout: DeviceLayout,
    provider: &'a dyn MetadataProvider,
    encoder: &'a dyn ImageEncoder,
    storage: &'a dyn DeviceStorage,
    fingerprinter: &'a dyn Fingerprinter,
    options: SyncOptions,
    events: EventBus,
    cancel: CancelFlag,
}

impl<'a> SyncCoordinator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: DeviceLayout,
        provider: &'a dyn MetadataProvider,
        encoder: &'a dyn ImageEncoder,
        storage: &'a dyn DeviceStorage,
        fingerprinter: &'a dyn Fingerprinter,
        options: SyncOptions,
        events: EventBus,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            layout,
            provider,
            encoder,
            storage,
            fingerprinter,
            options,
            events,
            cancel,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.events.emit(SyncEvent::Cancelled);
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Load all three sources of truth, repair them, scan the PC library,
    /// and compute the plan. Makes no changes beyond integrity repairs.
    #[instrument(skip_all)]
    pub fn plan(&self) -> Result<PreparedSync> {
        if !self.fingerprinter.available() {
            return Err(SyncError::PreflightMissingTool(
                "fpcalc (Chromaprint)".to_string(),
            ));
        }

        self.events.emit(SyncEvent::Started);

        // Device database; a missing file means a blank device.
        let mut database = match fs::read(self.layout.itunes_db()) {
            Ok(bytes) => reader::parse(&bytes)?,
            Err(_) => {
                info!("no iTunesDB on device, starting from an empty database");
                Database::default()
            }
        };

        // Device-side plays recorded since the last sync.
        match fs::read(self.layout.play_counts()) {
            Ok(bytes) => match playcounts::parse(&bytes) {
                Ok(counts) => {
                    let touched = playcounts::apply(&counts, &mut database.tracks);
                    debug!(touched, "Play Counts merged into working set");
                }
                Err(e) => warn!(error = %e, "Play Counts file unreadable, ignoring"),
            },
            Err(_) => debug!("no Play Counts file"),
        }

        let store = MappingStore::new(&self.layout);
        let mut mapping = store.load();

        self.check_cancel()?;
        self.events.emit(SyncEvent::StageStarted {
            stage: SyncStage::Integrity,
            total: 0,
        });
        let integrity = check_integrity(&self.layout, &mut database.tracks, &mut mapping);
        self.events.emit(SyncEvent::StageFinished {
            stage: SyncStage::Integrity,
        });

        self.check_cancel()?;
        self.events.emit(SyncEvent::StageStarted {
            stage: SyncStage::Scan,
            total: 0,
        });
        let library = PcLibrary::new(&self.options.library_root);
        let scan = library.scan(
            self.provider,
            self.fingerprinter,
            self.options.write_fingerprint_tags,
        )?;
        self.events.emit(SyncEvent::StageFinished {
            stage: SyncStage::Scan,
        });

        self.check_cancel()?;
        self.events.emit(SyncEvent::StageStarted {
            stage: SyncStage::Diff,
            total: scan.tracks.len(),
        });
        let plan = compute_plan(
            &scan.tracks,
            &database,
            &mapping,
            integrity,
            scan.fingerprint_errors,
        );
        self.events.emit(SyncEvent::StageFinished {
            stage: SyncStage::Diff,
        });

        Ok(PreparedSync {
            plan,
            database,
            mapping,
        })
    }

    /// Execute a prepared plan.
    #[instrument(skip_all)]
    pub fn execute(&self, prepared: &mut PreparedSync) -> Result<SyncOutcome> {
        let store = MappingStore::new(&self.layout);
        let mut executor = SyncExecutor::new(
            &self.layout,
            self.provider,
            self.encoder,
            self.storage,
            &self.options,
            &self.events,
            &self.cancel,
        )?;

        match executor.execute(
            &prepared.plan,
            &mut prepared.database,
            &mut prepared.mapping,
            &store,
        ) {
            Ok(outcome) => {
                self.events.emit(SyncEvent::Completed);
                Ok(outcome)
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                self.events.emit(SyncEvent::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Plan and execute in one call.
    pub fn run(&self) -> Result<SyncOutcome> {
        let mut prepared = self.plan()?;
        self.execute(&mut prepared)
    }
}
