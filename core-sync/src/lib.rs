//! # Sync Module
//!
//! The pipeline that mirrors a PC music library onto a device.
//!
//! ## Components
//!
//! - **PC Library** (`pc_library`): scans the library and builds per-file
//!   identity (fingerprint + album key)
//! - **Fingerprint** (`fingerprint`): tag-first Chromaprint identity
//! - **Mapping** (`mapping`): the fingerprint → device-track store
//! - **Integrity** (`integrity`): reconciles files, database, and mapping
//! - **Diff** (`diff`): computes a categorized [`SyncPlan`](plan::SyncPlan)
//! - **Transcode** (`transcode`): ffmpeg routing plus the content-addressed
//!   cache
//! - **Executor** (`executor`): the seven-stage run with a single commit
//!   point
//! - **Coordinator** (`coordinator`): end-to-end orchestration with events
//!   and cancellation

pub mod coordinator;
pub mod diff;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod integrity;
pub mod mapping;
pub mod pc_library;
pub mod plan;
pub mod proc;
pub mod transcode;

pub use coordinator::{PreparedSync, SyncCoordinator, SyncOptions};
pub use diff::compute_plan;
pub use error::{Result, SyncError};
pub use executor::{SyncExecutor, SyncOutcome};
pub use fingerprint::{FpcalcRunner, Fingerprinter};
pub use integrity::{check_integrity, IntegrityReport};
pub use mapping::{MappingEntry, MappingFile, MappingStore};
pub use pc_library::{album_key, PcLibrary, PcTrack, ScanResult};
pub use plan::{MetadataField, StorageSummary, SyncPlan};
pub use transcode::{needs_transcoding, target_for, TranscodeCache, TranscodeTarget, Transcoder};
