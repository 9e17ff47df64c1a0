//! Fingerprint → device-track mapping store.
//!
//! `/iPod_Control/iTunes/iOpenPod.json` records which PC recording became
//! which device track. A fingerprint maps to a *list* of entries because
//! the same recording legitimately appears on multiple albums; entries are
//! disambiguated by `album_key` at match time. The common case is a list of
//! length one.
//!
//! The store is loaded once per sync, mutated in memory, and saved exactly
//! once — after the database replace succeeded. Any earlier failure
//! discards the in-memory changes.

use crate::error::{Result, SyncError};
use core_device::{atomic_write, DeviceLayout};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const MAPPING_VERSION: u32 = 2;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One PC-file ↔ device-track link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub dbid: u64,
    /// `lowercase(trim(album))` at sync time; the secondary identity key.
    pub album_key: String,
    /// Relative PC path at sync time; a tiebreaker, never a primary key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path_hint: Option<String>,
    pub source_size: u64,
    pub source_mtime: i64,
    /// MD5 of the embedded artwork at sync time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub art_hash: Option<String>,
    /// Original format on the PC ("flac", "mp3", …).
    pub source_format: String,
    /// Format as stored on the device ("mp3", "m4a").
    pub ipod_format: String,
    pub was_transcoded: bool,
    /// Unix seconds of the sync that wrote this entry.
    pub last_sync: u64,
}

/// The whole mapping document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingFile {
    pub version: u32,
    pub created: u64,
    pub modified: u64,
    /// fingerprint → entries.
    pub tracks: BTreeMap<String, Vec<MappingEntry>>,
}

impl Default for MappingFile {
    fn default() -> Self {
        let now = now_unix();
        Self {
            version: MAPPING_VERSION,
            created: now,
            modified: now,
            tracks: BTreeMap::new(),
        }
    }
}

impl MappingFile {
    pub fn entries(&self, fingerprint: &str) -> &[MappingEntry] {
        self.tracks
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Insert or update (same fingerprint + dbid replaces in place).
    pub fn upsert(&mut self, fingerprint: &str, entry: MappingEntry) {
        let entries = self.tracks.entry(fingerprint.to_string()).or_default();
        match entries.iter_mut().find(|e| e.dbid == entry.dbid) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.modified = now_unix();
    }

    pub fn entry_by_dbid_mut(&mut self, dbid: u64) -> Option<&mut MappingEntry> {
        self.tracks
            .values_mut()
            .flat_map(|entries| entries.iter_mut())
            .find(|e| e.dbid == dbid)
    }

    /// Remove one entry; drops the fingerprint key when its list empties.
    pub fn remove(&mut self, fingerprint: &str, dbid: u64) -> bool {
        let Some(entries) = self.tracks.get_mut(fingerprint) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.dbid != dbid);
        let removed = entries.len() < before;
        if entries.is_empty() {
            self.tracks.remove(fingerprint);
        }
        if removed {
            self.modified = now_unix();
        }
        removed
    }

    pub fn remove_by_dbid(&mut self, dbid: u64) -> bool {
        let fingerprint = self
            .tracks
            .iter()
            .find(|(_, entries)| entries.iter().any(|e| e.dbid == dbid))
            .map(|(fp, _)| fp.clone());
        match fingerprint {
            Some(fp) => self.remove(&fp, dbid),
            None => false,
        }
    }

    /// Drop every entry whose dbid fails the predicate. Returns how many
    /// entries were removed.
    pub fn retain_dbids(&mut self, keep: impl Fn(u64) -> bool) -> usize {
        let mut removed = 0;
        self.tracks.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| keep(e.dbid));
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            self.modified = now_unix();
        }
        removed
    }

    pub fn all_dbids(&self) -> Vec<u64> {
        self.tracks
            .values()
            .flat_map(|entries| entries.iter().map(|e| e.dbid))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.tracks.values().map(Vec::len).sum()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.tracks.len()
    }
}

/// Loads and saves the mapping document with the temp-plus-rename
/// discipline.
pub struct MappingStore {
    path: PathBuf,
}

impl MappingStore {
    pub fn new(layout: &DeviceLayout) -> Self {
        Self {
            path: layout.mapping_file(),
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the mapping; a missing file yields an empty document and a
    /// corrupt one is renamed aside and replaced.
    pub fn load(&self) -> MappingFile {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(_) => {
                info!(path = %self.path.display(), "no mapping file, starting empty");
                return MappingFile::default();
            }
        };

        match serde_json::from_slice::<MappingFile>(&data) {
            Ok(mapping) => {
                info!(
                    entries = mapping.entry_count(),
                    fingerprints = mapping.fingerprint_count(),
                    "mapping loaded"
                );
                mapping
            }
            Err(e) => {
                warn!(error = %e, "mapping file corrupt, moving aside");
                let backup = self.path.with_extension("json.bak");
                let _ = fs::rename(&self.path, backup);
                MappingFile::default()
            }
        }
    }

    /// Persist atomically. Called exactly once per sync, after the database
    /// replace succeeded.
    pub fn save(&self, mapping: &mut MappingFile) -> Result<()> {
        mapping.modified = now_unix();
        let json = serde_json::to_vec_pretty(mapping)
            .map_err(|e| SyncError::Mapping(e.to_string()))?;
        atomic_write(&self.path, &json)?;
        info!(entries = mapping.entry_count(), "mapping saved");
        Ok(())
    }
}
