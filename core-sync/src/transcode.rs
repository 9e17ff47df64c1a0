//! Transcoding and the content-addressed transcode cache.
//!
//! Extension routing: `mp3`/`m4a`/`m4p`/`aac` copy straight over;
//! `flac`/`wav`/`aif`/`aiff` transcode to ALAC; `ogg`/`opus`/`wma`
//! transcode to AAC at the configured bitrate. The cache is keyed by
//! `fingerprint:target[:bitrate]` — by audio content, not path — so the
//! same recording under a different filename reuses one cached output, and
//! multiple devices share it.

use crate::error::{Result, SyncError};
use crate::proc::{find_tool, run_with_timeout};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(600);

/// Target format for one source extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeTarget {
    /// Lossless sources → Apple Lossless in an `.m4a` container.
    Alac,
    /// Lossy non-native sources → AAC in an `.m4a` container.
    Aac,
    /// Device-native formats, copied as-is.
    Copy,
}

impl TranscodeTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeTarget::Alac => "alac",
            TranscodeTarget::Aac => "aac",
            TranscodeTarget::Copy => "copy",
        }
    }
}

/// Route a lowercased extension to its target.
pub fn target_for(extension: &str) -> TranscodeTarget {
    match extension {
        "mp3" | "m4a" | "m4p" | "aac" => TranscodeTarget::Copy,
        "flac" | "wav" | "aif" | "aiff" => TranscodeTarget::Alac,
        _ => TranscodeTarget::Aac,
    }
}

pub fn needs_transcoding(extension: &str) -> bool {
    target_for(extension) != TranscodeTarget::Copy
}

/// ffmpeg-backed transcoder.
pub struct Transcoder {
    ffmpeg: Option<PathBuf>,
    timeout: Duration,
}

impl Transcoder {
    pub fn locate(timeout: Duration) -> Self {
        Self {
            ffmpeg: find_tool("ffmpeg"),
            timeout,
        }
    }

    pub fn with_binary(ffmpeg: PathBuf, timeout: Duration) -> Self {
        Self {
            ffmpeg: Some(ffmpeg),
            timeout,
        }
    }

    pub fn available(&self) -> bool {
        self.ffmpeg.is_some()
    }

    /// Transcode `source` into `dest`, whose extension must be `.m4a`.
    pub fn transcode(
        &self,
        source: &Path,
        dest: &Path,
        target: TranscodeTarget,
        aac_bitrate: u32,
    ) -> Result<()> {
        let ffmpeg = self.ffmpeg.as_ref().ok_or_else(|| {
            SyncError::PreflightMissingTool("ffmpeg".to_string())
        })?;

        let mut cmd = Command::new(ffmpeg);
        cmd.arg("-i").arg(source).arg("-vn");
        match target {
            TranscodeTarget::Alac => {
                cmd.args(["-acodec", "alac"]);
            }
            TranscodeTarget::Aac => {
                cmd.args(["-acodec", "aac", "-b:a"]);
                cmd.arg(format!("{aac_bitrate}k"));
            }
            TranscodeTarget::Copy => {
                return Err(SyncError::Transcode {
                    path: source.to_path_buf(),
                    message: "copy targets are not transcoded".into(),
                });
            }
        }
        cmd.arg("-y").arg(dest);

        let output = run_with_timeout(cmd, self.timeout).map_err(|e| SyncError::Transcode {
            path: source.to_path_buf(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let head: String = stderr.chars().take(400).collect();
            return Err(SyncError::Transcode {
                path: source.to_path_buf(),
                message: format!("ffmpeg failed: {head}"),
            });
        }
        if !dest.exists() {
            return Err(SyncError::Transcode {
                path: source.to_path_buf(),
                message: "ffmpeg reported success but wrote no output".into(),
            });
        }

        info!(source = %source.display(), dest = %dest.display(), "transcoded");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedFile {
    fingerprint: String,
    source_format: String,
    target_format: String,
    filename: String,
    size: u64,
    created: u64,
    source_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    files: BTreeMap<String, CachedFile>,
}

/// On-disk transcode cache: `index.json` plus a `files/` directory of
/// transcoded outputs named by a fingerprint digest.
pub struct TranscodeCache {
    files_dir: PathBuf,
    index_path: PathBuf,
    index: CacheIndex,
}

impl TranscodeCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let files_dir = root.join("files");
        fs::create_dir_all(&files_dir)?;
        let index_path = root.join("index.json");

        let index = match fs::read(&index_path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(error = %e, "cache index corrupt, starting empty");
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        };

        Ok(Self {
            files_dir,
            index_path,
            index,
        })
    }

    fn save_index(&self) {
        match serde_json::to_vec_pretty(&self.index) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.index_path, json) {
                    warn!(error = %e, "could not save cache index");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize cache index"),
        }
    }

    fn key(fingerprint: &str, target: TranscodeTarget, bitrate: Option<u32>) -> String {
        match bitrate {
            Some(bitrate) => format!("{fingerprint}:{}:{bitrate}", target.as_str()),
            None => format!("{fingerprint}:{}", target.as_str()),
        }
    }

    fn cache_filename(fingerprint: &str, target: TranscodeTarget, bitrate: Option<u32>) -> String {
        let digest = Sha1::digest(fingerprint.as_bytes());
        let prefix: String = digest.iter().take(12).map(|b| format!("{b:02x}")).collect();
        match bitrate {
            Some(bitrate) => format!("{prefix}_{}_{bitrate}.m4a", target.as_str()),
            None => format!("{prefix}_{}.m4a", target.as_str()),
        }
    }

    /// Cached output path when present and still valid for this source
    /// size. A stale or missing file drops the entry.
    pub fn get(
        &mut self,
        fingerprint: &str,
        target: TranscodeTarget,
        source_size: u64,
        bitrate: Option<u32>,
    ) -> Option<PathBuf> {
        let key = Self::key(fingerprint, target, bitrate);
        let cached = self.index.files.get(&key)?;
        let path = self.files_dir.join(&cached.filename);

        if !path.exists() {
            debug!(key = %key, "cached file missing, dropping entry");
            self.index.files.remove(&key);
            self.save_index();
            return None;
        }
        if cached.source_size != source_size {
            debug!(key = %key, "source changed, invalidating cache entry");
            let _ = fs::remove_file(&path);
            self.index.files.remove(&key);
            self.save_index();
            return None;
        }

        debug!(key = %key, "transcode cache hit");
        Some(path)
    }

    /// Copy a fresh transcode into the cache.
    pub fn add(
        &mut self,
        fingerprint: &str,
        transcoded: &Path,
        source_format: &str,
        target: TranscodeTarget,
        source_size: u64,
        bitrate: Option<u32>,
    ) {
        let filename = Self::cache_filename(fingerprint, target, bitrate);
        let cached_path = self.files_dir.join(&filename);
        if let Err(e) = fs::copy(transcoded, &cached_path) {
            warn!(error = %e, "could not populate transcode cache");
            return;
        }

        let size = fs::metadata(&cached_path).map(|m| m.len()).unwrap_or(0);
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.index.files.insert(
            Self::key(fingerprint, target, bitrate),
            CachedFile {
                fingerprint: fingerprint.to_string(),
                source_format: source_format.to_string(),
                target_format: target.as_str().to_string(),
                filename,
                size,
                created,
                source_size,
                bitrate,
            },
        );
        self.save_index();
    }

    /// Drop every cached output for a fingerprint (the source content
    /// changed). Returns the number of entries removed.
    pub fn invalidate(&mut self, fingerprint: &str) -> usize {
        let keys: Vec<String> = self
            .index
            .files
            .iter()
            .filter(|(_, cached)| cached.fingerprint == fingerprint)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(cached) = self.index.files.remove(key) {
                let _ = fs::remove_file(self.files_dir.join(&cached.filename));
            }
        }
        if !keys.is_empty() {
            self.save_index();
            debug!(fingerprint = %fingerprint, removed = keys.len(), "cache invalidated");
        }
        keys.len()
    }

    /// Delete files present on disk but absent from the index.
    pub fn cleanup(&self) -> usize {
        let indexed: std::collections::HashSet<&str> = self
            .index
            .files
            .values()
            .map(|c| c.filename.as_str())
            .collect();

        let mut removed = 0;
        if let Ok(entries) = fs::read_dir(&self.files_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if !indexed.contains(name.to_string_lossy().as_ref())
                    && fs::remove_file(entry.path()).is_ok()
                {
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn entry_count(&self) -> usize {
        self.index.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn routing_table() {
        assert_eq!(target_for("mp3"), TranscodeTarget::Copy);
        assert_eq!(target_for("m4a"), TranscodeTarget::Copy);
        assert_eq!(target_for("flac"), TranscodeTarget::Alac);
        assert_eq!(target_for("aiff"), TranscodeTarget::Alac);
        assert_eq!(target_for("ogg"), TranscodeTarget::Aac);
        assert_eq!(target_for("wma"), TranscodeTarget::Aac);
        assert!(!needs_transcoding("mp3"));
        assert!(needs_transcoding("flac"));
    }

    #[test]
    fn cache_hit_miss_and_source_size_validation() {
        let dir = TempDir::new().unwrap();
        let mut cache = TranscodeCache::open(dir.path().join("cache")).unwrap();

        assert!(cache.get("fp", TranscodeTarget::Alac, 100, None).is_none());

        let transcoded = dir.path().join("out.m4a");
        fs::write(&transcoded, b"alac bytes").unwrap();
        cache.add("fp", &transcoded, "flac", TranscodeTarget::Alac, 100, None);

        let hit = cache.get("fp", TranscodeTarget::Alac, 100, None).unwrap();
        assert_eq!(fs::read(hit).unwrap(), b"alac bytes");

        // Different source size invalidates.
        assert!(cache.get("fp", TranscodeTarget::Alac, 999, None).is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn bitrate_distinguishes_aac_entries() {
        let dir = TempDir::new().unwrap();
        let mut cache = TranscodeCache::open(dir.path().join("cache")).unwrap();

        let transcoded = dir.path().join("out.m4a");
        fs::write(&transcoded, b"aac").unwrap();
        cache.add("fp", &transcoded, "ogg", TranscodeTarget::Aac, 50, Some(256));

        assert!(cache.get("fp", TranscodeTarget::Aac, 50, Some(128)).is_none());
        assert!(cache.get("fp", TranscodeTarget::Aac, 50, Some(256)).is_some());
    }

    #[test]
    fn invalidate_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let mut cache = TranscodeCache::open(dir.path().join("cache")).unwrap();

        let transcoded = dir.path().join("out.m4a");
        fs::write(&transcoded, b"x").unwrap();
        cache.add("fp", &transcoded, "flac", TranscodeTarget::Alac, 1, None);
        assert_eq!(cache.invalidate("fp"), 1);
        assert_eq!(cache.entry_count(), 0);

        // Orphan in files/ gets cleaned up.
        fs::write(dir.path().join("cache/files/zzz.m4a"), b"x").unwrap();
        assert_eq!(cache.cleanup(), 1);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        {
            let mut cache = TranscodeCache::open(&root).unwrap();
            let transcoded = dir.path().join("out.m4a");
            fs::write(&transcoded, b"x").unwrap();
            cache.add("fp", &transcoded, "flac", TranscodeTarget::Alac, 1, None);
        }
        let mut cache = TranscodeCache::open(&root).unwrap();
        assert!(cache.get("fp", TranscodeTarget::Alac, 1, None).is_some());
    }
}
