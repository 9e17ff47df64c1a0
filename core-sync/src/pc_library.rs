//! PC-side library scanner.
//!
//! Walks the library root for audio files, reads tags through the host's
//! [`MetadataProvider`], resolves each file's acoustic fingerprint, and
//! hashes any embedded artwork for change detection.

use crate::error::Result;
use crate::fingerprint::{resolve_fingerprint, Fingerprinter};
use bridge_traits::{AudioMetadata, MetadataProvider};
use core_db::artwork::art_hash;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Audio extensions the scanner picks up.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "m4p", "aac", "flac", "wav", "aif", "aiff", "ogg", "opus", "wma", "alac",
];

/// Secondary identity key: `lowercase(trim(album))`. Fingerprint alone
/// collapses the greatest-hits case; the album key separates the same
/// recording on different albums.
pub fn album_key(album: &str) -> String {
    album.trim().to_lowercase()
}

/// A music file on the PC with everything the diff engine needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PcTrack {
    pub path: PathBuf,
    /// Relative to the library root, used as the collision tiebreaker hint.
    pub relative_path: String,
    /// Lowercased extension without the dot.
    pub extension: String,
    pub size: u64,
    /// Modification time, Unix seconds.
    pub mtime: i64,
    pub metadata: AudioMetadata,
    pub fingerprint: String,
    /// MD5 of embedded artwork bytes, `None` when the file has none.
    pub art_hash: Option<String>,
}

impl PcTrack {
    pub fn album_key(&self) -> String {
        album_key(self.metadata.album.as_deref().unwrap_or(""))
    }

    pub fn rating(&self) -> u8 {
        self.metadata.rating.unwrap_or(0)
    }

    pub fn title_or_filename(&self) -> String {
        self.metadata
            .title
            .clone()
            .unwrap_or_else(|| {
                self.path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    /// Human-readable `Artist - Title` for reports and logs.
    pub fn describe(&self) -> String {
        format!(
            "{} - {}",
            self.metadata.artist.as_deref().unwrap_or("Unknown"),
            self.title_or_filename()
        )
    }
}

/// Result of a library scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub tracks: Vec<PcTrack>,
    /// Files whose fingerprint could not be computed; they are skipped and
    /// reported on the plan.
    pub fingerprint_errors: Vec<(PathBuf, String)>,
}

/// Scanner over one library root.
pub struct PcLibrary {
    root: PathBuf,
}

impl PcLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_audio(path: &Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                AUDIO_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    /// Walk the root and build [`PcTrack`]s. Files the provider cannot read
    /// are skipped with a warning; fingerprint failures are collected.
    pub fn scan(
        &self,
        provider: &dyn MetadataProvider,
        fingerprinter: &dyn Fingerprinter,
        write_fingerprint_tags: bool,
    ) -> Result<ScanResult> {
        let mut result = ScanResult::default();

        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| Self::is_audio(path))
            .collect();
        files.sort();

        for path in files {
            let stat = match std::fs::metadata(&path) {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stat failed, skipping");
                    continue;
                }
            };

            let metadata = match provider.read(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "tag read failed, skipping");
                    continue;
                }
            };

            let fingerprint = match resolve_fingerprint(
                provider,
                fingerprinter,
                &path,
                write_fingerprint_tags,
            ) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    result.fingerprint_errors.push((path.clone(), e.to_string()));
                    continue;
                }
            };

            let art = provider.embedded_artwork(&path).unwrap_or_default();
            let art_hash = art.as_deref().map(art_hash);

            let mtime = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            let relative_path = path
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.to_string_lossy().into_owned());

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();

            result.tracks.push(PcTrack {
                path,
                relative_path,
                extension,
                size: stat.len(),
                mtime,
                metadata,
                fingerprint,
                art_hash,
            });
        }

        debug!(
            tracks = result.tracks.len(),
            fingerprint_errors = result.fingerprint_errors.len(),
            "library scan finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn album_key_normalizes() {
        assert_eq!(album_key("  Greatest Hits "), "greatest hits");
        assert_eq!(album_key("OK Computer"), "ok computer");
        assert_eq!(album_key(""), "");
    }

    #[test]
    fn audio_extension_filter() {
        assert!(PcLibrary::is_audio(Path::new("/m/a.mp3")));
        assert!(PcLibrary::is_audio(Path::new("/m/a.FLAC")));
        assert!(!PcLibrary::is_audio(Path::new("/m/cover.jpg")));
        assert!(!PcLibrary::is_audio(Path::new("/m/noext")));
    }
}
