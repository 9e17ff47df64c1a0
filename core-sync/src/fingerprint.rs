//! Acoustic-fingerprint identity.
//!
//! The fingerprint is the primary key for track identity: re-tagging,
//! renaming, and format changes leave it untouched; only different audio
//! content produces a different fingerprint.
//!
//! Computation shells out to Chromaprint's `fpcalc -raw <path>` and parses
//! the `FINGERPRINT=` line. Computed fingerprints are stored back into the
//! source file's tags so later runs read instead of re-running the tool.

use crate::error::{Result, SyncError};
use crate::proc::{find_tool, run_with_timeout};
use bridge_traits::MetadataProvider;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_FINGERPRINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces a fingerprint for an audio file.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, path: &Path) -> Result<String>;

    /// Whether the underlying tool is usable; checked once pre-flight.
    fn available(&self) -> bool;
}

/// `fpcalc`-backed fingerprinter.
pub struct FpcalcRunner {
    binary: Option<PathBuf>,
    timeout: Duration,
}

impl FpcalcRunner {
    /// Locate `fpcalc` on the `PATH`.
    pub fn locate() -> Self {
        Self::with_timeout(DEFAULT_FINGERPRINT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            binary: find_tool("fpcalc"),
            timeout,
        }
    }

    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            binary: Some(binary),
            timeout,
        }
    }
}

impl Fingerprinter for FpcalcRunner {
    fn fingerprint(&self, path: &Path) -> Result<String> {
        let binary = self.binary.as_ref().ok_or_else(|| {
            SyncError::PreflightMissingTool("fpcalc (Chromaprint)".to_string())
        })?;

        let mut cmd = Command::new(binary);
        cmd.arg("-raw").arg(path);

        let output = run_with_timeout(cmd, self.timeout).map_err(|e| SyncError::Fingerprint {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(SyncError::Fingerprint {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(fingerprint) = line.strip_prefix("FINGERPRINT=") {
                let fingerprint = fingerprint.trim();
                if !fingerprint.is_empty() {
                    return Ok(fingerprint.to_string());
                }
            }
        }

        Err(SyncError::Fingerprint {
            path: path.to_path_buf(),
            message: "no FINGERPRINT line in fpcalc output".to_string(),
        })
    }

    fn available(&self) -> bool {
        self.binary.is_some()
    }
}

/// Tag-first fingerprint lookup: read the stored tag, compute on miss, and
/// optionally store the result back.
pub fn resolve_fingerprint(
    provider: &dyn MetadataProvider,
    fingerprinter: &dyn Fingerprinter,
    path: &Path,
    write_back: bool,
) -> Result<String> {
    match provider.read_fingerprint_tag(path) {
        Ok(Some(fingerprint)) if !fingerprint.is_empty() => {
            debug!(path = %path.display(), "fingerprint read from tags");
            return Ok(fingerprint);
        }
        Ok(_) => {}
        Err(e) => debug!(path = %path.display(), error = %e, "fingerprint tag unreadable"),
    }

    let fingerprint = fingerprinter.fingerprint(path)?;

    if write_back {
        if let Err(e) = provider.write_fingerprint_tag(path, &fingerprint) {
            warn!(path = %path.display(), error = %e, "could not store fingerprint tag");
        }
    }

    Ok(fingerprint)
}
