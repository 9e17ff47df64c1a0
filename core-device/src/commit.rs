//! Atomic file commits.
//!
//! The database and the mapping file are both persisted with the same
//! discipline: stage into a temp file in the destination directory, fsync,
//! then rename over the target. The previous database is copied to a backup
//! before the rename.

use crate::error::{DeviceError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Write `bytes` to `path` atomically (temp file + fsync + rename).
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| DeviceError::AtomicWriteFailed {
            path: path.to_path_buf(),
            message: "destination has no parent directory".into(),
        })?;
    fs::create_dir_all(dir)?;

    let failed = |e: &dyn std::fmt::Display| DeviceError::AtomicWriteFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| failed(&e))?;
    tmp.write_all(bytes).map_err(|e| failed(&e))?;
    tmp.flush().map_err(|e| failed(&e))?;
    tmp.as_file().sync_all().map_err(|e| failed(&e))?;

    tmp.persist(path).map_err(|e| failed(&e))?;
    debug!(path = %path.display(), len = bytes.len(), "atomic write committed");
    Ok(())
}

/// Copy the current `path` to `backup` (when it exists), then atomically
/// replace `path` with `bytes`. The backup is taken before the rename so a
/// failed replace leaves both the original and its copy intact.
pub fn backup_and_replace(path: &Path, backup: &Path, bytes: &[u8]) -> Result<()> {
    if path.exists() {
        fs::copy(path, backup).map_err(|e| DeviceError::AtomicWriteFailed {
            path: backup.to_path_buf(),
            message: format!("backup copy failed: {e}"),
        })?;
    }
    atomic_write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("iTunesDB");

        atomic_write(&target, b"first").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first");

        atomic_write(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn backup_keeps_previous_contents() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("iTunesDB");
        let backup = dir.path().join("iTunesDB.backup");

        atomic_write(&target, b"old database").unwrap();
        backup_and_replace(&target, &backup, b"new database").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new database");
        assert_eq!(fs::read(&backup).unwrap(), b"old database");
    }

    #[test]
    fn first_write_needs_no_backup_source() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("iTunesDB");
        let backup = dir.path().join("iTunesDB.backup");

        backup_and_replace(&target, &backup, b"fresh").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"fresh");
        assert!(!backup.exists());
    }
}
