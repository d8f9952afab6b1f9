//! Atomic file replacement.
//!
//! Every file the tree writes goes through a temporary sibling that is synced
//! and then renamed over the destination, so a reader never observes a torn
//! file and an interrupted write leaves the previous version in place.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::errors::{IoContext, StrataError, StrataResult};

/// Streams the output of `write` into a temp file and renames it to `path`.
pub(crate) fn write_atomic_with<F>(path: &Path, write: F) -> StrataResult<()>
where
    F: FnOnce(&mut dyn Write) -> StrataResult<()>,
{
    let parent = path
        .parent()
        .ok_or_else(|| StrataError::InvalidConfig(format!("{:?} has no parent directory", path)))?;
    fs::create_dir_all(parent).at(parent)?;

    let temp = NamedTempFile::new_in(parent).at(parent)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        write(&mut writer)?;
        writer.flush().at(path)?;
    }
    temp.as_file().sync_all().at(path)?;
    temp.persist(path).map_err(|e| StrataError::io(path, e.error))?;
    Ok(())
}

/// Atomically replaces `path` with `bytes`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StrataResult<()> {
    write_atomic_with(path, |w| w.write_all(bytes).at(path))
}

/// Reads a whole file, attaching the path to any failure.
pub(crate) fn read_all(path: &Path) -> StrataResult<Vec<u8>> {
    fs::read(path).at(path)
}

/// Best-effort removal of a file or directory tree that is no longer
/// referenced. Failures are logged and otherwise ignored.
pub(crate) fn remove_stale(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => log::debug!("Removed stale {:?}", path),
        Err(e) => log::warn!("Failed to remove stale {:?}: {}", path, e),
    }
}
