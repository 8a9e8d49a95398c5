//! Atomic file replacement
//!
//! Data goes to a temporary file in the destination directory which is synced
//! and then renamed over the destination. A failure at any point drops the
//! temporary file, so the destination either keeps its old content or does not
//! exist.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{IoContext, VdbResult};

/// Write `data` to `path`, replacing any existing file atomically
pub fn atomic_write(path: &Path, data: &[u8]) -> VdbResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = NamedTempFile::new_in(dir).io_context("create temporary file in", dir)?;
    temp.write_all(data).io_context("write", temp.path())?;
    temp.as_file().sync_all().io_context("sync", temp.path())?;
    temp.persist(path)
        .map_err(|e| e.error)
        .io_context("replace", path)?;

    log::debug!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}
