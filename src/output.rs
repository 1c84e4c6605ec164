//! Output files are written to a temporary path next to the destination
//! and renamed into place once complete.

use std::io;
use std::path::Path;
use tempfile::TempPath;

/// Reserve a temporary file in the directory that will hold `output`.
///
/// The file is removed when the returned path is dropped without being
/// persisted.
pub fn staging_path(output: &Path) -> io::Result<TempPath> {
    let dir = output
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file = tempfile::Builder::new()
        .prefix(".shrink-pdf-")
        .suffix(".pdf")
        .tempfile_in(dir)?;
    Ok(file.into_temp_path())
}

/// Move a finished staging file to its destination.
pub fn persist(staged: TempPath, output: &Path) -> io::Result<()> {
    staged.persist(output).map_err(|e| e.error)
}
