//! Opening an archive file and building its index.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::error::{OpenError, Result};
use crate::index::ArchiveIndex;
use crate::parser::mbox::MboxScanner;
use crate::progress::ProgressReporter;

/// Open `path` for reading and return the handle with the file's length.
///
/// Maps failures onto [`OpenError`]: missing file, permission problems, and
/// anything that is not a readable regular file.
pub fn open_archive_file(path: &Path) -> Result<(File, u64)> {
    let file = File::open(path).map_err(|e| OpenError::from_io(path, e))?;
    let metadata = file.metadata().map_err(|e| OpenError::from_io(path, e))?;
    if !metadata.is_file() {
        return Err(OpenError::Unreadable {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        }
        .into());
    }
    Ok((file, metadata.len()))
}

/// Scan an already-open archive handle from its current position (the start).
pub fn build_index_from(
    file: &File,
    file_size: u64,
    config: &ScanConfig,
    progress: &mut dyn ProgressReporter,
) -> Result<ArchiveIndex> {
    let started = Instant::now();
    debug!(
        file_size,
        header_mode = ?config.header_mode,
        strict = config.strict_boundaries,
        "Scanning archive"
    );

    let index = MboxScanner::new(config.clone()).scan(file, file_size, progress)?;

    info!(
        messages = index.len(),
        bytes = index.file_size(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Index built"
    );
    Ok(index)
}

/// Open `path` and build its index in one step.
///
/// The file handle is closed when the scan finishes. Use
/// [`ArchiveSession::open`](crate::session::ArchiveSession::open) to keep
/// it for reading messages and writing output.
pub fn build_index(
    path: &Path,
    config: &ScanConfig,
    progress: &mut dyn ProgressReporter,
) -> Result<ArchiveIndex> {
    info!(path = %path.display(), "Building index");
    let (file, file_size) = open_archive_file(path)?;
    build_index_from(&file, file_size, config, progress)
}
