//! Centralized error types for mboxprune.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mboxprune library.
#[derive(Error, Debug)]
pub enum MboxError {
    /// The archive could not be opened.
    #[error(transparent)]
    Open(#[from] OpenError),

    /// Reading the archive failed part-way through the scan. No index is published.
    #[error("I/O error while scanning at offset {offset}: {source}")]
    Scan { offset: u64, source: io::Error },

    /// A sequence number does not name a message in the index.
    #[error("Message #{sequence} does not exist (archive has {count} messages)")]
    InvalidReference { sequence: u64, count: u64 },

    /// Writing a new archive failed.
    #[error("Export failed: {0}. Nothing changed; the output path may contain partial data, discard it")]
    Export(WriteFailure),

    /// Rewriting the original archive failed before the final rename.
    #[error("In-place rewrite failed: {0}. Original file unchanged")]
    Replace(WriteFailure),

    /// The user cancelled the operation.
    #[error("Operation cancelled by user")]
    Cancelled,

    /// The MBOX file has changed since the index was built.
    #[error("File has changed since it was indexed: {0}")]
    FileModified(PathBuf),

    /// An invalid path was provided.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Failures of `open`.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("MBOX file not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Cannot read '{path}': {source}")]
    Unreadable { path: PathBuf, source: io::Error },
}

/// Failures of export and in-place rewrite.
#[derive(Error, Debug)]
pub enum WriteFailure {
    #[error("I/O error on '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("disk full while writing '{path}'")]
    DiskFull { path: PathBuf, source: io::Error },

    #[error("could not rename '{from}' over '{to}': {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Convenience alias for `Result<T, MboxError>`.
pub type Result<T> = std::result::Result<T, MboxError>;

impl MboxError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for [`MboxError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl OpenError {
    /// Classify an `io::Error` raised while opening `path`.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Unreadable { path, source },
        }
    }
}

impl WriteFailure {
    /// Classify an `io::Error` raised while writing `path`.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::StorageFull {
            Self::DiskFull { path, source }
        } else {
            Self::Io { path, source }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_classification() {
        let e = OpenError::from_io("a.mbox", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, OpenError::NotFound(_)));
        let e = OpenError::from_io("a.mbox", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(e, OpenError::PermissionDenied(_)));
        let e = OpenError::from_io("a.mbox", io::Error::from(io::ErrorKind::InvalidData));
        assert!(matches!(e, OpenError::Unreadable { .. }));
    }

    #[test]
    fn test_disk_full_classification() {
        let e = WriteFailure::from_io("out.mbox", io::Error::from(io::ErrorKind::StorageFull));
        assert!(matches!(e, WriteFailure::DiskFull { .. }));
        let e = WriteFailure::from_io("out.mbox", io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(e, WriteFailure::Io { .. }));
    }

    #[test]
    fn test_user_visible_guarantees() {
        let failure = WriteFailure::from_io("x", io::Error::from(io::ErrorKind::Other));
        let msg = MboxError::Replace(failure).to_string();
        assert!(msg.contains("Original file unchanged"));

        let failure = WriteFailure::from_io("x", io::Error::from(io::ErrorKind::Other));
        let msg = MboxError::Export(failure).to_string();
        assert!(msg.contains("discard it"));
    }
}
