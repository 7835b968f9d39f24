//! Writing a rewrite plan: export to a new file, or atomic in-place replace.
//!
//! Both paths copy the planned byte ranges from the open source handle in
//! fixed-size chunks, checking the progress reporter after every chunk.
//!
//! In-place replace never opens the original for writing. The new content
//! goes to a temporary file next to it, which is synced and then renamed
//! over the original. Until that rename the original is untouched, and the
//! temporary file is removed on every failure path (it is deleted when the
//! `NamedTempFile` guard drops).

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::WriteConfig;
use crate::error::{MboxError, Result, WriteFailure};
use crate::model::record::ByteRange;
use crate::plan::RewritePlan;
use crate::progress::{checkpoint, ProgressReporter};

const MIN_BUFFER_SIZE: usize = 4096;

/// Copies planned byte ranges from an open archive into new files.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    buffer_size: usize,
    sync: bool,
}

/// Why a copy stopped.
#[derive(Debug)]
enum CopyError {
    Cancelled,
    Read(io::Error),
    Write(io::Error),
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new(&WriteConfig::default())
    }
}

impl ArchiveWriter {
    pub fn new(config: &WriteConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(MIN_BUFFER_SIZE),
            sync: config.sync,
        }
    }

    /// Write `plan` to a new file at `dest`, returning the bytes written.
    ///
    /// On an I/O failure the partial file is left where it is and
    /// `MboxError::Export` tells the caller to discard it. A cancelled
    /// export removes the partial file.
    pub fn export_to(
        &self,
        source: &File,
        source_path: &Path,
        plan: &RewritePlan,
        dest: &Path,
        progress: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        let started = Instant::now();
        info!(
            dest = %dest.display(),
            messages = plan.len(),
            bytes = plan.total_bytes(),
            "Exporting archive"
        );

        let mut out =
            File::create(dest).map_err(|e| MboxError::Export(WriteFailure::from_io(dest, e)))?;

        let ranges = plan_ranges(plan);
        let written = match self.copy_ranges(source, &ranges, &mut out, progress) {
            Ok(n) => n,
            Err(CopyError::Cancelled) => {
                drop(out);
                remove_partial(dest);
                return Err(MboxError::Cancelled);
            }
            Err(CopyError::Read(e)) => {
                return Err(MboxError::Export(WriteFailure::from_io(source_path, e)))
            }
            Err(CopyError::Write(e)) => {
                return Err(MboxError::Export(WriteFailure::from_io(dest, e)))
            }
        };

        self.finish(&mut out)
            .map_err(|e| MboxError::Export(WriteFailure::from_io(dest, e)))?;

        info!(
            bytes = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Export complete"
        );
        Ok(written)
    }

    /// Replace the file at `path` with the output of `plan`, atomically.
    ///
    /// `source` must be an open handle on `path`. `tag` is made part of the
    /// temporary file name so concurrent sessions never collide. Returns a
    /// read handle on the new file.
    ///
    /// Symlinks in `path` are resolved first: the link stays a link and its
    /// target is what gets rewritten.
    pub fn replace_in_place(
        &self,
        source: &File,
        path: &Path,
        plan: &RewritePlan,
        tag: &str,
        progress: &mut dyn ProgressReporter,
    ) -> Result<File> {
        let started = Instant::now();
        let target = fs::canonicalize(path).map_err(|e| replace_err(path, e))?;
        let path = target.as_path();
        let (dir, name) = split_path(path)?;
        info!(
            path = %path.display(),
            messages = plan.len(),
            bytes = plan.total_bytes(),
            "Rewriting archive in place"
        );

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{name}.{tag}."))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| replace_err(&dir, e))?;
        let temp_path = temp.path().to_path_buf();
        debug!(temp = %temp_path.display(), "Created temporary file");

        let ranges = plan_ranges(plan);
        match self.copy_ranges(source, &ranges, temp.as_file_mut(), progress) {
            Ok(_) => {}
            Err(CopyError::Cancelled) => {
                info!("In-place rewrite cancelled; original unchanged");
                return Err(MboxError::Cancelled);
            }
            Err(CopyError::Read(e)) => return Err(replace_err(path, e)),
            Err(CopyError::Write(e)) => return Err(replace_err(&temp_path, e)),
        }

        self.finish(temp.as_file_mut())
            .map_err(|e| replace_err(&temp_path, e))?;

        match source.metadata() {
            Ok(meta) => {
                if let Err(e) = temp.as_file().set_permissions(meta.permissions()) {
                    warn!(error = %e, "Could not copy permissions to rewritten archive");
                }
            }
            Err(e) => warn!(error = %e, "Could not read permissions of original archive"),
        }

        let reopened = temp.reopen().map_err(|e| replace_err(&temp_path, e))?;

        if let Err(e) = temp.persist(path) {
            // `e.file` drops here and deletes the temporary file.
            return Err(MboxError::Replace(WriteFailure::RenameFailed {
                from: temp_path,
                to: path.to_path_buf(),
                source: e.error,
            }));
        }

        if self.sync {
            sync_dir(&dir);
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "In-place rewrite complete"
        );
        Ok(reopened)
    }

    /// Copy the first `len` bytes of `source` to a new file at `dest`.
    ///
    /// Any failure or cancellation removes the partial copy.
    pub fn backup(
        &self,
        source: &File,
        source_path: &Path,
        len: u64,
        dest: &Path,
        progress: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        info!(dest = %dest.display(), bytes = len, "Writing backup");

        let mut out = File::create(dest).map_err(|e| MboxError::io(dest, e))?;
        let result = self
            .copy_ranges(source, &[ByteRange::new(0, len)], &mut out, progress)
            .and_then(|n| self.finish(&mut out).map(|_| n).map_err(CopyError::Write));

        match result {
            Ok(n) => Ok(n),
            Err(err) => {
                drop(out);
                remove_partial(dest);
                Err(match err {
                    CopyError::Cancelled => MboxError::Cancelled,
                    CopyError::Read(e) => MboxError::io(source_path, e),
                    CopyError::Write(e) => MboxError::io(dest, e),
                })
            }
        }
    }

    fn copy_ranges(
        &self,
        source: &File,
        ranges: &[ByteRange],
        out: &mut File,
        progress: &mut dyn ProgressReporter,
    ) -> std::result::Result<u64, CopyError> {
        let total: u64 = ranges.iter().map(ByteRange::len).sum();
        let mut buf = vec![0u8; self.buffer_size];
        let mut src = source;
        let mut written = 0u64;

        report(progress, 0, total)?;
        for range in ranges {
            src.seek(SeekFrom::Start(range.start))
                .map_err(CopyError::Read)?;
            let mut remaining = range.len();
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = match src.read(&mut buf[..want]) {
                    Ok(0) => {
                        return Err(CopyError::Read(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("archive ended before offset {}", range.end),
                        )))
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(CopyError::Read(e)),
                };
                out.write_all(&buf[..n]).map_err(CopyError::Write)?;
                remaining -= n as u64;
                written += n as u64;
                report(progress, written, total)?;
            }
        }
        Ok(written)
    }

    fn finish(&self, out: &mut File) -> io::Result<()> {
        out.flush()?;
        if self.sync {
            out.sync_all()?;
        }
        Ok(())
    }
}

fn replace_err(path: &Path, e: io::Error) -> MboxError {
    MboxError::Replace(WriteFailure::from_io(path, e))
}

fn plan_ranges(plan: &RewritePlan) -> Vec<ByteRange> {
    plan.entries().iter().map(|e| e.range).collect()
}

fn report(
    progress: &mut dyn ProgressReporter,
    done: u64,
    total: u64,
) -> std::result::Result<(), CopyError> {
    checkpoint(progress, done, total).map_err(|_| CopyError::Cancelled)
}

/// Directory and file name of `path`. A bare file name lives in `.`.
fn split_path(path: &Path) -> Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MboxError::InvalidPath(path.display().to_string()))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name))
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove partial output");
        }
    }
}

/// Make the rename durable. Best effort; not every platform can open a
/// directory for syncing.
fn sync_dir(dir: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "Directory sync failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::index::ArchiveIndex;
    use crate::parser::mbox::MboxScanner;
    use crate::plan::Selection;
    use crate::progress::ProgressFn;
    use std::io::Cursor;

    const DATA: &[u8] = b"From a@x\nSubject: one\n\n1\n\nFrom b@x\nSubject: two\n\n2\n\nFrom c@x\nSubject: three\n\n3\n";

    fn index_of(data: &[u8]) -> ArchiveIndex {
        MboxScanner::new(ScanConfig::default())
            .scan(Cursor::new(data), data.len() as u64, &mut ())
            .unwrap()
    }

    fn small_writer() -> ArchiveWriter {
        ArchiveWriter::new(&WriteConfig {
            buffer_size: 4096,
            sync: false,
        })
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn test_export_selected_messages() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("in.mbox");
        fs::write(&src_path, DATA).unwrap();
        let source = File::open(&src_path).unwrap();

        let index = index_of(DATA);
        let mut selection = Selection::new(index.len());
        selection.mark(&[1], false).unwrap();
        let plan = RewritePlan::build(&index, &selection);

        let dest = dir.path().join("out.mbox");
        let n = small_writer()
            .export_to(&source, &src_path, &plan, &dest, &mut ())
            .unwrap();

        let out = fs::read(&dest).unwrap();
        assert_eq!(n, out.len() as u64);
        let r0 = index.get(0).unwrap();
        let r2 = index.get(2).unwrap();
        let mut expected = DATA[r0.start as usize..r0.end as usize].to_vec();
        expected.extend_from_slice(&DATA[r2.start as usize..r2.end as usize]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_export_empty_plan_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("in.mbox");
        fs::write(&src_path, DATA).unwrap();
        let source = File::open(&src_path).unwrap();

        let dest = dir.path().join("out.mbox");
        small_writer()
            .export_to(&source, &src_path, &RewritePlan::default(), &dest, &mut ())
            .unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
    }

    #[test]
    fn test_export_cancel_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("in.mbox");
        fs::write(&src_path, DATA).unwrap();
        let source = File::open(&src_path).unwrap();

        let plan = RewritePlan::keep_all(&index_of(DATA));
        let dest = dir.path().join("out.mbox");
        let mut progress = ProgressFn::new(|_, _| false);
        let err = small_writer()
            .export_to(&source, &src_path, &plan, &dest, &mut progress)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dest.exists());
    }

    #[test]
    fn test_replace_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.mbox");
        fs::write(&path, DATA).unwrap();
        let source = File::open(&path).unwrap();

        let index = index_of(DATA);
        let mut selection = Selection::new(index.len());
        selection.mark(&[0, 2], false).unwrap();
        let plan = RewritePlan::build(&index, &selection);

        let mut reopened = small_writer()
            .replace_in_place(&source, &path, &plan, "1-1", &mut ())
            .unwrap();

        let r1 = index.get(1).unwrap();
        let expected = &DATA[r1.start as usize..r1.end as usize];
        assert_eq!(fs::read(&path).unwrap(), expected);

        let mut via_handle = Vec::new();
        reopened.read_to_end(&mut via_handle).unwrap();
        assert_eq!(via_handle, expected);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_replace_through_symlink_rewrites_target() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.mbox");
        fs::write(&real, DATA).unwrap();
        let link = dir.path().join("archive.mbox");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let source = File::open(&link).unwrap();

        let index = index_of(DATA);
        let mut selection = Selection::new(index.len());
        selection.mark(&[1], false).unwrap();
        let plan = RewritePlan::build(&index, &selection);
        small_writer()
            .replace_in_place(&source, &link, &plan, "1-4", &mut ())
            .unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        let rewritten = fs::read(&real).unwrap();
        assert_eq!(rewritten.len() as u64, plan.total_bytes());
        assert_eq!(fs::read(&link).unwrap(), rewritten);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_replace_failure_leaves_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.mbox");
        // The file shrank after it was indexed: copying hits end of file.
        let short = &DATA[..DATA.len() - 10];
        fs::write(&path, short).unwrap();
        let source = File::open(&path).unwrap();

        let plan = RewritePlan::keep_all(&index_of(DATA));
        let err = small_writer()
            .replace_in_place(&source, &path, &plan, "1-2", &mut ())
            .unwrap_err();

        assert!(matches!(err, MboxError::Replace(WriteFailure::Io { .. })), "got {err:?}");
        assert!(err.to_string().contains("Original file unchanged"));
        assert_eq!(fs::read(&path).unwrap(), short);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_replace_cancel_leaves_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.mbox");
        fs::write(&path, DATA).unwrap();
        let source = File::open(&path).unwrap();

        let mut selection = Selection::new(3);
        selection.mark(&[1], false).unwrap();
        let plan = RewritePlan::build(&index_of(DATA), &selection);
        let mut progress = ProgressFn::new(|done, _| done == 0);
        let err = small_writer()
            .replace_in_place(&source, &path, &plan, "1-3", &mut progress)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(fs::read(&path).unwrap(), DATA);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_backup_copies_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.mbox");
        fs::write(&path, DATA).unwrap();
        let source = File::open(&path).unwrap();

        let dest = dir.path().join("archive.mbox.bak");
        let n = small_writer()
            .backup(&source, &path, DATA.len() as u64, &dest, &mut ())
            .unwrap();
        assert_eq!(n, DATA.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), DATA);
    }

    #[test]
    fn test_backup_failure_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.mbox");
        fs::write(&path, DATA).unwrap();
        let source = File::open(&path).unwrap();

        let dest = dir.path().join("archive.mbox.bak");
        let err = small_writer()
            .backup(&source, &path, DATA.len() as u64 + 100, &dest, &mut ())
            .unwrap_err();
        assert!(matches!(err, MboxError::Io { .. }));
        assert!(!dest.exists());
    }
}
