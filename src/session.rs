//! An open archive: index, read handle, selection and writer in one owned
//! value.
//!
//! The session holds the only handle the library keeps on the archive. It is
//! released when the session is closed or dropped.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MboxError, Result};
use crate::export::writer::ArchiveWriter;
use crate::index::builder::{build_index_from, open_archive_file};
use crate::index::stats::{ArchiveStats, StatsCollector};
use crate::index::ArchiveIndex;
use crate::model::record::{HeaderValues, MessageContent, MessageSummary};
use crate::plan::{RewritePlan, Selection};
use crate::progress::ProgressReporter;
use crate::search::filter::{CompiledFilter, FilterSet};
use crate::search::fulltext::{self, ContentQuery};
use crate::search::filter_index;
use crate::store::reader::MessageStore;

/// Bytes hashed from the start of the file for change detection.
const FINGERPRINT_HEAD: u64 = 4096;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What identifies the archive's on-disk state at the time it was indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
    head: [u8; 32],
}

impl Fingerprint {
    fn compute(file: &File) -> io::Result<Self> {
        let meta = file.metadata()?;
        let mut f = file;
        f.seek(SeekFrom::Start(0))?;
        let mut head = Vec::with_capacity(FINGERPRINT_HEAD as usize);
        f.take(FINGERPRINT_HEAD).read_to_end(&mut head)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            head: Sha256::digest(&head).into(),
        })
    }
}

/// Result of [`ArchiveSession::apply_in_place`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ApplyOutcome {
    pub kept: usize,
    pub removed: usize,
    pub old_size: u64,
    pub new_size: u64,
}

/// An open archive.
pub struct ArchiveSession {
    path: PathBuf,
    index: ArchiveIndex,
    store: MessageStore,
    selection: Selection,
    writer: ArchiveWriter,
    id: u64,
    fingerprint: Option<Fingerprint>,
}

impl ArchiveSession {
    /// Open and index the archive at `path`.
    ///
    /// An empty file is a valid archive with no messages.
    pub fn open(
        path: impl AsRef<Path>,
        config: &Config,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, file_size) = open_archive_file(&path)?;

        let fingerprint = match Fingerprint::compute(&file) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(error = %e, "Could not fingerprint archive; change detection disabled");
                None
            }
        };
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| MboxError::io(&path, e))?;

        let index = build_index_from(&file, file_size, &config.scan, progress)?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            path = %path.display(),
            session = id,
            messages = index.len(),
            "Archive opened"
        );

        Ok(Self {
            selection: Selection::new(index.len()),
            store: MessageStore::new(&path, file, config.session.header_cache_size),
            writer: ArchiveWriter::new(&config.write),
            path,
            index,
            id,
            fingerprint,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn message_count(&self) -> usize {
        self.index.len()
    }

    /// Process and session identity, unique among live sessions.
    pub fn session_tag(&self) -> String {
        format!("{}-{}", std::process::id(), self.id)
    }

    /// Summaries of the messages matching `filter` (all when `None`), in
    /// archive order.
    ///
    /// The iterator is lazy: lazily indexed headers are read as it advances.
    /// Call again to restart. An I/O error is yielded once and ends the
    /// iteration.
    pub fn list_messages(&mut self, filter: Option<&FilterSet>) -> MessageIter<'_> {
        MessageIter {
            filter: filter.filter(|f| !f.is_empty()).map(FilterSet::compile),
            session: self,
            next: 0,
        }
    }

    /// Sequence numbers matching `filter`, in archive order.
    pub fn filter(&mut self, filter: &FilterSet) -> Result<Vec<u64>> {
        filter_index(&self.index, filter, &mut self.store)
    }

    pub fn header_values(&mut self, sequence: u64) -> Result<HeaderValues> {
        let record = self.index.record(sequence)?;
        Ok(self.store.header_values(record)?.into_owned())
    }

    pub fn read_message(&mut self, sequence: u64) -> Result<MessageContent> {
        let record = self.index.record(sequence)?;
        self.store.read_message(record)
    }

    /// Keep (`true`) or remove (`false`) the listed messages. All or nothing.
    pub fn set_selection(&mut self, sequences: &[u64], selected: bool) -> Result<()> {
        self.selection.mark(sequences, selected)?;
        debug!(
            count = sequences.len(),
            selected,
            kept = self.selection.selected_count(),
            "Selection updated"
        );
        Ok(())
    }

    /// Keep exactly the listed messages and remove every other one.
    pub fn select_only(&mut self, sequences: &[u64]) -> Result<()> {
        let mut selection = Selection::new(self.index.len());
        selection.set_all(false);
        selection.mark(sequences, true)?;
        self.selection = selection;
        Ok(())
    }

    pub fn select_all(&mut self, selected: bool) {
        self.selection.set_all(selected);
    }

    pub fn build_plan(&self) -> RewritePlan {
        RewritePlan::build(&self.index, &self.selection)
    }

    /// Narrow `candidates` to the messages whose body satisfies `query`.
    pub fn search_content(
        &mut self,
        query: &ContentQuery,
        candidates: &[u64],
        progress: &mut dyn ProgressReporter,
    ) -> Result<Vec<u64>> {
        fulltext::search_content(&mut self.store, &self.index, candidates, query, progress)
    }

    /// Aggregate figures over every message.
    pub fn stats(&mut self, top_senders: usize) -> Result<ArchiveStats> {
        let mut collector = StatsCollector::new();
        for record in &self.index {
            let headers = self.store.header_values(record)?;
            collector.add(record, &headers);
        }
        Ok(collector.finish(top_senders))
    }

    /// Write the selected messages to a new file at `dest`.
    pub fn export_to(
        &mut self,
        dest: impl AsRef<Path>,
        progress: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        let dest = dest.as_ref();
        self.refuse_own_path(dest)?;
        self.verify_unchanged()?;
        let plan = self.build_plan();
        self.writer
            .export_to(self.store.file(), &self.path, &plan, dest, progress)
    }

    /// Rewrite the archive so it contains only the selected messages.
    ///
    /// The original stays intact until the new content is complete and
    /// synced; then it is atomically replaced. Afterwards the session
    /// describes the new file and every message is selected again.
    pub fn apply_in_place(&mut self, progress: &mut dyn ProgressReporter) -> Result<ApplyOutcome> {
        self.verify_unchanged()?;
        let plan = self.build_plan();
        let old_size = self.index.file_size();
        let outcome = ApplyOutcome {
            kept: plan.len(),
            removed: self.index.len() - plan.len(),
            old_size,
            new_size: plan.total_bytes(),
        };

        if outcome.removed == 0 {
            info!("No messages deselected; archive left as is");
            return Ok(outcome);
        }

        let tag = self.session_tag();
        let file = self
            .writer
            .replace_in_place(self.store.file(), &self.path, &plan, &tag, progress)?;

        self.index = self.index.rebased(&plan);
        self.store.replace_file(file);
        self.selection = Selection::new(self.index.len());
        self.fingerprint = match Fingerprint::compute(self.store.file()) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(error = %e, "Could not fingerprint rewritten archive");
                None
            }
        };

        info!(
            kept = outcome.kept,
            removed = outcome.removed,
            old_size,
            new_size = outcome.new_size,
            "Archive rewritten"
        );
        Ok(outcome)
    }

    /// Copy the whole archive to `dest` byte for byte.
    pub fn backup_to(
        &mut self,
        dest: impl AsRef<Path>,
        progress: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        let dest = dest.as_ref();
        self.refuse_own_path(dest)?;
        self.verify_unchanged()?;
        self.writer.backup(
            self.store.file(),
            &self.path,
            self.index.file_size(),
            dest,
            progress,
        )
    }

    /// Release the file handle.
    pub fn close(self) {
        debug!(path = %self.path.display(), session = self.id, "Archive closed");
    }

    fn refuse_own_path(&self, dest: &Path) -> Result<()> {
        if is_open_archive(dest, &self.path, self.store.file()) {
            return Err(MboxError::InvalidPath(format!(
                "'{}' is the open archive; use apply to rewrite it",
                dest.display()
            )));
        }
        Ok(())
    }

    /// Fail with `FileModified` if the file at our path is no longer the one
    /// we indexed.
    fn verify_unchanged(&self) -> Result<()> {
        let Some(expected) = &self.fingerprint else {
            return Ok(());
        };
        let current = File::open(&self.path).and_then(|f| Fingerprint::compute(&f));
        match current {
            Ok(fp) if fp == *expected => Ok(()),
            Ok(_) => {
                warn!(path = %self.path.display(), "Archive changed since it was indexed");
                Err(MboxError::FileModified(self.path.clone()))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Archive no longer readable");
                Err(MboxError::FileModified(self.path.clone()))
            }
        }
    }
}

/// True when `dest` reaches the file behind `open`, whether through the same
/// path, a symlink or a hard link.
#[cfg(unix)]
fn is_open_archive(dest: &Path, path: &Path, open: &File) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(dest), open.metadata()) {
        (Ok(d), Ok(o)) => d.dev() == o.dev() && d.ino() == o.ino(),
        (Err(_), _) => false,
        (Ok(_), Err(_)) => same_path(dest, path),
    }
}

#[cfg(not(unix))]
fn is_open_archive(dest: &Path, path: &Path, _open: &File) -> bool {
    same_path(dest, path)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Iterator returned by [`ArchiveSession::list_messages`].
pub struct MessageIter<'s> {
    session: &'s mut ArchiveSession,
    filter: Option<CompiledFilter>,
    next: usize,
}

impl Iterator for MessageIter<'_> {
    type Item = Result<MessageSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        let session = &mut *self.session;
        while let Some(record) = session.index.records().get(self.next) {
            self.next += 1;
            let headers = match session.store.header_values(record) {
                Ok(h) => h,
                Err(e) => {
                    self.next = session.index.len();
                    return Some(Err(e));
                }
            };
            if self.filter.as_ref().is_none_or(|f| f.matches(&headers)) {
                return Some(Ok(MessageSummary::new(record, &headers)));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.session.index.len().saturating_sub(self.next);
        match self.filter {
            Some(_) => (0, Some(remaining)),
            None => (remaining, Some(remaining)),
        }
    }
}
