//! Body content search, reading message bodies from the archive file.
//!
//! This is the slow path: each candidate's bytes are read back from disk.
//! Narrow the candidates with a header filter first. Bodies are streamed in
//! buffer-sized chunks, so a huge message costs no more memory than a small
//! one.

use std::io::{self, BufRead};

use tracing::debug;

use crate::error::{MboxError, Result};
use crate::index::ArchiveIndex;
use crate::progress::{checkpoint, ProgressReporter};
use crate::store::reader::MessageStore;

use super::filter::FilterMode;

/// Words to look for in message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentQuery {
    /// Lowercased, non-empty words.
    words: Vec<String>,
    mode: FilterMode,
}

impl ContentQuery {
    pub fn new<I, S>(words: I, mode: FilterMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self { words, mode }
    }

    /// Split a comma-separated word list (`"invoice, unpaid"`).
    pub fn parse(input: &str, mode: FilterMode) -> Self {
        Self::new(input.split(','), mode)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// `Contains`: every word occurs. `NotContains`: no word occurs.
    /// Comparison is case-insensitive.
    pub fn matches_body(&self, body: &[u8]) -> bool {
        let mut matcher = BodyMatcher::new(&self.words);
        matcher.feed(body);
        self.verdict(&matcher)
    }

    fn verdict(&self, matcher: &BodyMatcher<'_>) -> bool {
        match self.mode {
            FilterMode::Contains => matcher.all_found(),
            FilterMode::NotContains => !matcher.any_found(),
        }
    }

    /// True once more body text cannot change the verdict.
    fn settled(&self, matcher: &BodyMatcher<'_>) -> bool {
        match self.mode {
            FilterMode::Contains => matcher.all_found(),
            FilterMode::NotContains => matcher.any_found(),
        }
    }
}

/// Tracks which words have been seen in a body fed chunk by chunk.
///
/// The tail of the previous chunk is kept and searched again with the next
/// one, so a word split across a chunk boundary is still found.
struct BodyMatcher<'q> {
    words: &'q [String],
    found: Vec<bool>,
    overlap: usize,
    window: Vec<u8>,
}

impl<'q> BodyMatcher<'q> {
    fn new(words: &'q [String]) -> Self {
        // Body text lowercasing to an n-byte word spans at most n chars of
        // at most 4 bytes each.
        let overlap = words.iter().map(String::len).max().unwrap_or(0) * 4;
        Self {
            words,
            found: vec![false; words.len()],
            overlap,
            window: Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        self.window.extend_from_slice(chunk);
        let text = String::from_utf8_lossy(&self.window).to_lowercase();
        for (word, found) in self.words.iter().zip(self.found.iter_mut()) {
            if !*found && text.contains(word.as_str()) {
                *found = true;
            }
        }
        let keep = self.window.len().min(self.overlap);
        self.window.drain(..self.window.len() - keep);
    }

    fn all_found(&self) -> bool {
        self.found.iter().all(|&f| f)
    }

    fn any_found(&self) -> bool {
        self.found.iter().any(|&f| f)
    }
}

/// Keep the `candidates` whose body satisfies `query`, in their given order.
///
/// Progress is reported in bytes of candidate messages read. An empty query
/// returns the candidates unchanged without touching the file. Unknown
/// sequences fail with `InvalidReference`.
pub fn search_content(
    store: &mut MessageStore,
    index: &ArchiveIndex,
    candidates: &[u64],
    query: &ContentQuery,
    progress: &mut dyn ProgressReporter,
) -> Result<Vec<u64>> {
    let records = candidates
        .iter()
        .map(|&seq| index.record(seq))
        .collect::<Result<Vec<_>>>()?;

    if query.is_empty() {
        return Ok(candidates.to_vec());
    }

    let total: u64 = records.iter().map(|r| r.len()).sum();
    let mut processed = 0u64;
    let mut results = Vec::new();

    checkpoint(progress, 0, total)?;
    for record in records {
        let mut reader = store.body_reader(record)?;
        let mut matcher = BodyMatcher::new(&query.words);
        let mut read = 0u64;
        while !query.settled(&matcher) {
            let chunk = match reader.fill_buf() {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MboxError::io(store.path(), e)),
            };
            if chunk.is_empty() {
                break;
            }
            matcher.feed(chunk);
            let n = chunk.len();
            reader.consume(n);
            read += n as u64;
            checkpoint(progress, processed + read.min(record.len()), total)?;
        }
        if query.verdict(&matcher) {
            results.push(record.sequence);
        }
        processed += record.len();
        checkpoint(progress, processed, total)?;
    }

    debug!(
        candidates = candidates.len(),
        matches = results.len(),
        words = query.words.len(),
        "Body search finished"
    );
    Ok(results)
}
