//! Keep/remove selection and the rewrite plan derived from it.

use crate::error::{MboxError, Result};
use crate::index::ArchiveIndex;
use crate::model::record::ByteRange;

/// Keep/remove flag per sequence number. Every message starts out kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    flags: Vec<bool>,
}

impl Selection {
    pub fn new(len: usize) -> Self {
        Self {
            flags: vec![true; len],
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Set the flag of every listed sequence to `selected`.
    ///
    /// All sequences are validated before any flag changes: one out-of-range
    /// sequence fails the whole call with `InvalidReference` and leaves the
    /// selection as it was. Repeating a call has no further effect.
    pub fn mark(&mut self, sequences: &[u64], selected: bool) -> Result<()> {
        let count = self.flags.len() as u64;
        if let Some(&bad) = sequences.iter().find(|&&s| s >= count) {
            return Err(MboxError::InvalidReference {
                sequence: bad,
                count,
            });
        }
        for &sequence in sequences {
            self.flags[sequence as usize] = selected;
        }
        Ok(())
    }

    pub fn set_all(&mut self, selected: bool) {
        self.flags.fill(selected);
    }

    /// `false` for out-of-range sequences.
    pub fn is_selected(&self, sequence: u64) -> bool {
        usize::try_from(sequence)
            .ok()
            .and_then(|i| self.flags.get(i))
            .copied()
            .unwrap_or(false)
    }

    pub fn selected_count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    /// Selected sequence numbers in ascending order.
    pub fn selected(&self) -> impl Iterator<Item = u64> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, &f)| f)
            .map(|(i, _)| i as u64)
    }
}

/// One kept message: its original sequence and byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub sequence: u64,
    pub range: ByteRange,
}

/// Byte ranges to copy, in ascending sequence order.
///
/// Each range is a whole message including its delimiter line, so the
/// concatenation is a valid archive. An empty plan produces an empty file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewritePlan {
    entries: Vec<PlanEntry>,
}

impl RewritePlan {
    pub fn build(index: &ArchiveIndex, selection: &Selection) -> Self {
        debug_assert_eq!(index.len(), selection.len());
        let entries = index
            .iter()
            .filter(|record| selection.is_selected(record.sequence))
            .map(|record| PlanEntry {
                sequence: record.sequence,
                range: record.range(),
            })
            .collect();
        Self { entries }
    }

    /// Plan that copies every message of `index`.
    pub fn keep_all(index: &ArchiveIndex) -> Self {
        Self::build(index, &Selection::new(index.len()))
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the output file.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.range.len()).sum()
    }
}
