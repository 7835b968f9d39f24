//! The in-memory message index: one [`MessageRecord`] per message, in file order.

pub mod builder;
pub mod stats;

use crate::config::HeaderMode;
use crate::error::{MboxError, Result};
use crate::model::record::{ByteRange, MessageRecord};
use crate::plan::RewritePlan;

/// Ordered, immutable list of message records for one archive file.
///
/// Built once by the scanner. Any change to the archive produces a new
/// index; records are never edited in place.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    records: Vec<MessageRecord>,
    file_size: u64,
    header_mode: HeaderMode,
}

impl ArchiveIndex {
    pub(crate) fn new(records: Vec<MessageRecord>, file_size: u64, header_mode: HeaderMode) -> Self {
        debug_assert!(records.iter().enumerate().all(|(i, r)| r.sequence == i as u64));
        debug_assert!(records.windows(2).all(|w| w[0].end == w[1].start));
        Self {
            records,
            file_size,
            header_mode,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of messages as a sequence-number bound.
    pub fn message_count(&self) -> u64 {
        self.records.len() as u64
    }

    /// Size in bytes of the file this index describes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn header_mode(&self) -> HeaderMode {
        self.header_mode
    }

    /// O(1) lookup by sequence number.
    pub fn get(&self, sequence: u64) -> Option<&MessageRecord> {
        usize::try_from(sequence)
            .ok()
            .and_then(|i| self.records.get(i))
    }

    /// Like [`get`](Self::get) but fails with `InvalidReference`.
    pub fn record(&self, sequence: u64) -> Result<&MessageRecord> {
        self.get(sequence).ok_or(MboxError::InvalidReference {
            sequence,
            count: self.message_count(),
        })
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageRecord> {
        self.records.iter()
    }

    /// The index of the file produced by writing `plan` from this archive.
    ///
    /// Kept records are renumbered from 0 and shifted to their new offsets;
    /// cached header values carry over unchanged.
    pub fn rebased(&self, plan: &RewritePlan) -> ArchiveIndex {
        let mut offset = 0u64;
        let records = plan
            .entries()
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let old = self.get(entry.sequence)?;
                let shift = |pos: u64| pos - old.start + offset;
                let record = MessageRecord {
                    sequence: i as u64,
                    start: offset,
                    end: offset + old.len(),
                    header_range: ByteRange::new(
                        shift(old.header_range.start),
                        shift(old.header_range.end),
                    ),
                    headers: old.headers.clone(),
                    has_delimiter: old.has_delimiter,
                };
                offset = record.end;
                Some(record)
            })
            .collect();
        ArchiveIndex::new(records, offset, self.header_mode)
    }
}

impl<'a> IntoIterator for &'a ArchiveIndex {
    type Item = &'a MessageRecord;
    type IntoIter = std::slice::Iter<'a, MessageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::parser::mbox::MboxScanner;
    use crate::plan::Selection;
    use std::io::Cursor;

    const DATA: &[u8] =
        b"From a@x\nSubject: one\n\nbody\n\nFrom b@x\nSubject: two\n\nbody\n\nFrom c@x\nSubject: three\n\nbody\n";

    fn index() -> ArchiveIndex {
        MboxScanner::new(ScanConfig::default())
            .scan(Cursor::new(DATA), DATA.len() as u64, &mut ())
            .unwrap()
    }

    #[test]
    fn test_lookup_by_sequence() {
        let index = index();
        assert_eq!(index.message_count(), 3);
        assert_eq!(index.get(1).unwrap().sequence, 1);
        assert!(index.get(3).is_none());
        assert!(matches!(
            index.record(7),
            Err(MboxError::InvalidReference { sequence: 7, count: 3 })
        ));
    }

    #[test]
    fn test_rebased_matches_rescan() {
        let index = index();
        let mut selection = Selection::new(index.len());
        selection.mark(&[1], false).unwrap();
        let plan = RewritePlan::build(&index, &selection);

        let mut written = Vec::new();
        for entry in plan.entries() {
            written.extend_from_slice(&DATA[entry.range.start as usize..entry.range.end as usize]);
        }

        let rebased = index.rebased(&plan);
        let rescanned = MboxScanner::new(ScanConfig::default())
            .scan(Cursor::new(&written), written.len() as u64, &mut ())
            .unwrap();

        assert_eq!(rebased.file_size(), written.len() as u64);
        assert_eq!(rebased.len(), rescanned.len());
        for (a, b) in rebased.iter().zip(rescanned.iter()) {
            assert_eq!(a.sequence, b.sequence);
            assert_eq!(a.range(), b.range());
            assert_eq!(a.header_range, b.header_range);
            assert_eq!(a.headers, b.headers);
        }
    }
}
