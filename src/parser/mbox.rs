//! Streaming MBOX boundary scanner.
//!
//! Reads the archive once, front to back, through a fixed-size buffer and
//! records where every message starts and ends. Lines are never fully
//! buffered: only the first few bytes (enough to recognize a delimiter) are
//! copied, plus header lines up to the per-message header budget when headers
//! are parsed eagerly. Peak memory is the read buffer, one header block, and
//! the index itself.
//!
//! A delimiter is a line that starts, at column 0, with `From` followed by a
//! space or tab. Body lines that merely look like one must have been escaped
//! by the producer (`>From `); the scanner does not second-guess that.

use std::io::{self, BufRead, BufReader, Read};

use tracing::{debug, warn};

use crate::config::{HeaderMode, ScanConfig};
use crate::error::{MboxError, Result};
use crate::index::ArchiveIndex;
use crate::model::record::{ByteRange, MessageRecord};
use crate::parser::header;
use crate::progress::{checkpoint, ProgressReporter};

pub(crate) const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Bytes of each line needed to recognize a delimiter: BOM + `From` + one
/// whitespace byte.
const PREFIX_LEN: usize = 8;

/// Smallest read buffer the scanner will use, whatever the configuration says.
const MIN_BUFFER_SIZE: usize = 4096;

/// Single-pass MBOX scanner.
///
/// ```rust,ignore
/// let file = File::open(path)?;
/// let len = file.metadata()?.len();
/// let index = MboxScanner::new(ScanConfig::default()).scan(&file, len, &mut ())?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MboxScanner {
    config: ScanConfig,
}

impl MboxScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Scan `reader` (expected to hold `total_len` bytes) and build the index.
    ///
    /// Progress is reported and cancellation checked each time the read
    /// buffer is refilled. On any error or cancellation nothing is returned
    /// but the error; a partial index is never produced.
    pub fn scan<R: Read>(
        &self,
        reader: R,
        total_len: u64,
        progress: &mut dyn ProgressReporter,
    ) -> Result<ArchiveIndex> {
        let buffer_size = self.config.read_buffer_size.max(MIN_BUFFER_SIZE);
        let eager = self.config.header_mode == HeaderMode::Eager;
        let max_header = self.config.max_header_bytes as u64;

        let mut lines = LineReader::new(reader, buffer_size, total_len);
        let mut line: Vec<u8> = Vec::with_capacity(4096);
        let mut records: Vec<MessageRecord> = Vec::new();
        let mut current: Option<PendingRecord> = None;
        let mut prev_blank = true;

        loop {
            let cap = match &current {
                Some(pending) if eager => pending.header_budget(max_header).max(PREFIX_LEN),
                _ => PREFIX_LEN,
            };
            let line_start = lines.offset();
            let info = lines.next_line(&mut line, cap, progress)?;
            if info.len == 0 {
                break;
            }

            let boundary = is_delimiter(&line, line_start == 0)
                && (!self.config.strict_boundaries || prev_blank);

            if boundary {
                if let Some(pending) = current.take() {
                    records.push(pending.finish(records.len() as u64, line_start, eager));
                }
                current = Some(PendingRecord::new(line_start, line_start + info.len, true));
            } else {
                let pending = current.get_or_insert_with(|| {
                    warn!(
                        offset = line_start,
                        "Data before the first 'From ' delimiter; keeping it as message 0"
                    );
                    PendingRecord::new(line_start, line_start, false)
                });
                pending.feed(&line, line_start, info, max_header, eager);
            }

            prev_blank = info.blank;
        }

        let end = lines.offset();
        if let Some(pending) = current.take() {
            records.push(pending.finish(records.len() as u64, end, eager));
        }

        if end != total_len {
            debug!(
                expected = total_len,
                actual = end,
                "Stream length differs from the announced length"
            );
        }
        checkpoint(progress, end, total_len.max(end))?;

        Ok(ArchiveIndex::new(records, end, self.config.header_mode))
    }
}

/// Length and blankness of one physical line.
#[derive(Debug, Clone, Copy)]
struct LineInfo {
    /// Full length of the line including its terminator (0 at EOF).
    len: u64,
    /// True when the line holds only spaces, tabs, CR and LF.
    blank: bool,
}

/// Line splitter over a `BufReader` that tracks absolute offsets.
struct LineReader<R> {
    reader: BufReader<R>,
    offset: u64,
    total: u64,
}

impl<R: Read> LineReader<R> {
    fn new(reader: R, buffer_size: usize, total: u64) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, reader),
            offset: 0,
            total,
        }
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    /// Consume the next line, copying at most `cap` of its bytes into `buf`.
    fn next_line(
        &mut self,
        buf: &mut Vec<u8>,
        cap: usize,
        progress: &mut dyn ProgressReporter,
    ) -> Result<LineInfo> {
        buf.clear();
        let mut len: u64 = 0;
        let mut blank = true;

        loop {
            if self.reader.buffer().is_empty() {
                checkpoint(progress, self.offset + len, self.total)?;
            }
            let chunk = match self.reader.fill_buf() {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(MboxError::Scan {
                        offset: self.offset + len,
                        source,
                    })
                }
            };
            if chunk.is_empty() {
                break; // EOF
            }

            let (take, complete) = match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (chunk.len(), false),
            };
            let room = cap.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..take.min(room)]);
            blank = blank && chunk[..take].iter().all(|&b| is_blank_byte(b));

            self.reader.consume(take);
            len += take as u64;
            if complete {
                break;
            }
        }

        self.offset += len;
        Ok(LineInfo { len, blank })
    }
}

/// A record whose end is not known yet.
struct PendingRecord {
    start: u64,
    header_start: u64,
    header_end: Option<u64>,
    header_buf: Vec<u8>,
    has_delimiter: bool,
}

impl PendingRecord {
    fn new(start: u64, header_start: u64, has_delimiter: bool) -> Self {
        Self {
            start,
            header_start,
            header_end: None,
            header_buf: Vec::new(),
            has_delimiter,
        }
    }

    /// Header bytes still allowed before the scan gives up on this message.
    fn header_budget(&self, max_header: u64) -> usize {
        if self.header_end.is_some() {
            return 0;
        }
        max_header.saturating_sub(self.header_buf.len() as u64) as usize
    }

    fn feed(&mut self, line: &[u8], line_start: u64, info: LineInfo, max_header: u64, eager: bool) {
        if self.header_end.is_some() {
            return;
        }
        if info.blank {
            self.header_end = Some(line_start);
            return;
        }
        let used = line_start - self.header_start;
        if used + info.len > max_header {
            debug!(
                offset = self.start,
                max_header, "Header scan limit reached; remaining headers not indexed"
            );
            self.header_end = Some(line_start);
            return;
        }
        if eager {
            self.header_buf.extend_from_slice(line);
        }
    }

    fn finish(self, sequence: u64, end: u64, eager: bool) -> MessageRecord {
        let header_end = self.header_end.unwrap_or(end);
        MessageRecord {
            sequence,
            start: self.start,
            end,
            header_range: ByteRange::new(self.header_start, header_end),
            headers: eager.then(|| header::parse_header_values(&self.header_buf)),
            has_delimiter: self.has_delimiter,
        }
    }
}

/// Check whether a line is an MBOX delimiter (`From` + space/tab at column 0).
///
/// A UTF-8 BOM is skipped only for the very first line of the file.
pub fn is_delimiter(line: &[u8], at_file_start: bool) -> bool {
    let line = if at_file_start {
        line.strip_prefix(BOM).unwrap_or(line)
    } else {
        line
    };
    line.starts_with(b"From") && matches!(line.get(4), Some(b' ' | b'\t'))
}

/// A line made only of spaces, tabs and its terminator.
pub(crate) fn is_blank_line(line: &[u8]) -> bool {
    line.iter().all(|&b| is_blank_byte(b))
}

fn is_blank_byte(b: u8) -> bool {
    matches!(b, b'\n' | b'\r' | b' ' | b'\t')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scan_with(data: &[u8], config: ScanConfig) -> ArchiveIndex {
        MboxScanner::new(config)
            .scan(Cursor::new(data), data.len() as u64, &mut ())
            .unwrap()
    }

    fn scan(data: &[u8]) -> ArchiveIndex {
        scan_with(data, ScanConfig::default())
    }

    fn rebuild(data: &[u8], index: &ArchiveIndex) -> Vec<u8> {
        let mut out = Vec::new();
        for r in index.iter() {
            out.extend_from_slice(&data[r.start as usize..r.end as usize]);
        }
        out
    }

    const THREE: &[u8] = b"From a@x Mon Jan  1 00:00:00 2024\nSubject: Invoice\nFrom: a@x\n\nbody one\n\n\
From b@x Mon Jan  1 00:00:00 2024\nSubject: Spam offer\n\nbody two\n\n\
From c@x Mon Jan  1 00:00:00 2024\nSubject: Invoice receipt\nTo: z@y\n\nbody three\n";

    #[test]
    fn test_is_delimiter() {
        assert!(is_delimiter(b"From user@example.com Thu Jan 01 00:00:00 2024\n", false));
        assert!(is_delimiter(b"From\tuser@example.com\n", false));
        assert!(!is_delimiter(b"from user@example.com\n", false)); // lowercase
        assert!(!is_delimiter(b">From user@example.com\n", false)); // escaped
        assert!(!is_delimiter(b"Fromage is cheese\n", false));
        assert!(!is_delimiter(b"From\n", false));
        assert!(!is_delimiter(b" From x\n", false));
    }

    #[test]
    fn test_bom_only_at_file_start() {
        let mut line = BOM.to_vec();
        line.extend_from_slice(b"From user@example.com\n");
        assert!(is_delimiter(&line, true));
        assert!(!is_delimiter(&line, false));
    }

    #[test]
    fn test_three_messages_offsets() {
        let index = scan(THREE);
        assert_eq!(index.len(), 3);
        let records = index.records();
        assert_eq!(records[0].start, 0);
        assert_eq!(records[0].end, records[1].start);
        assert_eq!(records[1].end, records[2].start);
        assert_eq!(records[2].end, THREE.len() as u64);
        assert_eq!(rebuild(THREE, &index), THREE);

        let subjects: Vec<_> = records
            .iter()
            .map(|r| r.headers.as_ref().and_then(|h| h.subject.clone()).unwrap_or_default())
            .collect();
        assert_eq!(subjects, ["Invoice", "Spam offer", "Invoice receipt"]);
        assert_eq!(records[2].headers.as_ref().unwrap().to.as_deref(), Some("z@y"));
        assert_eq!(records[1].headers.as_ref().unwrap().to, None);
    }

    #[test]
    fn test_escaped_from_is_not_a_boundary() {
        let data = b"From a@x\nSubject: one\n\nHello\n>From the perspective of the body\nbye\n";
        let index = scan(data);
        assert_eq!(index.len(), 1);
        assert_eq!(index.records()[0].end, data.len() as u64);
    }

    #[test]
    fn test_empty_input() {
        let index = scan(b"");
        assert!(index.is_empty());
        assert_eq!(index.file_size(), 0);
    }

    #[test]
    fn test_missing_trailing_newline() {
        let data = b"From a@x\nSubject: s\n\nno newline at end";
        let index = scan(data);
        assert_eq!(index.len(), 1);
        assert_eq!(index.records()[0].end, data.len() as u64);
    }

    #[test]
    fn test_preamble_becomes_first_record() {
        let data = b"junk line\n\nFrom a@x\nSubject: real\n\nbody\n";
        let index = scan(data);
        assert_eq!(index.len(), 2);
        assert!(!index.records()[0].has_delimiter);
        assert_eq!(index.records()[0].end, 11);
        assert!(index.records()[1].has_delimiter);
        assert_eq!(rebuild(data, &index), data);
    }

    #[test]
    fn test_crlf_line_endings() {
        let data = b"From a@x\r\nSubject: one\r\n\r\nbody\r\nFrom b@x\r\nSubject: two\r\n\r\nbody\r\n";
        let index = scan(data);
        assert_eq!(index.len(), 2);
        let h = index.records()[1].headers.as_ref().unwrap();
        assert_eq!(h.subject.as_deref(), Some("two"));
        assert_eq!(rebuild(data, &index), data);
    }

    #[test]
    fn test_header_range_stops_at_blank_line() {
        let data = b"From a@x\nSubject: one\n\nSubject: not a header\n";
        let index = scan(data);
        let r = &index.records()[0];
        assert_eq!(r.header_range, ByteRange::new(9, 22));
        assert_eq!(r.headers.as_ref().unwrap().subject.as_deref(), Some("one"));
    }

    #[test]
    fn test_header_budget_caps_parsing() {
        let config = ScanConfig {
            max_header_bytes: 20,
            ..ScanConfig::default()
        };
        let data = b"From a@x\nTo: short@x\nSubject: this line is too long for the budget\n\nbody\n";
        let index = scan_with(data, config);
        let r = &index.records()[0];
        let h = r.headers.as_ref().unwrap();
        assert_eq!(h.to.as_deref(), Some("short@x"));
        assert_eq!(h.subject, None);
        assert_eq!(r.end, data.len() as u64);
    }

    #[test]
    fn test_lazy_mode_keeps_no_headers() {
        let config = ScanConfig {
            header_mode: HeaderMode::Lazy,
            ..ScanConfig::default()
        };
        let index = scan_with(THREE, config);
        assert_eq!(index.len(), 3);
        assert!(index.iter().all(|r| r.headers.is_none()));
        assert_eq!(rebuild(THREE, &index), THREE);
    }

    #[test]
    fn test_strict_mode_requires_blank_line() {
        let data = b"From a@x\nSubject: one\n\nbody\nFrom here on it is prose\n\nFrom b@x\nSubject: two\n\n";
        assert_eq!(scan(data).len(), 3);

        let strict = ScanConfig {
            strict_boundaries: true,
            ..ScanConfig::default()
        };
        let index = scan_with(data, strict);
        assert_eq!(index.len(), 2);
        assert_eq!(rebuild(data, &index), data);
    }

    #[test]
    fn test_tiny_buffer_spanning_lines() {
        // 5000-byte bodies make lines and delimiters straddle buffer refills.
        let config = ScanConfig {
            read_buffer_size: 1,
            ..ScanConfig::default()
        };
        let mut data = Vec::new();
        for i in 0..50 {
            data.extend_from_slice(format!("From u{i}@x Mon Jan  1 00:00:00 2024\n").as_bytes());
            data.extend_from_slice(format!("Subject: message {i}\n\n").as_bytes());
            data.extend_from_slice(&vec![b'x'; 5000]);
            data.extend_from_slice(b"\n\n");
        }
        let index = scan_with(&data, config);
        assert_eq!(index.len(), 50);
        assert_eq!(rebuild(&data, &index), data);
        let h = index.records()[49].headers.as_ref().unwrap();
        assert_eq!(h.subject.as_deref(), Some("message 49"));
    }

    #[test]
    fn test_long_line_without_newline_is_bounded() {
        let mut data = b"From a@x\nSubject: s\n\n".to_vec();
        data.extend(std::iter::repeat(b'y').take(3 * 1024 * 1024));
        let index = scan(&data);
        assert_eq!(index.len(), 1);
        assert_eq!(index.records()[0].end, data.len() as u64);
    }

    struct FailingReader {
        served: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served > 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            let data = b"From a@x\nSubject: s\n\n";
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_error_surfaces_as_scan_error() {
        let err = MboxScanner::default()
            .scan(FailingReader { served: 0 }, 1000, &mut ())
            .unwrap_err();
        assert!(matches!(err, MboxError::Scan { .. }), "got {err:?}");
    }

    #[test]
    fn test_cancellation_publishes_nothing() {
        let config = ScanConfig {
            read_buffer_size: MIN_BUFFER_SIZE,
            ..ScanConfig::default()
        };
        let data = THREE.repeat(1000);
        let mut refills = 0;
        let mut reporter = crate::progress::ProgressFn::new(|_, _| {
            refills += 1;
            refills < 3
        });
        let err = MboxScanner::new(config)
            .scan(Cursor::new(&data), data.len() as u64, &mut reporter)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
