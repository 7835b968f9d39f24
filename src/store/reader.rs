//! Message store: reads individual messages by byte range, with an LRU cache
//! of lazily parsed header values.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use tracing::debug;

use crate::error::{MboxError, Result};
use crate::index::builder::open_archive_file;
use crate::model::record::{ByteRange, HeaderValues, MessageContent, MessageRecord};
use crate::parser::header;
use crate::parser::mbox::{is_blank_line, BOM};
use crate::search::HeaderSource;

/// Read buffer used when streaming a message body.
const BODY_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered reader over one message body, see [`MessageStore::body_reader`].
pub type BodyReader<'a> = BufReader<io::Take<&'a File>>;

/// Reads messages from an archive file using index byte ranges.
///
/// Owns the session's read handle. Header values that were not cached by an
/// eager scan are parsed on first use and kept in an LRU keyed by the
/// record's start offset.
pub struct MessageStore {
    path: PathBuf,
    file: File,
    cache: LruCache<u64, HeaderValues>,
}

impl MessageStore {
    /// Wrap an already-open archive handle.
    pub fn new(path: impl Into<PathBuf>, file: File, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            path: path.into(),
            file,
            cache: LruCache::new(cache_size),
        }
    }

    /// Open an archive file for random-access reading.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let (file, _) = open_archive_file(path)?;
        Ok(Self::new(path, file, cache_size))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Swap in a new handle for the same path (after the file was replaced).
    /// Cached header values are dropped because offsets no longer apply.
    pub fn replace_file(&mut self, file: File) {
        self.file = file;
        self.cache.clear();
    }

    /// Read the bytes of `range`.
    pub fn read_range(&mut self, range: ByteRange) -> Result<Vec<u8>> {
        read_range_from(&mut self.file, &self.path, range)
    }

    /// Read and split one message into delimiter, headers and raw body.
    pub fn read_message(&mut self, record: &MessageRecord) -> Result<MessageContent> {
        let raw = self.read_range(record.range())?;
        let parts = split_message(&raw, record);
        Ok(MessageContent {
            sequence: record.sequence,
            delimiter: parts
                .delimiter
                .map(|line| String::from_utf8_lossy(line).into_owned()),
            headers: header::parse_header_entries(parts.headers),
            raw_body: parts.body.to_vec(),
        })
    }

    /// Stream the raw body of `record`, starting after the blank line that
    /// ends its headers.
    ///
    /// Only one read buffer is held, however large the message. Header lines
    /// past the scan's header range are skipped without being kept.
    pub fn body_reader(&self, record: &MessageRecord) -> Result<BodyReader<'_>> {
        let start = record.header_range.end;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| MboxError::io(&self.path, e))?;
        let mut reader = BufReader::with_capacity(
            BODY_BUFFER_SIZE,
            file.take(record.end.saturating_sub(start)),
        );
        skip_to_body(&mut reader).map_err(|e| MboxError::io(&self.path, e))?;
        Ok(reader)
    }

    /// Header values of `record`: the eagerly cached ones when present,
    /// otherwise parsed from the file's header block and cached.
    pub fn header_values<'a>(
        &'a mut self,
        record: &'a MessageRecord,
    ) -> Result<Cow<'a, HeaderValues>> {
        if let Some(headers) = &record.headers {
            return Ok(Cow::Borrowed(headers));
        }
        let file = &mut self.file;
        let path = &self.path;
        let values = self.cache.try_get_or_insert(record.start, || {
            read_range_from(file, path, record.header_range)
                .map(|raw| header::parse_header_values(&raw))
        })?;
        Ok(Cow::Borrowed(values))
    }
}

impl HeaderSource for MessageStore {
    fn header_values<'a>(
        &'a mut self,
        record: &'a MessageRecord,
    ) -> Result<Cow<'a, HeaderValues>> {
        MessageStore::header_values(self, record)
    }
}

fn read_range_from(file: &mut File, path: &Path, range: ByteRange) -> Result<Vec<u8>> {
    debug!(start = range.start, len = range.len(), "Reading range from archive");
    file.seek(SeekFrom::Start(range.start))
        .map_err(|e| MboxError::io(path, e))?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf)
        .map_err(|e| MboxError::io(path, e))?;
    Ok(buf)
}

struct MessageParts<'a> {
    delimiter: Option<&'a [u8]>,
    headers: &'a [u8],
    body: &'a [u8],
}

/// Split a message's raw bytes at the delimiter line and at the first blank
/// line. Without a blank line everything after the delimiter is headers.
fn split_message<'a>(raw: &'a [u8], record: &MessageRecord) -> MessageParts<'a> {
    let mut rest = raw;
    let mut delimiter = None;
    if record.has_delimiter {
        let (line, tail) = split_line(rest);
        let line = if record.start == 0 {
            line.strip_prefix(BOM).unwrap_or(line)
        } else {
            line
        };
        delimiter = Some(trim_eol(line));
        rest = tail;
    }

    let mut pos = 0;
    while pos < rest.len() {
        let (line, _) = split_line(&rest[pos..]);
        if is_blank_line(line) {
            return MessageParts {
                delimiter,
                headers: &rest[..pos],
                body: &rest[pos + line.len()..],
            };
        }
        pos += line.len();
    }
    MessageParts {
        delimiter,
        headers: rest,
        body: &[],
    }
}

/// Consume lines up to and including the first blank one. Reaching the end
/// first means the message has no body.
fn skip_to_body<R: BufRead>(reader: &mut R) -> io::Result<()> {
    let mut blank = true;
    loop {
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if chunk.is_empty() {
            return Ok(());
        }
        let (take, complete) = match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (chunk.len(), false),
        };
        blank = blank && is_blank_line(&chunk[..take]);
        reader.consume(take);
        if complete {
            if blank {
                return Ok(());
            }
            blank = true;
        }
    }
}

/// First line including its `\n`, and the remainder.
fn split_line(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == b'\n') {
        Some(i) => bytes.split_at(i + 1),
        None => (bytes, &[]),
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
