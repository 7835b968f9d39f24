//! Index entries and the views handed to callers.

use chrono::{DateTime, Utc};

/// Half-open byte range `[start, end)` inside the archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Header fields the index knows how to cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderField {
    Subject,
    From,
    To,
    Date,
}

impl HeaderField {
    pub const ALL: [HeaderField; 4] = [Self::Subject, Self::From, Self::To, Self::Date];

    /// Lowercase header name as it appears before the colon.
    pub fn header_name(self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::From => "from",
            Self::To => "to",
            Self::Date => "date",
        }
    }

    /// The field a header line named `name` fills, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| name.eq_ignore_ascii_case(field.header_name()))
    }
}

/// Decoded values of the recognized headers of one message.
///
/// A missing header is `None`; callers that filter treat it as an empty string.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HeaderValues {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Raw `Date:` header text.
    pub date: Option<String>,
    /// `date` parsed to UTC, when it could be parsed.
    pub parsed_date: Option<DateTime<Utc>>,
}

impl HeaderValues {
    pub fn get(&self, field: HeaderField) -> Option<&str> {
        match field {
            HeaderField::Subject => self.subject.as_deref(),
            HeaderField::From => self.from.as_deref(),
            HeaderField::To => self.to.as_deref(),
            HeaderField::Date => self.date.as_deref(),
        }
    }

    pub(crate) fn slot_mut(&mut self, field: HeaderField) -> &mut Option<String> {
        match field {
            HeaderField::Subject => &mut self.subject,
            HeaderField::From => &mut self.from,
            HeaderField::To => &mut self.to,
            HeaderField::Date => &mut self.date,
        }
    }
}

/// One message in the archive.
///
/// Records are immutable once the scan publishes them. The keep/remove flag
/// is not stored here; it lives in [`Selection`](crate::plan::Selection).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    /// 0-based position in file order.
    pub sequence: u64,

    /// Byte offset of the message start (the `From ` delimiter line).
    pub start: u64,

    /// Byte offset one past the last byte of the message. Equals the next
    /// record's `start`, or the file length for the last record.
    pub end: u64,

    /// Header block, from just after the delimiter line to the blank
    /// separator line (or to where the header scan stopped).
    pub header_range: ByteRange,

    /// Eagerly parsed header values. `None` when the index was built in
    /// lazy mode; use the session to load them on demand.
    pub headers: Option<HeaderValues>,

    /// False only for leading bytes that precede the first delimiter.
    pub has_delimiter: bool,
}

impl MessageRecord {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }

    /// Total byte length including the delimiter line.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Row of `list_messages`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MessageSummary {
    pub sequence: u64,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    pub parsed_date: Option<DateTime<Utc>>,
    pub size: u64,
}

impl MessageSummary {
    pub fn new(record: &MessageRecord, headers: &HeaderValues) -> Self {
        Self {
            sequence: record.sequence,
            subject: headers.subject.clone().unwrap_or_default(),
            from: headers.from.clone().unwrap_or_default(),
            to: headers.to.clone().unwrap_or_default(),
            date: headers.date.clone().unwrap_or_default(),
            parsed_date: headers.parsed_date,
            size: record.len(),
        }
    }
}

/// A single header as read back from the file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HeaderEntry {
    /// Header name with its original capitalization.
    pub name: String,
    /// Unfolded value with RFC 2047 encoded-words decoded.
    pub value: String,
}

/// Full content of one message, loaded on demand by `read_message`.
#[derive(Debug, Clone)]
pub struct MessageContent {
    pub sequence: u64,
    /// The delimiter line without its line terminator, if the record has one.
    pub delimiter: Option<String>,
    /// All headers in file order.
    pub headers: Vec<HeaderEntry>,
    /// Everything after the blank line that ends the header block, untouched.
    pub raw_body: Vec<u8>,
}

impl MessageContent {
    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: u64, end: u64) -> MessageRecord {
        MessageRecord {
            sequence: 0,
            start,
            end,
            header_range: ByteRange::new(start, start),
            headers: None,
            has_delimiter: true,
        }
    }

    #[test]
    fn test_header_field_from_name() {
        assert_eq!(HeaderField::from_name("Subject"), Some(HeaderField::Subject));
        assert_eq!(HeaderField::from_name("FROM"), Some(HeaderField::From));
        assert_eq!(HeaderField::from_name("to"), Some(HeaderField::To));
        assert_eq!(HeaderField::from_name("Reply-To"), None);
        for field in HeaderField::ALL {
            assert_eq!(HeaderField::from_name(field.header_name()), Some(field));
        }
    }

    #[test]
    fn test_record_len() {
        let r = record(100, 250);
        assert_eq!(r.len(), 150);
        assert_eq!(r.range(), ByteRange::new(100, 250));
        assert!(!r.is_empty());
    }

    #[test]
    fn test_summary_missing_headers_are_empty() {
        let r = record(0, 10);
        let summary = MessageSummary::new(&r, &HeaderValues::default());
        assert_eq!(summary.subject, "");
        assert_eq!(summary.to, "");
        assert_eq!(summary.size, 10);
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let content = MessageContent {
            sequence: 0,
            delimiter: None,
            headers: vec![HeaderEntry {
                name: "Subject".into(),
                value: "Hi".into(),
            }],
            raw_body: Vec::new(),
        };
        assert_eq!(content.header("subject"), Some("Hi"));
        assert_eq!(content.header("From"), None);
    }
}
