//! RFC 5322 header parsing: folding, encoded-words (RFC 2047), and date parsing.
//!
//! Only what the index and the message viewer need. Bodies are never decoded.

use std::borrow::Cow;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

use crate::model::record::{HeaderEntry, HeaderField, HeaderValues};

/// Extract the recognized header values (`Subject`, `From`, `To`, `Date`)
/// from a raw header block. Later duplicates of a header are ignored.
pub fn parse_header_values(raw: &[u8]) -> HeaderValues {
    let text = decode_header_bytes(raw);
    let mut values = HeaderValues::default();

    for (name, value) in unfold_headers(&text) {
        let Some(field) = HeaderField::from_name(&name) else {
            continue;
        };
        let slot = values.slot_mut(field);
        if slot.is_none() {
            *slot = Some(decode_encoded_words(&value));
        }
    }

    values.parsed_date = values.date.as_deref().and_then(parse_date);
    values
}

/// Parse every header of a raw header block, preserving order and name case.
pub fn parse_header_entries(raw: &[u8]) -> Vec<HeaderEntry> {
    let text = decode_header_bytes(raw);
    unfold_headers(&text)
        .into_iter()
        .map(|(name, value)| HeaderEntry {
            value: decode_encoded_words(&value),
            name,
        })
        .collect()
}

/// Decode raw header bytes to text: UTF-8 when valid, Windows-1252 otherwise
/// (every byte maps to a character, so nothing is lost).
fn decode_header_bytes(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            Cow::Owned(decoded.into_owned())
        }
    }
}

/// Join continuation lines onto their header and split `name: value`.
///
/// Lines that are neither a continuation nor contain a colon are skipped,
/// as is a delimiter line if one is passed in.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                let cont = line.trim();
                if !cont.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(cont);
                }
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim_end();
        if name.is_empty() || name.contains(char::is_whitespace) {
            continue;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    headers
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` becomes `"Hola mundo"`.
/// Whitespace between two adjacent encoded-words is dropped. Tokens that
/// fail to decode are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut after_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        match decode_word(&candidate[2..]) {
            Some((text, consumed)) => {
                if !(after_word && before.trim().is_empty()) {
                    out.push_str(before);
                }
                out.push_str(&text);
                rest = &candidate[2 + consumed..];
                after_word = true;
            }
            None => {
                out.push_str(before);
                out.push_str("=?");
                rest = &candidate[2..];
                after_word = false;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Decode `charset?enc?payload?=` (the part after `=?`).
/// Returns the text and the number of bytes consumed.
fn decode_word(s: &str) -> Option<(String, usize)> {
    let (charset, rest) = s.split_once('?')?;
    let (encoding, rest) = rest.split_once('?')?;
    let end = rest.find("?=")?;
    let payload = &rest[..end];

    if charset.is_empty() || charset.contains(char::is_whitespace) {
        return None;
    }
    // RFC 2231 language suffix: "utf-8*en"
    let charset = charset.split('*').next().unwrap_or(charset);

    let bytes = match encoding {
        "B" | "b" => STANDARD
            .decode(payload)
            .or_else(|_| STANDARD_NO_PAD.decode(payload.trim_end_matches('=')))
            .ok()?,
        "Q" | "q" => decode_q(payload),
        _ => return None,
    };

    let consumed = charset_len(s) + 1 + encoding.len() + 1 + end + 2;
    Some((decode_charset(charset, &bytes), consumed))
}

/// Length of the raw charset token (including any `*lang` suffix).
fn charset_len(s: &str) -> usize {
    s.find('?').unwrap_or(s.len())
}

/// Q-encoding: `_` is a space, `=XX` is a hex byte.
fn decode_q(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    if charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8") {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    match encoding_rs::Encoding::for_label(charset.as_bytes()) {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => {
            debug!(charset, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Parse an email date string.
///
/// Tries RFC 2822 and RFC 3339 first, then a handful of formats seen in
/// real archives, and finally `mail-parser`'s lenient parser.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    // Drop a trailing comment such as "(UTC)" and a leading "Thu, ".
    let cleaned = trimmed
        .split_once(" (")
        .map_or(trimmed, |(head, _)| head)
        .trim();
    let cleaned = match cleaned.split_once(',') {
        Some((dow, rest)) if dow.len() == 3 => rest.trim(),
        _ => cleaned,
    };
    let cleaned = with_numeric_zone(cleaned);

    const FORMATS: [&str; 6] = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%Y-%m-%d %H:%M:%S %z",
        "%d-%b-%Y %H:%M:%S %z",
        "%a %b %d %H:%M:%S %Y %z",
        "%a %b %d %H:%M:%S %z %Y",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&cleaned, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%d %b %Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d-%b-%Y %H:%M:%S",
        "%a %b %d %H:%M:%S %Y",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    let parsed = mail_parser_date(trimmed);
    if parsed.is_none() {
        debug!(date = trimmed, "Could not parse date");
    }
    parsed
}

/// Replace a trailing named zone (`EST`, `GMT`, ...) with its numeric offset.
fn with_numeric_zone(s: &str) -> Cow<'_, str> {
    const ZONES: [(&str, &str); 12] = [
        ("UT", "+0000"),
        ("UTC", "+0000"),
        ("GMT", "+0000"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("CET", "+0100"),
    ];
    if let Some((head, zone)) = s.rsplit_once(' ') {
        if let Some((_, offset)) = ZONES.iter().find(|(name, _)| *name == zone) {
            return Cow::Owned(format!("{head} {offset}"));
        }
    }
    Cow::Borrowed(s)
}

/// Last resort: let `mail-parser` try, by wrapping the value in a minimal message.
fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    use mail_parser::MessageParser;

    let fake = format!("Date: {input}\r\n\r\n");
    let message = MessageParser::default().parse(fake.as_bytes())?;
    let rfc3339 = message.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&rfc3339)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_encoded_word() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SG9sYSBtdW5kbw==?="), "Hola mundo");
    }

    #[test]
    fn test_decode_adjacent_words_drop_whitespace() {
        let input = "=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_q_latin1() {
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?caf=E9?="), "café");
        assert_eq!(
            decode_encoded_words("=?ISO-8859-1?Q?R=E9sum=E9_du_projet?="),
            "Résumé du projet"
        );
    }

    #[test]
    fn test_decode_q_payload_starting_with_equals() {
        assert_eq!(decode_encoded_words("=?UTF-8?Q?=41bc?="), "Abc");
    }

    #[test]
    fn test_decode_mixed_plain_and_encoded() {
        let input = "Re: =?UTF-8?B?SG9sYQ==?= there";
        assert_eq!(decode_encoded_words(input), "Re: Hola there");
    }

    #[test]
    fn test_invalid_word_kept_verbatim() {
        assert_eq!(decode_encoded_words("50% =?off"), "50% =?off");
        assert_eq!(decode_encoded_words("=?UTF-8?X?abc?="), "=?UTF-8?X?abc?=");
    }

    #[test]
    fn test_unfold_headers() {
        let text = "Subject: This is a long\n\tsubject line\nFrom: user@example.com\n";
        let headers = unfold_headers(text);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "Subject");
        assert_eq!(headers[0].1, "This is a long subject line");
    }

    #[test]
    fn test_parse_header_values() {
        let raw = b"From: \"User One\" <user1@example.com>\r\nTo: a@b.c\r\nSubject: =?UTF-8?Q?Caf=C3=A9?=\r\nDate: Thu, 04 Jan 2024 10:00:00 +0000\r\n";
        let values = parse_header_values(raw);
        assert_eq!(values.from.as_deref(), Some("\"User One\" <user1@example.com>"));
        assert_eq!(values.to.as_deref(), Some("a@b.c"));
        assert_eq!(values.subject.as_deref(), Some("Café"));
        let date = values.parsed_date.expect("date parsed");
        assert_eq!(date.format("%Y-%m-%d").to_string(), "2024-01-04");
    }

    #[test]
    fn test_first_duplicate_header_wins() {
        let values = parse_header_values(b"Subject: one\nSubject: two\n");
        assert_eq!(values.subject.as_deref(), Some("one"));
    }

    #[test]
    fn test_header_names_ignore_case() {
        let values = parse_header_values(b"SUBJECT: loud\nfRoM: a@b.c\nX-Subject: no\n");
        assert_eq!(values.subject.as_deref(), Some("loud"));
        assert_eq!(values.from.as_deref(), Some("a@b.c"));
        assert!(values.to.is_none());
    }

    #[test]
    fn test_latin1_raw_bytes_fall_back() {
        let values = parse_header_values(b"Subject: caf\xe9\n");
        assert_eq!(values.subject.as_deref(), Some("café"));
    }

    #[test]
    fn test_parse_date_variants() {
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 +0000").is_some());
        assert!(parse_date("04 Jan 2024 10:00:00 +0000").is_some());
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 EST").is_some());
        assert!(parse_date("2024-01-04T10:00:00Z").is_some());
        assert!(parse_date("Thu, 4 Jan 2024 10:00:00 +0000 (UTC)").is_some());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn test_parse_date_named_zone_offset() {
        let dt = parse_date("04 Jan 2024 10:00:00 EST").unwrap();
        assert_eq!(dt.format("%H").to_string(), "15");
    }
}
