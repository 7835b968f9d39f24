//! Filtering: header rules evaluated against the index, and body search.

pub mod filter;
pub mod fulltext;

use std::borrow::Cow;

use crate::error::Result;
use crate::index::ArchiveIndex;
use crate::model::record::{HeaderValues, MessageRecord};

use self::filter::FilterSet;

/// Supplies the header values of a record.
///
/// Eagerly built indexes answer from memory ([`IndexedHeaders`]); lazily
/// built ones go through the session's
/// [`MessageStore`](crate::store::reader::MessageStore), which re-reads and
/// caches only that message's header block.
pub trait HeaderSource {
    fn header_values<'a>(&'a mut self, record: &'a MessageRecord)
        -> Result<Cow<'a, HeaderValues>>;
}

/// Headers cached in the records themselves. Records without cached
/// headers read as having none.
pub struct IndexedHeaders;

impl HeaderSource for IndexedHeaders {
    fn header_values<'a>(
        &'a mut self,
        record: &'a MessageRecord,
    ) -> Result<Cow<'a, HeaderValues>> {
        Ok(match &record.headers {
            Some(headers) => Cow::Borrowed(headers),
            None => Cow::Owned(HeaderValues::default()),
        })
    }
}

/// Sequence numbers of all messages matching `filter`, in archive order.
///
/// Read-only: neither the index nor any selection state is touched, so the
/// same filter over the same index always yields the same list.
pub fn filter_index(
    index: &ArchiveIndex,
    filter: &FilterSet,
    headers: &mut dyn HeaderSource,
) -> Result<Vec<u64>> {
    if filter.is_empty() {
        return Ok((0..index.message_count()).collect());
    }

    let compiled = filter.compile();
    let mut matches = Vec::new();
    for record in index {
        let values = headers.header_values(record)?;
        if compiled.matches(&values) {
            matches.push(record.sequence);
        }
    }
    Ok(matches)
}
