//! Summary statistics over an indexed archive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::record::{HeaderValues, MessageRecord};

/// Aggregate figures shown by `mboxprune stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ArchiveStats {
    pub message_count: usize,
    pub total_bytes: u64,
    pub largest_message: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    /// Messages without a parsable `Date:` header.
    pub undated: usize,
    pub top_senders: Vec<(String, usize)>,
}

/// Accumulates [`ArchiveStats`] one message at a time.
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: ArchiveStats,
    senders: HashMap<String, usize>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &MessageRecord, headers: &HeaderValues) {
        let stats = &mut self.stats;
        stats.message_count += 1;
        stats.total_bytes += record.len();
        stats.largest_message = stats.largest_message.max(record.len());

        match headers.parsed_date {
            Some(date) => {
                stats.oldest = Some(stats.oldest.map_or(date, |d| d.min(date)));
                stats.newest = Some(stats.newest.map_or(date, |d| d.max(date)));
            }
            None => stats.undated += 1,
        }

        if let Some(from) = headers.from.as_deref().filter(|f| !f.is_empty()) {
            *self.senders.entry(from.to_string()).or_default() += 1;
        }
    }

    /// Finish, keeping the `top_n` most frequent senders.
    pub fn finish(self, top_n: usize) -> ArchiveStats {
        let mut senders: Vec<(String, usize)> = self.senders.into_iter().collect();
        senders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        senders.truncate(top_n);
        ArchiveStats {
            top_senders: senders,
            ..self.stats
        }
    }
}
