//! Header filter rules: `Subject`/`From`/`To` contains / does-not-contain,
//! plus an optional "dated on or after" cut-off.
//!
//! Evaluation is pure and in-memory. A missing header is an empty string, so
//! `contains` never matches it (except for the empty pattern) and
//! `not_contains` always does.

use chrono::NaiveDate;

use crate::model::record::{HeaderField, HeaderValues};

/// Header a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    Subject,
    From,
    To,
}

impl FilterField {
    pub fn header(self) -> HeaderField {
        match self {
            Self::Subject => HeaderField::Subject,
            Self::From => HeaderField::From,
            Self::To => HeaderField::To,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Contains,
    NotContains,
}

/// One condition on one header.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilterRule {
    pub field: FilterField,
    pub mode: FilterMode,
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl FilterRule {
    pub fn new(field: FilterField, mode: FilterMode, pattern: impl Into<String>) -> Self {
        Self {
            field,
            mode,
            pattern: pattern.into(),
            case_sensitive: false,
        }
    }

    pub fn contains(field: FilterField, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterMode::Contains, pattern)
    }

    pub fn not_contains(field: FilterField, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterMode::NotContains, pattern)
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn matches(&self, headers: &HeaderValues) -> bool {
        CompiledRule::new(self).matches(headers)
    }
}

/// Rules combined with AND. The empty set matches every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilterSet {
    pub rules: Vec<FilterRule>,
    /// Keep only messages dated on or after this day. Messages without a
    /// parsable date are kept.
    #[serde(default)]
    pub since: Option<NaiveDate>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: FilterRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_since(mut self, since: NaiveDate) -> Self {
        self.since = Some(since);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.since.is_none()
    }

    pub fn matches(&self, headers: &HeaderValues) -> bool {
        self.compile().matches(headers)
    }

    /// Pre-normalize patterns for repeated evaluation.
    pub(crate) fn compile(&self) -> CompiledFilter {
        CompiledFilter {
            rules: self.rules.iter().map(CompiledRule::new).collect(),
            since: self.since,
        }
    }
}

pub(crate) struct CompiledFilter {
    rules: Vec<CompiledRule>,
    since: Option<NaiveDate>,
}

impl CompiledFilter {
    pub(crate) fn matches(&self, headers: &HeaderValues) -> bool {
        if let (Some(since), Some(date)) = (self.since, headers.parsed_date) {
            if date.date_naive() < since {
                return false;
            }
        }
        self.rules.iter().all(|rule| rule.matches(headers))
    }
}

struct CompiledRule {
    field: HeaderField,
    mode: FilterMode,
    needle: String,
    case_sensitive: bool,
}

impl CompiledRule {
    fn new(rule: &FilterRule) -> Self {
        let needle = if rule.case_sensitive {
            rule.pattern.clone()
        } else {
            rule.pattern.to_lowercase()
        };
        Self {
            field: rule.field.header(),
            mode: rule.mode,
            needle,
            case_sensitive: rule.case_sensitive,
        }
    }

    fn matches(&self, headers: &HeaderValues) -> bool {
        let haystack = headers.get(self.field).unwrap_or("");
        let found = if self.case_sensitive {
            haystack.contains(self.needle.as_str())
        } else {
            haystack.to_lowercase().contains(self.needle.as_str())
        };
        match self.mode {
            FilterMode::Contains => found,
            FilterMode::NotContains => !found,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::header::parse_date;

    fn headers(subject: Option<&str>, to: Option<&str>) -> HeaderValues {
        HeaderValues {
            subject: subject.map(str::to_string),
            from: Some("Alice <alice@example.com>".to_string()),
            to: to.map(str::to_string),
            ..HeaderValues::default()
        }
    }

    #[test]
    fn test_contains_is_case_insensitive_by_default() {
        let h = headers(Some("Your INVOICE is ready"), None);
        assert!(FilterRule::contains(FilterField::Subject, "invoice").matches(&h));
        assert!(!FilterRule::contains(FilterField::Subject, "invoice")
            .case_sensitive(true)
            .matches(&h));
        assert!(FilterRule::contains(FilterField::Subject, "INVOICE")
            .case_sensitive(true)
            .matches(&h));
    }

    #[test]
    fn test_missing_field_is_empty_string() {
        let h = headers(Some("x"), None);
        assert!(!FilterRule::contains(FilterField::To, "bob").matches(&h));
        assert!(FilterRule::not_contains(FilterField::To, "bob").matches(&h));
    }

    #[test]
    fn test_empty_pattern() {
        let h = headers(None, None);
        assert!(FilterRule::contains(FilterField::Subject, "").matches(&h));
        assert!(!FilterRule::not_contains(FilterField::Subject, "").matches(&h));
    }

    #[test]
    fn test_rules_combine_with_and() {
        let h = headers(Some("Invoice 42"), Some("bob@example.com"));
        let set = FilterSet::new()
            .with_rule(FilterRule::contains(FilterField::Subject, "invoice"))
            .with_rule(FilterRule::contains(FilterField::From, "alice"));
        assert!(set.matches(&h));

        let set = set.with_rule(FilterRule::not_contains(FilterField::To, "bob"));
        assert!(!set.matches(&h));
    }

    #[test]
    fn test_empty_set_matches_everything() {
        assert!(FilterSet::new().is_empty());
        assert!(FilterSet::new().matches(&HeaderValues::default()));
    }

    #[test]
    fn test_since_keeps_undated_messages() {
        let since = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let set = FilterSet::new().with_since(since);

        let mut h = HeaderValues::default();
        assert!(set.matches(&h));

        h.parsed_date = parse_date("Tue, 02 Jan 2024 23:59:59 +0000");
        assert!(!set.matches(&h));

        h.parsed_date = parse_date("Wed, 03 Jan 2024 00:00:00 +0000");
        assert!(set.matches(&h));
    }
}
