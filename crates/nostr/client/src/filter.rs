//! NIP-01 subscription filters and the matching predicate.
//!
//! A filter is a conjunction of optional constraints:
//! - Event IDs, authors and kinds (exact membership)
//! - Time range (`since` and `until`, both inclusive)
//! - Tag queries (`#e`, `#p`, ...): ANDed across keys, ORed across values
//! - A per-filter result `limit`
//!
//! [`matches`] is the single source of truth for correctness. Indexes may
//! prune candidates but never decide membership on their own.

use crate::error::{ClientError, Result};
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// NIP-01 Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events created at or after this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events created at or before this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events to return for this filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Generic tag queries keyed with the `#` prefix (e.g. `#e`, `#p`)
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter (matches all events).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter events created at or after `timestamp`.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter events created at or before `timestamp`.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. `tag_name` may be given with or without the `#` prefix.
    pub fn tag(mut self, tag_name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if tag_name.starts_with('#') {
            tag_name.to_string()
        } else {
            format!("#{tag_name}")
        };
        self.tags.insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Tag filters as `(tag name, accepted values)`, without the `#` prefix.
    ///
    /// Structurally invalid keys are skipped; see [`Filter::validate`].
    pub fn tag_filters(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .filter_map(|(key, values)| tag_name(key).map(|name| (name, values.as_slice())))
    }

    /// True when the filter constrains ids, authors, kinds or tags.
    ///
    /// A filter without any of these can only be answered by a full scan.
    pub fn is_narrowed(&self) -> bool {
        self.ids.is_some() || self.authors.is_some() || self.kinds.is_some() || !self.tags.is_empty()
    }

    /// Reject filters whose tag keys are not of the form `#<name>`.
    pub fn validate(&self) -> Result<()> {
        for key in self.tags.keys() {
            if tag_name(key).is_none() {
                return Err(ClientError::InvalidFilter(format!(
                    "tag filter key {key:?} must be '#' followed by a tag name"
                )));
            }
        }
        Ok(())
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        matches(event, self)
    }
}

fn tag_name(key: &str) -> Option<&str> {
    key.strip_prefix('#').filter(|name| !name.is_empty())
}

/// Does `event` satisfy every constraint present on `filter`?
///
/// A filter with a malformed tag key never matches.
pub fn matches(event: &Event, filter: &Filter) -> bool {
    if let Some(ids) = &filter.ids
        && !ids.contains(&event.id)
    {
        return false;
    }

    if let Some(authors) = &filter.authors
        && !authors.contains(&event.pubkey)
    {
        return false;
    }

    if let Some(kinds) = &filter.kinds
        && !kinds.contains(&event.kind)
    {
        return false;
    }

    if filter.since.is_some_and(|since| event.created_at < since) {
        return false;
    }

    if filter.until.is_some_and(|until| event.created_at > until) {
        return false;
    }

    for (key, accepted) in &filter.tags {
        let Some(name) = tag_name(key) else {
            return false;
        };
        if !event.tag_values(name).any(|value| accepted.iter().any(|a| a == value)) {
            return false;
        }
    }

    true
}

/// Does `event` satisfy at least one filter of the set?
pub fn matches_any(event: &Event, filters: &[Filter]) -> bool {
    filters.iter().any(|filter| matches(event, filter))
}
