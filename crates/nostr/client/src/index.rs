//! Local event index for efficient storage and retrieval.
//!
//! Events are write-once: inserting an id that is already stored is a no-op.
//! Secondary indexes keep each query proportional to its candidate set
//! rather than to the whole store:
//! - by kind and by author, ordered newest first
//! - by `(tag name, tag value)`
//!
//! Candidates from an index are always re-verified with the full filter
//! predicate before they are returned.

use crate::error::Result;
use crate::filter::{Filter, matches};
use crate::subscription::Subscription;
use nostr::Event;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, btree_set};
use std::sync::Arc;
use tracing::{debug, warn};

/// Configuration for the event index
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Cap applied to filters that carry no `limit`. `None` disables it.
    pub default_limit: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            default_limit: Some(5000),
        }
    }
}

/// Storage contract used by the subscription router.
///
/// `set_event` must be insert-if-absent; `query` delivers the cached
/// matches for a subscription through its dedup ledger.
pub trait EventStore: Send + Sync {
    /// Insert `event` unless its id is already stored. Returns true if inserted.
    fn set_event(&self, event: Event, relay_hints: &[String]) -> bool;

    /// Deliver cached matches for `subscription`, newest first. Returns
    /// the number of events handed to the subscriber.
    fn query(&self, subscription: &Subscription) -> Result<usize>;
}

/// Sort key: newest first, then id ascending.
type RecencyKey = (Reverse<u64>, String);

fn recency_key(event: &Event) -> RecencyKey {
    (Reverse(event.created_at), event.id.clone())
}

#[derive(Default)]
struct IndexInner {
    /// Events by ID
    events: HashMap<String, Arc<Event>>,
    /// Index by kind, newest first
    by_kind: HashMap<u16, BTreeSet<RecencyKey>>,
    /// Index by author (pubkey), newest first
    by_author: HashMap<String, BTreeSet<RecencyKey>>,
    /// Index by (tag name, tag value) -> event IDs
    by_tag: HashMap<(String, String), HashSet<String>>,
    /// Relays each event was seen on
    relay_hints: HashMap<String, BTreeSet<String>>,
}

/// Where a filter's candidates come from.
enum Candidates<'a> {
    /// Unordered ids that must be sorted after verification
    Ids(Vec<String>),
    /// Keys already in recency order
    Ordered(MergeOrdered<'a>),
    /// No usable index; scan everything
    FullScan,
}

impl IndexInner {
    fn insert(&mut self, event: Event) {
        let key = recency_key(&event);

        self.by_kind.entry(event.kind).or_default().insert(key.clone());
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(key);

        for tag in &event.tags {
            if tag.len() >= 2 {
                self.by_tag
                    .entry((tag[0].clone(), tag[1].clone()))
                    .or_default()
                    .insert(event.id.clone());
            }
        }

        self.events.insert(event.id.clone(), Arc::new(event));
    }

    fn record_hints(&mut self, event_id: &str, relay_hints: &[String]) {
        if relay_hints.is_empty() {
            return;
        }
        self.relay_hints
            .entry(event_id.to_string())
            .or_default()
            .extend(relay_hints.iter().cloned());
    }

    /// Pick the most selective index: ids > tag > authors > kinds > scan.
    fn candidates(&self, filter: &Filter) -> Candidates<'_> {
        if let Some(ids) = &filter.ids {
            return Candidates::Ids(ids.clone());
        }

        // Among the tag keys, take the one with the fewest candidates.
        let smallest_tag = filter
            .tag_filters()
            .map(|(name, values)| {
                let ids: HashSet<&String> = values
                    .iter()
                    .filter_map(|value| self.by_tag.get(&(name.to_string(), value.clone())))
                    .flatten()
                    .collect();
                ids
            })
            .min_by_key(HashSet::len);
        if let Some(ids) = smallest_tag {
            return Candidates::Ids(ids.into_iter().cloned().collect());
        }

        if let Some(authors) = &filter.authors {
            return Candidates::Ordered(MergeOrdered::new(
                authors.iter().filter_map(|author| self.by_author.get(author)),
            ));
        }

        if let Some(kinds) = &filter.kinds {
            return Candidates::Ordered(MergeOrdered::new(
                kinds.iter().filter_map(|kind| self.by_kind.get(kind)),
            ));
        }

        Candidates::FullScan
    }

    /// Verified matches for one filter, newest first, truncated to `limit`.
    fn query_filter(&self, filter: &Filter, limit: Option<usize>) -> Vec<Arc<Event>> {
        let limit = limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Vec::new();
        }

        match self.candidates(filter) {
            Candidates::Ordered(keys) => {
                // Already newest first: stop as soon as the limit is met.
                keys.filter_map(|(_, id)| self.events.get(id))
                    .filter(|event| matches(event, filter))
                    .take(limit)
                    .cloned()
                    .collect()
            }
            Candidates::Ids(ids) => {
                let unique: HashSet<&String> = ids.iter().collect();
                let found = unique.into_iter().filter_map(|id| self.events.get(id));
                sorted_truncated(found, filter, limit)
            }
            Candidates::FullScan => sorted_truncated(self.events.values(), filter, limit),
        }
    }
}

/// Lazy k-way merge of recency-ordered sets, skipping repeated keys.
struct MergeOrdered<'a> {
    sources: Vec<btree_set::Iter<'a, RecencyKey>>,
    heads: BinaryHeap<Reverse<(&'a RecencyKey, usize)>>,
    last: Option<&'a RecencyKey>,
}

impl<'a> MergeOrdered<'a> {
    fn new(sets: impl Iterator<Item = &'a BTreeSet<RecencyKey>>) -> Self {
        let mut sources: Vec<_> = sets.map(BTreeSet::iter).collect();
        let heads = sources
            .iter_mut()
            .enumerate()
            .filter_map(|(source, keys)| keys.next().map(|key| Reverse((key, source))))
            .collect();
        Self {
            sources,
            heads,
            last: None,
        }
    }
}

impl<'a> Iterator for MergeOrdered<'a> {
    type Item = &'a RecencyKey;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Reverse((key, source)) = self.heads.pop()?;
            if let Some(next) = self.sources[source].next() {
                self.heads.push(Reverse((next, source)));
            }
            // Equal keys come out back to back when a kind or author is
            // listed twice.
            if self.last == Some(key) {
                continue;
            }
            self.last = Some(key);
            return Some(key);
        }
    }
}

fn sorted_truncated<'a>(
    events: impl Iterator<Item = &'a Arc<Event>>,
    filter: &Filter,
    limit: usize,
) -> Vec<Arc<Event>> {
    let mut matched: Vec<Arc<Event>> = events.filter(|event| matches(event, filter)).cloned().collect();
    matched.sort_by(|a, b| a.recency_cmp(b));
    matched.truncate(limit);
    matched
}

/// In-memory event index with kind, author and tag indexes.
///
/// Safe to share between tasks: inserts take a write lock, queries take a
/// read lock for the duration of candidate selection and verification.
pub struct EventIndex {
    config: IndexConfig,
    inner: RwLock<IndexInner>,
}

impl EventIndex {
    /// Create a new index with default config
    pub fn new() -> Self {
        Self::with_config(IndexConfig::default())
    }

    /// Create a new index with custom config
    pub fn with_config(config: IndexConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Insert an event. A repeated id only adds relay hints.
    pub fn set_event(&self, event: Event, relay_hints: &[String]) -> bool {
        let mut inner = self.inner.write();
        inner.record_hints(&event.id, relay_hints);

        if inner.events.contains_key(&event.id) {
            return false;
        }

        inner.insert(event);
        true
    }

    /// Get an event by ID
    pub fn get(&self, event_id: &str) -> Option<Arc<Event>> {
        self.inner.read().events.get(event_id).cloned()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.inner.read().events.contains_key(event_id)
    }

    /// Relays an event was received from, sorted.
    pub fn relay_hints(&self, event_id: &str) -> Vec<String> {
        self.inner
            .read()
            .relay_hints
            .get(event_id)
            .map(|hints| hints.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    /// Matches for a filter set, newest first.
    ///
    /// Each filter is resolved and limited on its own; the union is then
    /// deduplicated by id. A filter with a malformed tag key yields nothing.
    pub fn query_filters(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        for filter in filters {
            if let Err(e) = filter.validate() {
                warn!("Skipping filter: {}", e);
                continue;
            }
            if !filter.is_narrowed() && filter.limit.is_none() {
                debug!("Unnarrowed filter without limit falls back to a full scan");
            }

            let limit = filter.limit.or(self.config.default_limit);
            for event in inner.query_filter(filter, limit) {
                if seen.insert(event.id.clone()) {
                    merged.push(event);
                }
            }
        }
        drop(inner);

        merged.sort_by(|a, b| a.recency_cmp(b));
        merged
    }

    /// Deliver cached matches for `subscription` through its ledger.
    ///
    /// Callbacks run after the read lock is released, so a subscriber may
    /// insert into the index from its callback.
    pub fn query(&self, subscription: &Subscription) -> Result<usize> {
        let events = self.query_filters(subscription.filters());
        let mut delivered = 0;
        for event in events {
            if subscription.handle_event(&event)? {
                delivered += 1;
            }
        }
        debug!(
            "Cache delivered {} events to subscription {}",
            delivered,
            subscription.id()
        );
        Ok(delivered)
    }
}

impl Default for EventIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for EventIndex {
    fn set_event(&self, event: Event, relay_hints: &[String]) -> bool {
        EventIndex::set_event(self, event, relay_hints)
    }

    fn query(&self, subscription: &Subscription) -> Result<usize> {
        EventIndex::query(self, subscription)
    }
}
