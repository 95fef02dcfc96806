//! Subscriptions: filters, a delivery target and the per-subscription
//! dedup ledger.
//!
//! A [`Subscription`] is shared (`Arc`) between the cache query path and
//! live relay delivery. Whichever path sees an event first delivers it;
//! every later sighting of the same id is dropped by the ledger.

use crate::error::{ClientError, Result};
use crate::filter::{Filter, matches_any};
use nostr::Event;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Callback invoked once per delivered event.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

enum Delivery {
    Callback(EventCallback),
    Channel(mpsc::UnboundedSender<Event>),
}

/// A filter set with a delivery target and a dedup ledger.
pub struct Subscription {
    id: String,
    filters: Vec<Filter>,
    delivery: Delivery,
    /// Ids already delivered; discarded on stop
    delivered: Mutex<HashSet<String>>,
    eose: AtomicBool,
    stopped: AtomicBool,
}

impl Subscription {
    /// Create a subscription delivering through `callback`.
    pub fn with_callback(id: impl Into<String>, filters: Vec<Filter>, callback: EventCallback) -> Self {
        Self::new(id.into(), filters, Delivery::Callback(callback))
    }

    /// Create a subscription delivering into a channel.
    pub fn with_channel(
        id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id.into(), filters, Delivery::Channel(tx)), rx)
    }

    fn new(id: String, filters: Vec<Filter>, delivery: Delivery) -> Self {
        Self {
            id,
            filters,
            delivery,
            delivered: Mutex::new(HashSet::new()),
            eose: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Does the event satisfy at least one of this subscription's filters?
    pub fn matches(&self, event: &Event) -> bool {
        matches_any(event, &self.filters)
    }

    /// Has `event_id` already been delivered?
    pub fn was_delivered(&self, event_id: &str) -> bool {
        self.delivered.lock().contains(event_id)
    }

    /// Number of distinct events delivered so far.
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Deliver `event` unless its id was delivered before.
    ///
    /// Returns `Ok(true)` when the event was handed to the subscriber,
    /// `Ok(false)` when it was a duplicate or the subscription is stopped.
    /// Matching is the caller's job.
    pub fn handle_event(&self, event: &Event) -> Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }

        // Check-and-insert under one lock so concurrent relays cannot both win.
        if !self.delivered.lock().insert(event.id.clone()) {
            return Ok(false);
        }

        match &self.delivery {
            Delivery::Callback(callback) => {
                callback(event.clone());
                Ok(true)
            }
            Delivery::Channel(tx) => tx
                .send(event.clone())
                .map(|()| true)
                .map_err(|_| ClientError::Subscription(format!("{}: channel closed", self.id))),
        }
    }

    /// Mark that stored events have been exhausted.
    pub fn mark_eose(&self) {
        self.eose.store(true, Ordering::Release);
    }

    pub fn has_eose(&self) -> bool {
        self.eose.load(Ordering::Acquire)
    }

    /// Stop delivery and discard the dedup ledger.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.delivered.lock().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filters", &self.filters)
            .field("delivered", &self.delivered_count())
            .field("eose", &self.has_eose())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Builder for creating subscription filters.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBuilder {
    filters: Vec<Filter>,
}

impl SubscriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the subscription.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter for specific event kinds.
    pub fn kinds(self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    /// Add a filter for events from specific authors.
    pub fn authors(self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    /// Add a filter for specific event IDs.
    pub fn ids(self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.filter(Filter::new().ids(ids))
    }

    /// Add a filter for replies to, or mentions of, an event.
    pub fn references(self, event_id: impl Into<String>) -> Self {
        self.filter(Filter::new().event_refs([event_id.into()]))
    }

    pub fn build(self) -> Vec<Filter> {
        self.filters
    }
}

/// Tracks which relays carry a subscription and which have sent EOSE.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    pub id: String,
    pub filters: Vec<Filter>,
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Whether EOSE has been received from all relays
    pub all_eose: bool,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            all_eose: false,
            eose_relays: HashSet::new(),
        }
    }

    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
        self.update_all_eose();
    }

    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.update_all_eose();
    }

    /// Record EOSE from a relay. Returns true when this completed the set.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) -> bool {
        let was_complete = self.all_eose;
        let relay_url = relay_url.into();
        if self.relays.contains(&relay_url) {
            self.eose_relays.insert(relay_url);
        }
        self.update_all_eose();
        !was_complete && self.all_eose
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty() && self.relays.len() == self.eose_relays.len();
    }

    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}
