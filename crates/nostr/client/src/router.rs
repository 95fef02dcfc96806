//! Subscription routing between the event store and live relay traffic.
//!
//! The router owns the set of active subscriptions. History comes from the
//! [`EventStore`] when a subscription is registered; live events are
//! re-verified against every subscription and delivered through each
//! subscription's dedup ledger, so an event seen on several relays (or in
//! both the cache and the live stream) reaches a subscriber once.

use crate::error::Result;
use crate::index::EventStore;
use crate::subscription::Subscription;
use nostr::Event;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes cached and live events to subscriptions.
pub struct SubscriptionRouter {
    store: Arc<dyn EventStore>,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl SubscriptionRouter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Register `subscription` and replay matching cached events.
    ///
    /// Returns the number of cached events delivered. A subscription with
    /// the same id replaces the previous one, which is stopped. If the store
    /// fails the subscription is not kept.
    pub fn subscribe(&self, subscription: Arc<Subscription>) -> Result<usize> {
        let previous = self
            .subscriptions
            .write()
            .insert(subscription.id().to_string(), Arc::clone(&subscription));
        if let Some(previous) = previous {
            debug!("Replacing subscription {}", previous.id());
            previous.stop();
        }

        self.store.query(&subscription).inspect_err(|e| {
            warn!("Replay for subscription {} failed: {}", subscription.id(), e);
            let mut subscriptions = self.subscriptions.write();
            if subscriptions
                .get(subscription.id())
                .is_some_and(|current| Arc::ptr_eq(current, &subscription))
            {
                subscriptions.remove(subscription.id());
            }
            drop(subscriptions);
            subscription.stop();
        })
    }

    /// Stop and forget a subscription. Returns it if it was registered.
    pub fn unsubscribe(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        let removed = self.subscriptions.write().remove(subscription_id);
        if let Some(subscription) = &removed {
            subscription.stop();
        }
        removed
    }

    pub fn get(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(subscription_id).cloned()
    }

    /// Active subscription ids.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Deliver a live event from `relay_url` to every matching subscription.
    ///
    /// The event is cached when at least one subscription wanted it.
    /// Subscriptions whose channel receiver is gone are dropped. Returns the
    /// number of subscriptions the event was delivered to.
    pub fn handle_event(&self, event: &Event, relay_url: &str) -> usize {
        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .values()
            .filter(|subscription| subscription.matches(event))
            .cloned()
            .collect();

        if matching.is_empty() {
            return 0;
        }

        self.store.set_event(event.clone(), &[relay_url.to_string()]);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for subscription in &matching {
            match subscription.handle_event(event) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Dropping subscription {}: {}", subscription.id(), e);
                    closed.push(subscription.id().to_string());
                }
            }
        }

        for id in closed {
            self.unsubscribe(&id);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::filter::Filter;
    use crate::index::EventIndex;
    use crate::subscription::EventCallback;
    use parking_lot::Mutex;

    fn event(id: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pubkey1".to_string(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    fn recording(id: &str, filters: Vec<Filter>) -> (Arc<Subscription>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: EventCallback = Arc::new(move |event: Event| sink.lock().push(event.id));
        (Arc::new(Subscription::with_callback(id, filters, callback)), seen)
    }

    fn router() -> (SubscriptionRouter, Arc<EventIndex>) {
        let index = Arc::new(EventIndex::new());
        (SubscriptionRouter::new(index.clone()), index)
    }

    #[test]
    fn test_subscribe_replays_cache() {
        let (router, index) = router();
        index.set_event(event("old", 1, 100), &[]);
        index.set_event(event("other", 2, 100), &[]);

        let (sub, seen) = recording("s1", vec![Filter::new().kinds([1])]);
        assert_eq!(router.subscribe(sub).unwrap(), 1);
        assert_eq!(*seen.lock(), vec!["old"]);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_live_event_delivered_once_across_relays() {
        let (router, index) = router();
        let (sub, seen) = recording("s1", vec![Filter::new().kinds([1])]);
        router.subscribe(sub).unwrap();

        let live = event("live", 1, 200);
        assert_eq!(router.handle_event(&live, "wss://a.example"), 1);
        assert_eq!(router.handle_event(&live, "wss://b.example"), 0);

        assert_eq!(*seen.lock(), vec!["live"]);
        assert!(index.contains("live"));
        assert_eq!(index.relay_hints("live"), vec!["wss://a.example", "wss://b.example"]);
    }

    #[test]
    fn test_cached_then_live_is_deduplicated() {
        let (router, index) = router();
        index.set_event(event("e1", 1, 100), &[]);

        let (sub, seen) = recording("s1", vec![Filter::new().kinds([1])]);
        router.subscribe(sub).unwrap();
        router.handle_event(&event("e1", 1, 100), "wss://a.example");

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_unmatched_events_are_not_cached() {
        let (router, index) = router();
        let (sub, seen) = recording("s1", vec![Filter::new().kinds([1])]);
        router.subscribe(sub).unwrap();

        assert_eq!(router.handle_event(&event("e2", 2, 100), "wss://a.example"), 0);
        assert!(seen.lock().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let (router, _index) = router();
        let (sub, seen) = recording("s1", vec![Filter::new()]);
        router.subscribe(Arc::clone(&sub)).unwrap();

        let removed = router.unsubscribe("s1").unwrap();
        assert!(removed.is_stopped());
        assert!(router.unsubscribe("s1").is_none());

        router.handle_event(&event("e1", 1, 100), "wss://a.example");
        assert!(seen.lock().is_empty());
        assert!(router.is_empty());
    }

    #[test]
    fn test_same_id_replaces_subscription() {
        let (router, _index) = router();
        let (first, _) = recording("s1", vec![Filter::new()]);
        let (second, _) = recording("s1", vec![Filter::new()]);

        router.subscribe(Arc::clone(&first)).unwrap();
        router.subscribe(second).unwrap();

        assert!(first.is_stopped());
        assert_eq!(router.subscription_ids(), vec!["s1"]);
    }

    #[test]
    fn test_closed_channel_drops_subscription() {
        let (router, _index) = router();
        let (sub, rx) = Subscription::with_channel("s1", vec![Filter::new()]);
        router.subscribe(Arc::new(sub)).unwrap();
        drop(rx);

        assert_eq!(router.handle_event(&event("e1", 1, 100), "wss://a.example"), 0);
        assert!(router.get("s1").is_none());
    }

    struct Unavailable;

    impl EventStore for Unavailable {
        fn set_event(&self, _event: Event, _relay_hints: &[String]) -> bool {
            false
        }

        fn query(&self, _subscription: &Subscription) -> Result<usize> {
            Err(ClientError::Storage("database offline".to_string()))
        }
    }

    #[test]
    fn test_store_failure_propagates_and_registers_nothing() {
        let router = SubscriptionRouter::new(Arc::new(Unavailable));
        let (sub, seen) = recording("s1", vec![Filter::new()]);

        let result = router.subscribe(Arc::clone(&sub));
        assert!(matches!(result, Err(ClientError::Storage(_))));
        assert!(router.is_empty());
        assert!(sub.is_stopped());

        router.handle_event(&event("e1", 1, 100), "wss://a.example");
        assert!(seen.lock().is_empty());
    }
}
