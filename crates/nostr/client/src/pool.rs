//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`RelayConnection`] per relay, a local [`EventIndex`]
//! and a [`SubscriptionRouter`]. Subscriptions replay cached history
//! immediately and are sent as REQ to every relay each time it becomes
//! ready, so reconnects resubscribe on their own.

use crate::auth::{AuthContext, AuthPolicy, Signer};
use crate::error::Result;
use crate::filter::Filter;
use crate::index::{EventIndex, IndexConfig};
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::{InboundMessage, RelayConfig, RelayConnection, RelaySignal, RelayStatus};
use crate::router::SubscriptionRouter;
use crate::subscription::{EventCallback, Subscription, SubscriptionTracker, generate_subscription_id};
use crate::transport::{Connector, WebSocketConnector};
use futures::future::join_all;
use nostr::Event;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String },
    /// An event was received from a relay
    Event {
        relay_url: String,
        subscription_id: String,
        event: Event,
    },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: String,
        subscription_id: String,
    },
    /// All relays have sent EOSE for a subscription
    AllEose { subscription_id: String },
    /// OK response for a published event
    Ok {
        relay_url: String,
        event_id: String,
        success: bool,
        message: String,
    },
    /// Subscription closed by the relay
    Closed {
        relay_url: String,
        subscription_id: String,
        message: String,
    },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// Auth challenge that no policy answered
    Auth { relay_url: String, challenge: String },
    /// Authentication sent
    Authed { relay_url: String },
    /// Authentication handshake failed
    AuthFailed { relay_url: String, reason: String },
    /// Relay keeps dropping; reconnect manually
    Flapping { relay_url: String },
    /// Automatic reconnection gave up
    ReconnectHalted { relay_url: String, attempts: u32 },
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Template for every relay connection
    pub relay: RelayConfig,
    pub index: IndexConfig,
    /// Capacity of the pool event broadcast channel
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            index: IndexConfig::default(),
            event_capacity: 1000,
        }
    }
}

struct PooledRelay {
    connection: RelayConnection,
    /// Task turning relay signals into pool events
    forwarder: JoinHandle<()>,
}

struct PoolShared {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    auth: AuthContext,
    index: Arc<EventIndex>,
    router: SubscriptionRouter,
    relays: RwLock<HashMap<String, PooledRelay>>,
    /// Subscription trackers indexed by subscription ID
    trackers: RwLock<HashMap<String, SubscriptionTracker>>,
    events_tx: broadcast::Sender<PoolEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
}

/// A pool of Nostr relay connections.
///
/// Must be created inside a Tokio runtime.
pub struct RelayPool {
    shared: Arc<PoolShared>,
    pump: JoinHandle<()>,
    /// Default relays to connect to
    default_relays: Vec<String>,
}

fn relay_key(url: &str) -> String {
    Url::parse(url)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl RelayPool {
    /// Create a new relay pool.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Pool whose relays open sockets through `connector`.
    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let index = Arc::new(EventIndex::with_config(config.index.clone()));

        let shared = Arc::new(PoolShared {
            router: SubscriptionRouter::new(Arc::clone(&index) as _),
            index,
            config,
            connector,
            auth: AuthContext::new(),
            relays: RwLock::new(HashMap::new()),
            trackers: RwLock::new(HashMap::new()),
            events_tx,
            inbound_tx,
        });

        let pump = tokio::spawn(pump_inbound(Arc::downgrade(&shared), inbound_rx));

        Self {
            shared,
            pump,
            default_relays: Vec::new(),
        }
    }

    /// Create a new relay pool with default relays.
    pub fn with_relays(relays: Vec<String>) -> Self {
        let mut pool = Self::new();
        pool.default_relays = relays;
        pool
    }

    /// Subscribe to pool events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Local event cache.
    pub fn index(&self) -> &Arc<EventIndex> {
        &self.shared.index
    }

    pub fn auth_context(&self) -> &AuthContext {
        &self.shared.auth
    }

    /// Policy used by relays without their own.
    pub fn set_default_auth_policy(&self, policy: Option<Arc<dyn AuthPolicy>>) {
        self.shared.auth.set_policy(policy);
    }

    /// Signing identity for authentication.
    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        self.shared.auth.set_signer(signer);
    }

    /// Get all relay URLs in the pool.
    pub fn relay_urls(&self) -> Vec<String> {
        self.shared.relays.read().keys().cloned().collect()
    }

    pub fn relay(&self, url: &str) -> Option<RelayConnection> {
        self.shared
            .relays
            .read()
            .get(&relay_key(url))
            .map(|relay| relay.connection.clone())
    }

    /// Get statuses for all relays.
    pub fn statuses(&self) -> HashMap<String, RelayStatus> {
        self.shared
            .relays
            .read()
            .iter()
            .map(|(url, relay)| (url.clone(), relay.connection.status()))
            .collect()
    }

    /// Get the number of connected relays.
    pub fn connected_count(&self) -> usize {
        self.shared
            .relays
            .read()
            .values()
            .filter(|relay| relay.connection.is_available())
            .count()
    }

    /// Add a relay to the pool. Returns the existing connection if the
    /// relay is already present.
    pub fn add_relay(&self, url: &str) -> Result<RelayConnection> {
        let connection = RelayConnection::builder(url)
            .config(self.shared.config.relay.clone())
            .connector(Arc::clone(&self.shared.connector))
            .auth_context(self.shared.auth.clone())
            .inbound(self.shared.inbound_tx.clone())
            .build()?;
        let key = connection.url().to_string();

        let mut relays = self.shared.relays.write();
        if let Some(existing) = relays.get(&key) {
            return Ok(existing.connection.clone());
        }

        info!("Adding relay to pool: {}", key);
        let forwarder = tokio::spawn(forward_signals(
            Arc::downgrade(&self.shared),
            connection.clone(),
            connection.subscribe_signals(),
        ));
        relays.insert(
            key,
            PooledRelay {
                connection: connection.clone(),
                forwarder,
            },
        );
        Ok(connection)
    }

    /// Remove a relay from the pool.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let key = relay_key(url);
        let Some(relay) = self.shared.relays.write().remove(&key) else {
            return false;
        };
        info!("Removing relay from pool: {}", key);

        relay.forwarder.abort();
        relay.connection.disconnect().await;

        release_relay(&self.shared, &key);
        true
    }

    /// Connect to a specific relay, adding it if needed.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let connection = self.add_relay(url)?;
        connection.connect(None, true).await
    }

    /// Connect to all relays in the pool.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let connections: Vec<RelayConnection> = self
            .shared
            .relays
            .read()
            .values()
            .map(|relay| relay.connection.clone())
            .collect();

        join_all(connections.into_iter().map(|connection| async move {
            let result = connection.connect(None, true).await;
            (connection.url().to_string(), result)
        }))
        .await
    }

    /// Connect to default relays.
    pub async fn connect_default(&self) -> Vec<(String, Result<()>)> {
        for url in &self.default_relays {
            if let Err(e) = self.add_relay(url) {
                warn!("Skipping default relay {}: {}", url, e);
            }
        }
        self.connect_all().await
    }

    /// Disconnect from all relays.
    pub async fn disconnect_all(&self) {
        let connections: Vec<RelayConnection> = self
            .shared
            .relays
            .read()
            .values()
            .map(|relay| relay.connection.clone())
            .collect();

        join_all(connections.iter().map(|connection| connection.disconnect())).await;
    }

    /// Subscribe with a callback. Cached matches are delivered before this
    /// returns; live events follow as relays send them.
    pub fn subscribe(&self, filters: Vec<Filter>, callback: EventCallback) -> Result<Arc<Subscription>> {
        let subscription = Arc::new(Subscription::with_callback(
            generate_subscription_id(),
            filters,
            callback,
        ));
        self.register(Arc::clone(&subscription))?;
        Ok(subscription)
    }

    /// Subscribe with a channel receiving each matching event once.
    pub fn subscribe_with_channel(
        &self,
        filters: Vec<Filter>,
    ) -> Result<(Arc<Subscription>, mpsc::UnboundedReceiver<Event>)> {
        let (subscription, rx) = Subscription::with_channel(generate_subscription_id(), filters);
        let subscription = Arc::new(subscription);
        self.register(Arc::clone(&subscription))?;
        Ok((subscription, rx))
    }

    fn register(&self, subscription: Arc<Subscription>) -> Result<()> {
        for filter in subscription.filters() {
            filter.validate()?;
        }
        let id = subscription.id().to_string();
        info!(
            "Creating subscription {} with {} filters",
            id,
            subscription.filters().len()
        );

        let mut tracker = SubscriptionTracker::new(&id, subscription.filters().to_vec());
        let delivered = self.shared.router.subscribe(subscription)?;
        debug!("Subscription {} replayed {} cached events", id, delivered);

        // Held across the scan so a relay turning ready meanwhile finds the
        // tracker when it resubscribes.
        let mut trackers = self.shared.trackers.write();
        let relays = self.shared.relays.read();
        for (url, relay) in relays.iter() {
            // Authenticating relays already have a socket and queue the REQ.
            if !matches!(
                relay.connection.status(),
                RelayStatus::Connected | RelayStatus::Authenticating
            ) {
                continue;
            }
            match relay
                .connection
                .send(ClientMessage::req(&id, tracker.filters.clone()))
            {
                Ok(()) => tracker.add_relay(url),
                Err(e) => warn!("Failed to subscribe on {}: {}", url, e),
            }
        }
        drop(relays);

        trackers.insert(id, tracker);
        Ok(())
    }

    /// Stop a subscription and close it on every relay.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        info!("Closing subscription {}", subscription_id);
        let removed = self.shared.router.unsubscribe(subscription_id).is_some();
        let tracker = self.shared.trackers.write().remove(subscription_id);

        if let Some(tracker) = tracker {
            let relays = self.shared.relays.read();
            for url in &tracker.relays {
                if let Some(relay) = relays.get(url)
                    && let Err(e) = relay.connection.send(ClientMessage::close(subscription_id))
                {
                    debug!("Failed to unsubscribe {} on {}: {}", subscription_id, url, e);
                }
            }
        }
        removed
    }

    /// Get active subscription IDs.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.shared.router.subscription_ids()
    }

    /// Publish an event to all connected relays and cache it locally.
    pub fn publish(&self, event: Event) -> Vec<(String, Result<()>)> {
        self.shared.index.set_event(event.clone(), &[]);

        let relays = self.shared.relays.read();
        let results: Vec<(String, Result<()>)> = relays
            .iter()
            .filter(|(_, relay)| relay.connection.is_available())
            .map(|(url, relay)| {
                let result = relay.connection.send(ClientMessage::Event(event.clone()));
                (url.clone(), result)
            })
            .collect();

        if results.is_empty() {
            warn!("Event {} not sent: no connected relays", event.id);
        }
        results
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.pump.abort();
        for relay in self.shared.relays.read().values() {
            relay.forwarder.abort();
        }
    }
}

fn emit(shared: &PoolShared, event: PoolEvent) {
    let _ = shared.events_tx.send(event);
}

/// Route inbound protocol messages from every relay.
async fn pump_inbound(shared: Weak<PoolShared>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
    while let Some(InboundMessage { relay_url, message }) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let relay_url = relay_url.to_string();

        let pool_event = match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                // The index keeps the first copy of an id, so forgeries must
                // never reach it.
                if !matches!(nostr::verify_event(&event), Ok(true)) {
                    warn!("Dropping event {} from {}: bad id or signature", event.id, relay_url);
                    continue;
                }
                shared.router.handle_event(&event, &relay_url);
                PoolEvent::Event {
                    relay_url,
                    subscription_id,
                    event,
                }
            }
            RelayMessage::Eose { subscription_id } => {
                let completed = shared
                    .trackers
                    .write()
                    .get_mut(&subscription_id)
                    .is_some_and(|tracker| tracker.mark_eose(&relay_url));

                emit(
                    &shared,
                    PoolEvent::Eose {
                        relay_url,
                        subscription_id: subscription_id.clone(),
                    },
                );

                if !completed {
                    continue;
                }
                if let Some(subscription) = shared.router.get(&subscription_id) {
                    subscription.mark_eose();
                }
                PoolEvent::AllEose { subscription_id }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => PoolEvent::Ok {
                relay_url,
                event_id,
                success,
                message,
            },
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    "Subscription {} closed by {}: {}",
                    subscription_id, relay_url, message
                );
                if let Some(tracker) = shared.trackers.write().get_mut(&subscription_id) {
                    tracker.remove_relay(&relay_url);
                }
                PoolEvent::Closed {
                    relay_url,
                    subscription_id,
                    message,
                }
            }
            RelayMessage::Notice { message } => PoolEvent::Notice { relay_url, message },
            RelayMessage::Auth { .. } | RelayMessage::Count { .. } => continue,
        };

        emit(&shared, pool_event);
    }
}

/// Turn one relay's signals into pool events; resubscribe on every Ready.
async fn forward_signals(
    shared: Weak<PoolShared>,
    connection: RelayConnection,
    mut signals: broadcast::Receiver<RelaySignal>,
) {
    let relay_url = connection.url().to_string();
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Pool lagged {} signals from {}", skipped, relay_url);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let pool_event = match signal {
            RelaySignal::Connected => PoolEvent::Connected {
                relay_url: relay_url.clone(),
            },
            RelaySignal::Ready => {
                resubscribe(&shared, &connection, &relay_url);
                continue;
            }
            RelaySignal::Disconnected => {
                emit(
                    &shared,
                    PoolEvent::Disconnected {
                        relay_url: relay_url.clone(),
                    },
                );
                release_relay(&shared, &relay_url);
                continue;
            }
            RelaySignal::Auth { challenge } => PoolEvent::Auth {
                relay_url: relay_url.clone(),
                challenge,
            },
            RelaySignal::Authed => PoolEvent::Authed {
                relay_url: relay_url.clone(),
            },
            RelaySignal::AuthFailed { reason } => PoolEvent::AuthFailed {
                relay_url: relay_url.clone(),
                reason,
            },
            RelaySignal::Flapping(_) => PoolEvent::Flapping {
                relay_url: relay_url.clone(),
            },
            RelaySignal::ReconnectHalted { attempts } => PoolEvent::ReconnectHalted {
                relay_url: relay_url.clone(),
                attempts,
            },
            // Notices arrive through the inbound pump.
            RelaySignal::DelayedConnect(_) | RelaySignal::Notice(_) => continue,
        };

        emit(&shared, pool_event);
    }
}

fn resubscribe(shared: &PoolShared, connection: &RelayConnection, relay_url: &str) {
    let mut trackers = shared.trackers.write();
    for tracker in trackers.values_mut() {
        if tracker.has_relay(relay_url) {
            continue;
        }
        debug!("Sending subscription {} to {}", tracker.id, relay_url);
        match connection.send(ClientMessage::req(&tracker.id, tracker.filters.clone())) {
            Ok(()) => tracker.add_relay(relay_url),
            Err(e) => warn!("Failed to resubscribe {} on {}: {}", tracker.id, relay_url, e),
        }
    }
}

/// Forget `relay_url` in every tracker. Subscriptions that were only
/// waiting on this relay complete their EOSE set.
fn release_relay(shared: &PoolShared, relay_url: &str) {
    let completed: Vec<String> = shared
        .trackers
        .write()
        .values_mut()
        .filter_map(|tracker| {
            let was_complete = tracker.all_eose;
            tracker.remove_relay(relay_url);
            (!was_complete && tracker.all_eose).then(|| tracker.id.clone())
        })
        .collect();

    for subscription_id in completed {
        if let Some(subscription) = shared.router.get(&subscription_id) {
            subscription.mark_eose();
        }
        emit(shared, PoolEvent::AllEose { subscription_id });
    }
}
