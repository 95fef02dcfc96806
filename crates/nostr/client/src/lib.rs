//! Nostr relay client.
//!
//! This crate provides:
//! - Filter matching against NIP-01 subscription filters
//! - A local in-memory event index with relay hints
//! - Per-relay connections with automatic reconnection, flapping detection
//!   and NIP-42 authentication
//! - Subscription routing between cached and live events
//! - Connection pooling for multiple relays
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{Filter, PoolEvent, default_pool};
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let pool = default_pool();
//!     let mut events = pool.events();
//!
//!     pool.connect_default().await;
//!
//!     // Subscribe to kind 1 (text notes)
//!     let filter = Filter::new().kinds([1]).limit(10);
//!     let (_subscription, mut notes) = pool.subscribe_with_channel(vec![filter])?;
//!
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let PoolEvent::AllEose { subscription_id } = event {
//!                 println!("Got all stored events for {}", subscription_id);
//!             }
//!         }
//!     });
//!
//!     while let Some(note) = notes.recv().await {
//!         println!("Received event: {}", note.id);
//!     }
//!     Ok(())
//! }
//! ```

mod auth;
mod error;
mod filter;
mod index;
mod message;
mod pool;
mod relay;
mod router;
mod stats;
mod subscription;
mod transport;

#[cfg(test)]
mod tests;

// Re-export main types
pub use auth::{AuthContext, AuthDecision, AuthPolicy, Decline, KeySigner, SignIn, Signer, sign_challenge};
pub use error::{ClientError, Result};
pub use filter::{Filter, matches, matches_any};
pub use index::{EventIndex, EventStore, IndexConfig};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use pool::{PoolConfig, PoolEvent, RelayPool};
pub use relay::{
    InboundMessage, RelayConfig, RelayConnection, RelayConnectionBuilder, RelaySignal, RelayStatus,
};
pub use router::SubscriptionRouter;
pub use stats::{ConnectionStats, ReconnectBackoff};
pub use subscription::{
    EventCallback, Subscription, SubscriptionBuilder, SubscriptionTracker, generate_subscription_id,
};
pub use transport::{Connector, Outbound, SocketChannels, SocketEvent, WebSocketConnector};

/// Well-known public relays.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Create a relay pool with the default relays.
pub fn default_pool() -> RelayPool {
    RelayPool::with_relays(DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect())
}
