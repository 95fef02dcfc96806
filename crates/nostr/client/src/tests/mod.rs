//! Property-based tests and crate-level checks.


use nostr::Event;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a `RUST_LOG`-driven subscriber once per test binary.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Unsigned event with the given fields; matching never looks at signatures.
pub(crate) fn raw_event(id: &str, pubkey: &str, kind: u16, created_at: u64, tags: Vec<Vec<String>>) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content: String::new(),
        sig: String::new(),
    }
}

#[test]
fn test_default_relays() {
    assert!(!crate::DEFAULT_RELAYS.is_empty());
    for relay in crate::DEFAULT_RELAYS {
        assert!(relay.starts_with("wss://"));
    }
}

#[tokio::test]
async fn test_default_pool() {
    let pool = crate::default_pool();
    // Relays are added by connect_default, not at construction
    assert!(pool.relay_urls().is_empty());
    assert_eq!(pool.connected_count(), 0);
}
