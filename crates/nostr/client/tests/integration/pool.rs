//! Relay pool integration tests

use super::*;
use nostr_client::{PoolConfig, PoolEvent, RelayConfig, RelayPool, RelayStatus};
use pretty_assertions::assert_eq;

async fn next_pool_event(
    events: &mut broadcast::Receiver<PoolEvent>,
    wanted: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("pool event not received")
}

#[tokio::test]
async fn test_pool_connects_to_multiple_relays() {
    let relay_a = TestRelay::start().await;
    let relay_b = TestRelay::start().await;

    let pool = RelayPool::new();
    pool.add_relay(relay_a.url()).unwrap();
    pool.add_relay(relay_b.url()).unwrap();

    let results = pool.connect_all().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert_eq!(pool.connected_count(), 2);
    assert!(pool.statuses().values().all(|status| *status == RelayStatus::Connected));

    pool.disconnect_all().await;
    assert_eq!(pool.connected_count(), 0);
}

#[tokio::test]
async fn test_pool_subscription_deduplicates_across_relays() {
    let relay_a = TestRelay::start().await;
    let relay_b = TestRelay::start().await;
    let shared = signed_note("on both relays", now());
    let only_b = signed_note("only on b", now() - 10);
    relay_a.store(shared.clone());
    relay_b.store(shared.clone());
    relay_b.store(only_b.clone());

    let pool = RelayPool::new();
    let mut events = pool.events();
    pool.connect_relay(relay_a.url()).await.unwrap();
    pool.connect_relay(relay_b.url()).await.unwrap();

    let (subscription, mut rx) = pool
        .subscribe_with_channel(vec![Filter::new().kinds([KIND_SHORT_TEXT_NOTE])])
        .unwrap();

    let all_eose = next_pool_event(&mut events, |e| matches!(e, PoolEvent::AllEose { .. })).await;
    assert!(matches!(all_eose, PoolEvent::AllEose { subscription_id } if subscription_id == subscription.id()));
    assert!(subscription.has_eose());

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event.id);
    }
    received.sort();
    let mut expected = vec![shared.id.clone(), only_b.id.clone()];
    expected.sort();
    assert_eq!(received, expected);

    let mut hints = vec![
        pool.relay(relay_a.url()).unwrap().url().to_string(),
        pool.relay(relay_b.url()).unwrap().url().to_string(),
    ];
    hints.sort();
    assert_eq!(pool.index().relay_hints(&shared.id), hints);

    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_cached_events_replay_to_new_subscription() {
    let relay = TestRelay::start().await;
    let note = signed_note("cached", now());
    relay.store(note.clone());

    let pool = RelayPool::new();
    let mut events = pool.events();
    pool.connect_relay(relay.url()).await.unwrap();

    let (_first, _rx) = pool
        .subscribe_with_channel(vec![Filter::new().kinds([KIND_SHORT_TEXT_NOTE])])
        .unwrap();
    next_pool_event(&mut events, |e| matches!(e, PoolEvent::AllEose { .. })).await;
    assert!(pool.index().contains(&note.id));

    pool.disconnect_all().await;

    // Served from the index with no relay connected.
    let (_second, mut rx) = pool
        .subscribe_with_channel(vec![Filter::new().ids([note.id.clone()])])
        .unwrap();
    assert_eq!(rx.try_recv().unwrap().id, note.id);
}

#[tokio::test]
async fn test_pool_publish_reaches_relays() -> anyhow::Result<()> {
    let relay_a = TestRelay::start().await;
    let relay_b = TestRelay::start().await;

    let pool = RelayPool::new();
    let mut events = pool.events();
    pool.connect_relay(relay_a.url()).await?;
    pool.connect_relay(relay_b.url()).await?;

    let note = signed_note("published", now());
    let results = pool.publish(note.clone());
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert!(pool.index().contains(&note.id));

    for _ in 0..2 {
        let ok = next_pool_event(&mut events, |e| matches!(e, PoolEvent::Ok { .. })).await;
        assert!(matches!(ok, PoolEvent::Ok { event_id, success: true, .. } if event_id == note.id));
    }
    assert_eq!(relay_a.stored(), vec![note.clone()]);
    assert_eq!(relay_b.stored(), vec![note]);

    pool.disconnect_all().await;
    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_sends_close() {
    let relay = TestRelay::start().await;
    let pool = RelayPool::new();
    pool.connect_relay(relay.url()).await.unwrap();

    let (subscription, _rx) = pool.subscribe_with_channel(vec![Filter::new()]).unwrap();
    eventually("REQ to arrive", || relay.received("REQ").len() == 1).await;

    assert!(pool.unsubscribe(subscription.id()));
    eventually("CLOSE to arrive", || relay.received("CLOSE").len() == 1).await;
    assert_eq!(relay.received("CLOSE")[0][1], subscription.id());

    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_resubscribes_after_reconnect() {
    let relay = TestRelay::start().await;
    let config = PoolConfig {
        relay: RelayConfig {
            reconnect_window: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    };
    let pool = RelayPool::with_config(config);
    let mut events = pool.events();
    pool.connect_relay(relay.url()).await.unwrap();

    let (subscription, _rx) = pool.subscribe_with_channel(vec![Filter::new()]).unwrap();
    eventually("first REQ", || relay.received("REQ").len() == 1).await;

    relay.kick_all();
    next_pool_event(&mut events, |e| matches!(e, PoolEvent::Disconnected { .. })).await;
    next_pool_event(&mut events, |e| matches!(e, PoolEvent::Connected { .. })).await;

    eventually("REQ after reconnect", || relay.received("REQ").len() == 2).await;
    assert_eq!(relay.received("REQ")[1][1], subscription.id());
    assert_eq!(relay.connections(), 2);

    pool.disconnect_all().await;
}
