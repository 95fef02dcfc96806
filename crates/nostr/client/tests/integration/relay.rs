//! Single relay connection tests

use super::*;
use nostr_client::{ClientMessage, RelayConfig, RelayConnection, RelayMessage, RelaySignal, RelayStatus};
use tokio::sync::mpsc;

async fn next_signal(
    signals: &mut broadcast::Receiver<RelaySignal>,
    wanted: impl Fn(&RelaySignal) -> bool,
) -> RelaySignal {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let signal = signals.recv().await.unwrap();
            if wanted(&signal) {
                return signal;
            }
        }
    })
    .await
    .expect("signal not received")
}

#[tokio::test]
async fn test_connect_and_disconnect() -> anyhow::Result<()> {
    let relay = TestRelay::start().await;
    let connection = RelayConnection::new(relay.url())?;

    connection.connect(None, true).await?;
    assert_eq!(connection.status(), RelayStatus::Connected);
    assert_eq!(relay.connections(), 1);
    assert_eq!(connection.connection_stats().successes, 1);

    connection.disconnect().await;
    assert_eq!(connection.status(), RelayStatus::Disconnected);
    assert!(connection.connection_stats().connected_at.is_none());
    Ok(())
}

#[tokio::test]
async fn test_connect_refused_reports_error() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connection = RelayConnection::new(&format!("ws://{addr}")).unwrap();
    let mut signals = connection.subscribe_signals();

    assert!(connection.connect(None, false).await.is_err());
    assert_eq!(connection.status(), RelayStatus::Disconnected);
    let halted = next_signal(&mut signals, |s| matches!(s, RelaySignal::ReconnectHalted { .. })).await;
    assert!(matches!(halted, RelaySignal::ReconnectHalted { attempts: 1 }));
}

#[tokio::test]
async fn test_request_and_stored_events() {
    let relay = TestRelay::start().await;
    let note = signed_note("stored", now());
    relay.store(note.clone());

    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let connection = RelayConnection::builder(relay.url())
        .inbound(inbound_tx)
        .build()
        .unwrap();
    connection.connect(None, true).await.unwrap();

    connection
        .send(ClientMessage::req("sub1", vec![Filter::new().kinds([KIND_SHORT_TEXT_NOTE])]))
        .unwrap();

    let first = inbound.recv().await.unwrap();
    match first.message {
        RelayMessage::Event { subscription_id, event } => {
            assert_eq!(subscription_id, "sub1");
            assert_eq!(event, note);
        }
        other => panic!("expected EVENT, got {other:?}"),
    }
    let second = inbound.recv().await.unwrap();
    assert!(matches!(second.message, RelayMessage::Eose { ref subscription_id } if subscription_id == "sub1"));
    assert_eq!(first.relay_url.as_str(), connection.url().as_str());

    connection.disconnect().await;
}

#[tokio::test]
async fn test_relay_drop_triggers_reconnect() {
    let relay = TestRelay::start().await;
    let config = RelayConfig {
        reconnect_window: Duration::from_millis(200),
        ..Default::default()
    };
    let connection = RelayConnection::with_config(relay.url(), config).unwrap();
    let mut signals = connection.subscribe_signals();

    connection.connect(None, true).await.unwrap();
    relay.kick_all();

    next_signal(&mut signals, |s| matches!(s, RelaySignal::Disconnected)).await;
    let delayed = next_signal(&mut signals, |s| matches!(s, RelaySignal::DelayedConnect(_))).await;
    if let RelaySignal::DelayedConnect(delay) = delayed {
        assert!(delay <= Duration::from_millis(200));
    }

    next_signal(&mut signals, |s| matches!(s, RelaySignal::Ready)).await;
    assert_eq!(connection.status(), RelayStatus::Connected);
    assert_eq!(relay.connections(), 2);
    assert_eq!(connection.connection_stats().durations.len(), 1);

    connection.disconnect().await;
}
