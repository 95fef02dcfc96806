//! NIP-42 authentication against a challenging relay

use super::*;
use nostr_client::{AuthContext, AuthDecision, KeySigner, RelayConnection, RelaySignal, RelayStatus, SignIn, Signer};
use url::Url;

async fn wait_for(signals: &mut broadcast::Receiver<RelaySignal>, wanted: impl Fn(&RelaySignal) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !wanted(&signals.recv().await.unwrap()) {}
    })
    .await
    .expect("signal not received");
}

#[tokio::test]
async fn test_sign_in_policy_authenticates() {
    let relay = TestRelay::with_challenge("challenge-abc").await;
    let signer: Arc<dyn Signer> = Arc::new(KeySigner::generate().unwrap());
    let pubkey = signer.public_key().to_string();

    let auth = AuthContext::new();
    auth.set_signer(Some(signer));
    let connection = RelayConnection::builder(relay.url())
        .auth_context(auth)
        .auth_policy(Arc::new(SignIn))
        .build()
        .unwrap();
    let mut signals = connection.subscribe_signals();

    connection.connect(None, true).await.unwrap();
    wait_for(&mut signals, |s| matches!(s, RelaySignal::Authed)).await;

    eventually("relay to accept auth", || relay.authed() == vec![pubkey.clone()]).await;
    assert_eq!(connection.status(), RelayStatus::Connected);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_challenge_without_policy_is_surfaced() {
    let relay = TestRelay::with_challenge("challenge-xyz").await;
    let connection = RelayConnection::new(relay.url()).unwrap();
    let mut signals = connection.subscribe_signals();

    connection.connect(None, true).await.unwrap();
    wait_for(
        &mut signals,
        |s| matches!(s, RelaySignal::Auth { challenge } if challenge == "challenge-xyz"),
    )
    .await;

    assert_eq!(connection.status(), RelayStatus::Connected);
    assert!(relay.received("AUTH").is_empty());
    connection.disconnect().await;
}

#[tokio::test]
async fn test_closure_policy_can_decline() {
    let relay = TestRelay::with_challenge("challenge-no").await;
    let policy = |_relay: &Url, _challenge: &str| AuthDecision::Decline;
    let connection = RelayConnection::builder(relay.url())
        .auth_policy(Arc::new(policy))
        .build()
        .unwrap();

    connection.connect(None, true).await.unwrap();
    eventually("auth to settle", || connection.status() == RelayStatus::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(relay.received("AUTH").is_empty());
    assert!(relay.authed().is_empty());
    connection.disconnect().await;
}
