//! Integration tests for nostr-client against an in-process relay
//!
//! The relay speaks just enough NIP-01 and NIP-42 to exercise the client:
//! it stores EVENTs, answers REQ from its store followed by EOSE, and
//! validates AUTH answers to its challenge.

mod auth;
mod pool;
mod relay;

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, KIND_SHORT_TEXT_NOTE, finalize_event, generate_secret_key};
use nostr_client::Filter;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A signed kind 1 note from a fresh key.
pub fn signed_note(content: &str, created_at: u64) -> Event {
    let template = EventTemplate {
        kind: KIND_SHORT_TEXT_NOTE,
        tags: vec![],
        content: content.to_string(),
        created_at,
    };
    finalize_event(&template, &generate_secret_key()).unwrap()
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct RelayState {
    url: String,
    challenge: Option<String>,
    events: Mutex<Vec<Event>>,
    received: Mutex<Vec<Value>>,
    authed: Mutex<Vec<String>>,
    connections: AtomicUsize,
    kick: broadcast::Sender<()>,
}

/// In-process relay listening on an ephemeral port.
pub struct TestRelay {
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Relay that sends `challenge` to every new connection.
    pub async fn with_challenge(challenge: &str) -> Self {
        Self::spawn(Some(challenge.to_string())).await
    }

    async fn spawn(challenge: Option<String>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kick, _) = broadcast::channel(16);

        let state = Arc::new(RelayState {
            url: format!("ws://{addr}"),
            challenge,
            events: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            authed: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            kick,
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { state, task }
    }

    pub fn url(&self) -> &str {
        &self.state.url
    }

    /// Preload an event into the relay's store.
    pub fn store(&self, event: Event) {
        self.state.events.lock().push(event);
    }

    pub fn stored(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    /// Frames received of the given type (`"REQ"`, `"EVENT"`, ...).
    pub fn received(&self, kind: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|frame| frame[0] == kind)
            .cloned()
            .collect()
    }

    /// Pubkeys that completed authentication.
    pub fn authed(&self) -> Vec<String> {
        self.state.authed.lock().clone()
    }

    /// Sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open socket from the relay side.
    pub fn kick_all(&self) {
        let _ = self.state.kick.send(());
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<RelayState>) {
    let Ok(socket) = accept_async(stream).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut kick = state.kick.subscribe();
    let (mut write, mut read) = socket.split();

    if let Some(challenge) = &state.challenge {
        let frame = json!(["AUTH", challenge]).to_string();
        if write.send(Message::text(frame)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = write.close().await;
                return;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    state.received.lock().push(frame.clone());
                    for reply in respond(&state, &frame) {
                        if write.send(Message::text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    }
}

fn respond(state: &RelayState, frame: &Value) -> Vec<Value> {
    match frame[0].as_str() {
        Some("EVENT") => {
            let Ok(event) = Event::deserialize(&frame[1]) else {
                return vec![json!(["NOTICE", "invalid event"])];
            };
            let id = event.id.clone();
            let mut events = state.events.lock();
            if !events.iter().any(|stored| stored.id == id) {
                events.push(event);
            }
            vec![json!(["OK", id, true, ""])]
        }
        Some("REQ") => {
            let subscription_id = frame[1].as_str().unwrap_or_default().to_string();
            let filters: Vec<Filter> = frame
                .as_array()
                .map(|parts| {
                    parts[2..]
                        .iter()
                        .filter_map(|value| Filter::deserialize(value).ok())
                        .collect()
                })
                .unwrap_or_default();

            let mut replies: Vec<Value> = state
                .events
                .lock()
                .iter()
                .filter(|event| nostr_client::matches_any(event, &filters))
                .map(|event| json!(["EVENT", subscription_id, event]))
                .collect();
            replies.push(json!(["EOSE", subscription_id]));
            replies
        }
        Some("AUTH") => {
            let Ok(event) = Event::deserialize(&frame[1]) else {
                return vec![json!(["NOTICE", "invalid auth"])];
            };
            let challenge = state.challenge.as_deref().unwrap_or_default();
            let verified = nostr::verify_event(&event).unwrap_or(false);
            match nostr::validate_auth_event(&event, &state.url, challenge, now()) {
                Ok(()) if verified => {
                    state.authed.lock().push(event.pubkey.clone());
                    vec![json!(["OK", event.id, true, ""])]
                }
                Ok(()) => vec![json!(["OK", event.id, false, "invalid: bad signature"])],
                Err(e) => vec![json!(["OK", event.id, false, format!("auth-required: {e}")])],
            }
        }
        _ => vec![],
    }
}
