//! Single relay connection management
//!
//! A [`RelayConnection`] owns one socket to one relay and drives its state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Authenticating
//!       ^              |            |
//!       |              v            v (socket dropped)
//!       +------- (failure) <- Reconnecting <- timer
//!                                   |
//!                                   v
//!                                Flapping (needs a manual connect)
//! ```
//!
//! All state lives behind one lock per connection. Socket I/O, the
//! reconnect timer and caller calls only ever mutate it while holding that
//! lock, and the lock is never held across an await.

use crate::auth::{AuthContext, AuthDecision, AuthPolicy, sign_challenge};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::stats::{ConnectionStats, ReconnectBackoff};
use crate::transport::{Connector, Outbound, SocketChannels, SocketEvent, WebSocketConnector};
use nostr::Event;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStatus {
    /// No socket (initial)
    Disconnected,
    /// First connect attempt in flight
    Connecting,
    /// Socket open and usable
    Connected,
    /// Answering an authentication challenge
    Authenticating,
    /// Connect attempt in flight after a previous session or failure
    Reconnecting,
    /// Automatic reconnection halted: the relay drops at a steady interval
    Flapping,
    /// Caller-initiated close in progress
    Disconnecting,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayStatus::Disconnected => "disconnected",
            RelayStatus::Connecting => "connecting",
            RelayStatus::Connected => "connected",
            RelayStatus::Authenticating => "authenticating",
            RelayStatus::Reconnecting => "reconnecting",
            RelayStatus::Flapping => "flapping",
            RelayStatus::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Outcomes a connection reports to its observers.
#[derive(Debug, Clone)]
pub enum RelaySignal {
    /// Socket opened
    Connected,
    /// Ready for subscriptions; emitted right after `Connected`
    Ready,
    /// Socket closed
    Disconnected,
    /// Challenge received with no policy to answer it
    Auth { challenge: String },
    /// Authentication event sent
    Authed,
    /// The handshake could not complete
    AuthFailed { reason: String },
    /// Reconnection halted; carries the stats that triggered it
    Flapping(ConnectionStats),
    /// Next automatic attempt scheduled after this delay
    DelayedConnect(Duration),
    /// No further automatic attempts; reconnect manually
    ReconnectHalted { attempts: u32 },
    /// NOTICE from the relay
    Notice(String),
}

/// A protocol message received from a relay, other than AUTH.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub relay_url: Url,
    pub message: RelayMessage,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connect timeout used when `connect` is given none
    pub connect_timeout: Option<Duration>,
    /// How long `disconnect` waits for the socket to close
    pub close_timeout: Duration,
    /// Automatic attempts after a failure before giving up
    pub max_reconnect_attempts: u32,
    /// Sessions shorter than this delay the next attempt by the remainder
    pub reconnect_window: Duration,
    /// Linear step per attempt for a relay that never connected
    pub reconnect_step: Duration,
    /// Backoff added after the first failed automatic attempt
    pub retry_backoff_initial: Duration,
    /// Upper bound on the added backoff
    pub retry_backoff_max: Duration,
    /// Session-length standard deviation below which the relay is flapping
    pub flapping_stddev_threshold: Duration,
    /// Session lengths kept for flapping detection
    pub duration_window: usize,
    /// Capacity of the signal broadcast channel
    pub signal_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            close_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_window: Duration::from_secs(60),
            reconnect_step: Duration::from_secs(5),
            retry_backoff_initial: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
            flapping_stddev_threshold: Duration::from_millis(1000),
            duration_window: 100,
            signal_capacity: 1000,
        }
    }
}

impl RelayConfig {
    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            window: self.reconnect_window,
            step: self.reconnect_step,
            initial: self.retry_backoff_initial,
            max: self.retry_backoff_max,
        }
    }
}

/// Who started a connect attempt.
#[derive(Debug, Clone, Copy)]
enum AttemptOrigin {
    Caller { reconnect: bool },
    /// The reconnect timer, on its `retry`-th consecutive attempt
    Timer { retry: u32 },
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct State {
    status: RelayStatus,
    stats: ConnectionStats,
    timer: Option<PendingTimer>,
    timer_seq: u64,
    /// Task draining the live socket
    reader: Option<JoinHandle<()>>,
    /// Policy answering the live socket's latest challenge
    auth_task: Option<JoinHandle<()>>,
    /// Bumped per challenge; only the latest answer is applied
    auth_seq: u64,
    /// Bumped by every connect and disconnect; stale attempts compare unequal
    generation: u64,
    /// Generation of the attempt that opened the live socket
    socket: Option<u64>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    connect_timeout: Option<Duration>,
}

struct Inner {
    url: Url,
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    auth: AuthContext,
    auth_policy: RwLock<Option<Arc<dyn AuthPolicy>>>,
    inbound: Option<mpsc::UnboundedSender<InboundMessage>>,
    state: Mutex<State>,
    status_tx: watch::Sender<RelayStatus>,
    signals: broadcast::Sender<RelaySignal>,
}

/// Relay connection
///
/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

/// Builder for [`RelayConnection`].
pub struct RelayConnectionBuilder {
    url: String,
    config: RelayConfig,
    connector: Option<Arc<dyn Connector>>,
    auth: Option<AuthContext>,
    auth_policy: Option<Arc<dyn AuthPolicy>>,
    inbound: Option<mpsc::UnboundedSender<InboundMessage>>,
}

impl RelayConnectionBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Socket implementation; WebSocket by default.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Shared default policy and signer.
    pub fn auth_context(mut self, auth: AuthContext) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Policy for this relay, overriding the context's default.
    pub fn auth_policy(mut self, policy: Arc<dyn AuthPolicy>) -> Self {
        self.auth_policy = Some(policy);
        self
    }

    /// Where inbound protocol messages are forwarded.
    pub fn inbound(mut self, sink: mpsc::UnboundedSender<InboundMessage>) -> Self {
        self.inbound = Some(sink);
        self
    }

    pub fn build(self) -> Result<RelayConnection> {
        let url = Url::parse(&self.url)?;

        // Validate WebSocket URL
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (status_tx, _) = watch::channel(RelayStatus::Disconnected);
        let (signals, _) = broadcast::channel(self.config.signal_capacity.max(1));

        let state = State {
            status: RelayStatus::Disconnected,
            stats: ConnectionStats::new(self.config.duration_window),
            timer: None,
            timer_seq: 0,
            reader: None,
            auth_task: None,
            auth_seq: 0,
            generation: 0,
            socket: None,
            outbound: None,
            connect_timeout: self.config.connect_timeout,
        };

        Ok(RelayConnection {
            inner: Arc::new(Inner {
                url,
                config: self.config,
                connector: self.connector.unwrap_or_else(|| Arc::new(WebSocketConnector)),
                auth: self.auth.unwrap_or_default(),
                auth_policy: RwLock::new(self.auth_policy),
                inbound: self.inbound,
                state: Mutex::new(state),
                status_tx,
                signals,
            }),
        })
    }
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::builder(url).build()
    }

    /// Create a new relay connection with custom config
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        Self::builder(url).config(config).build()
    }

    pub fn builder(url: &str) -> RelayConnectionBuilder {
        RelayConnectionBuilder {
            url: url.to_string(),
            config: RelayConfig::default(),
            connector: None,
            auth: None,
            auth_policy: None,
            inbound: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Current status
    pub fn status(&self) -> RelayStatus {
        *self.inner.status_tx.borrow()
    }

    /// True iff the connection is `Connected`.
    pub fn is_available(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    /// Snapshot of the connection statistics.
    pub fn connection_stats(&self) -> ConnectionStats {
        self.inner.state.lock().stats.clone()
    }

    /// Timeout used by connects that do not pass one.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().connect_timeout
    }

    /// Receiver of status changes.
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Receiver of connection signals.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<RelaySignal> {
        self.inner.signals.subscribe()
    }

    /// Override the authentication policy for this relay. `None` falls back
    /// to the shared default.
    pub fn set_auth_policy(&self, policy: Option<Arc<dyn AuthPolicy>>) {
        *self.inner.auth_policy.write() = policy;
    }

    /// Connect to the relay.
    ///
    /// `timeout` replaces the recorded connect timeout for this and later
    /// attempts. With `reconnect`, a failure schedules automatic attempts;
    /// without it a failure emits [`RelaySignal::ReconnectHalted`]. The
    /// error is returned either way. A no-op while connected.
    pub async fn connect(&self, timeout: Option<Duration>, reconnect: bool) -> Result<()> {
        let attempt = {
            let mut state = self.inner.state.lock();
            self.inner.begin_attempt(&mut state, timeout)
        };
        match attempt {
            Some(attempt) => {
                self.inner
                    .run_attempt(attempt, AttemptOrigin::Caller { reconnect })
                    .await
            }
            None => Ok(()),
        }
    }

    /// Close the connection.
    ///
    /// Cancels any pending reconnect. Safe from any state; if the socket
    /// does not confirm the close within `close_timeout` the connection is
    /// marked disconnected anyway.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let closing = {
            let mut state = inner.state.lock();
            inner.cancel_timer(&mut state);
            state.generation += 1;

            match state.outbound.take() {
                None => {
                    state.socket = None;
                    state.stats.connected_at = None;
                    inner.set_status(&mut state, RelayStatus::Disconnected);
                    None
                }
                Some(outbound) => {
                    inner.set_status(&mut state, RelayStatus::Disconnecting);
                    if outbound.send(Outbound::Close).is_err() {
                        warn!("Failed to close socket to {}; forcing disconnect", inner.url);
                        inner.finish_close(&mut state);
                        None
                    } else {
                        Some(state.socket)
                    }
                }
            }
        };

        let Some(socket) = closing else {
            return;
        };

        info!("Disconnecting from relay: {}", inner.url);
        let mut status = inner.status_tx.subscribe();
        let closed = tokio::time::timeout(
            inner.config.close_timeout,
            status.wait_for(|status| *status != RelayStatus::Disconnecting),
        )
        .await
        .is_ok();

        if !closed {
            let mut state = inner.state.lock();
            if state.socket == socket && state.status == RelayStatus::Disconnecting {
                warn!(
                    "Relay {} did not close within {:?}; forcing disconnect",
                    inner.url, inner.config.close_timeout
                );
                inner.finish_close(&mut state);
            }
        }
    }

    /// Queue a message for the relay.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        let state = self.inner.state.lock();
        let outbound = state.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        debug!("Sending {} to {}", message.kind(), self.inner.url);
        outbound
            .send(Outbound::Message(message))
            .map_err(|_| ClientError::NotConnected)
    }
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url.as_str())
            .field("status", &self.status())
            .finish()
    }
}

struct Attempt {
    generation: u64,
    timeout: Option<Duration>,
}

impl Inner {
    fn set_status(&self, state: &mut State, status: RelayStatus) {
        if state.status != status {
            debug!("Relay {}: {} -> {}", self.url, state.status, status);
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn emit(&self, signal: RelaySignal) {
        // No receivers is fine.
        let _ = self.signals.send(signal);
    }

    fn cancel_timer(&self, state: &mut State) {
        if let Some(timer) = state.timer.take() {
            debug!("Cancelling pending reconnect to {}", self.url);
            timer.handle.abort();
        }
        state.stats.next_reconnect_at = None;
    }

    /// Start an attempt: cancel the timer, move to Connecting or
    /// Reconnecting, count it. `None` if already connected.
    fn begin_attempt(&self, state: &mut State, timeout: Option<Duration>) -> Option<Attempt> {
        if matches!(
            state.status,
            RelayStatus::Connected | RelayStatus::Authenticating
        ) {
            debug!("Relay {} already connected", self.url);
            return None;
        }

        self.cancel_timer(state);
        let next = if state.status == RelayStatus::Disconnected {
            RelayStatus::Connecting
        } else {
            RelayStatus::Reconnecting
        };
        self.set_status(state, next);
        state.stats.record_attempt();
        if timeout.is_some() {
            state.connect_timeout = timeout;
        }
        state.generation += 1;

        Some(Attempt {
            generation: state.generation,
            timeout: state.connect_timeout,
        })
    }

    async fn run_attempt(self: &Arc<Self>, attempt: Attempt, origin: AttemptOrigin) -> Result<()> {
        info!("Connecting to relay: {}", self.url);
        let connect_start = Instant::now();

        let opened = match attempt.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.connector.open(&self.url)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(format!(
                    "Connection timeout after {limit:?}"
                ))),
            },
            None => self.connector.open(&self.url).await,
        };

        match opened {
            Ok(channels) => self.on_open(attempt.generation, channels, connect_start),
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.url, e);
                self.on_open_failed(attempt.generation, origin);
                Err(e)
            }
        }
    }

    fn on_open(
        self: &Arc<Self>,
        generation: u64,
        channels: SocketChannels,
        connect_start: Instant,
    ) -> Result<()> {
        let SocketChannels { outbound, inbound } = channels;

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Discarding superseded connection to {}", self.url);
            let _ = outbound.send(Outbound::Close);
            return Err(ClientError::Connection(
                "connection attempt superseded".to_string(),
            ));
        }

        state.outbound = Some(outbound);
        state.socket = Some(generation);
        state.stats.record_success(Instant::now());
        self.set_status(&mut state, RelayStatus::Connected);
        drop(state);

        info!(
            "Connected to relay: {} (took {:?})",
            self.url,
            connect_start.elapsed()
        );
        self.emit(RelaySignal::Connected);
        self.emit(RelaySignal::Ready);
        let reader = self.spawn_reader(generation, inbound);
        let mut state = self.state.lock();
        if state.socket == Some(generation) {
            if let Some(stale) = state.reader.replace(reader) {
                stale.abort();
            }
        } else {
            // Force-closed before the reader started.
            reader.abort();
        }
        Ok(())
    }

    fn on_open_failed(self: &Arc<Self>, generation: u64, origin: AttemptOrigin) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        self.set_status(&mut state, RelayStatus::Disconnected);

        match origin {
            AttemptOrigin::Caller { reconnect: true } => self.schedule_reconnect(&mut state, 0),
            AttemptOrigin::Caller { reconnect: false } => {
                info!("Automatic reconnection disabled for {}", self.url);
                self.emit(RelaySignal::ReconnectHalted {
                    attempts: state.stats.attempts,
                });
            }
            AttemptOrigin::Timer { retry } => self.schedule_reconnect(&mut state, retry + 1),
        }
    }

    /// Schedule the `retry`-th automatic attempt.
    ///
    /// At most one timer is pending. Flapping relays and exhausted budgets
    /// are left for the caller.
    fn schedule_reconnect(self: &Arc<Self>, state: &mut State, retry: u32) {
        if state.timer.is_some() {
            debug!("Reconnect to {} already scheduled", self.url);
            return;
        }

        if retry >= self.config.max_reconnect_attempts {
            warn!(
                "Giving up on {} after {} automatic attempts",
                self.url, retry
            );
            self.emit(RelaySignal::ReconnectHalted {
                attempts: state.stats.attempts,
            });
            return;
        }

        let threshold_ms = self.config.flapping_stddev_threshold.as_secs_f64() * 1000.0;
        if state.stats.is_flapping(threshold_ms) {
            warn!(
                "Relay {} is flapping ({} short sessions); not reconnecting",
                self.url,
                state.stats.durations.len()
            );
            self.set_status(state, RelayStatus::Flapping);
            self.emit(RelaySignal::Flapping(state.stats.clone()));
            return;
        }

        let now = Instant::now();
        let delay = self.config.backoff().delay(&state.stats, retry, now);
        state.stats.next_reconnect_at = Some(now + delay);

        state.timer_seq += 1;
        let id = state.timer_seq;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire_reconnect(weak, id, retry).await;
        });
        state.timer = Some(PendingTimer { id, handle });

        info!("Reconnecting to {} in {:?}", self.url, delay);
        self.emit(RelaySignal::DelayedConnect(delay));
    }

    fn spawn_reader(
        self: &Arc<Self>,
        socket: u64,
        mut inbound: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                match inbound.recv().await {
                    Some(SocketEvent::Message(message)) => {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        inner.handle_message(socket, message);
                    }
                    Some(SocketEvent::Closed(reason)) => break reason,
                    None => break None,
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_closed(socket, reason);
            }
        })
    }

    fn handle_message(self: &Arc<Self>, socket: u64, message: RelayMessage) {
        if self.state.lock().socket != Some(socket) {
            debug!("Dropping message from closed socket to {}", self.url);
            return;
        }
        match message {
            RelayMessage::Auth { challenge } => self.handle_auth(socket, challenge),
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", self.url, message);
                self.emit(RelaySignal::Notice(message.clone()));
                self.forward(RelayMessage::Notice { message });
            }
            other => self.forward(other),
        }
    }

    fn forward(&self, message: RelayMessage) {
        if let Some(sink) = &self.inbound
            && sink
                .send(InboundMessage {
                    relay_url: self.url.clone(),
                    message,
                })
                .is_err()
        {
            debug!("Inbound sink for {} is closed", self.url);
        }
    }

    /// Answer a challenge on `socket`.
    ///
    /// The policy runs in its own task so the reader keeps draining the
    /// socket; a close aborts it.
    fn handle_auth(self: &Arc<Self>, socket: u64, challenge: String) {
        let policy = self
            .auth_policy
            .read()
            .clone()
            .or_else(|| self.auth.policy());

        let Some(policy) = policy else {
            info!("Auth challenge from {} with no policy", self.url);
            self.emit(RelaySignal::Auth { challenge });
            return;
        };

        let mut state = self.state.lock();
        if state.socket != Some(socket) {
            return;
        }
        if state.status != RelayStatus::Authenticating {
            self.set_status(&mut state, RelayStatus::Authenticating);
        }

        state.auth_seq += 1;
        let seq = state.auth_seq;
        let weak = Arc::downgrade(self);
        let url = self.url.clone();
        let auth = self.auth.clone();
        let task = tokio::spawn(async move {
            let outcome = match policy.on_challenge(&url, &challenge).await {
                AuthDecision::Send(event) => Ok(Some(event)),
                AuthDecision::Sign => match auth.signer() {
                    Some(signer) => sign_challenge(signer.as_ref(), &url, &challenge)
                        .await
                        .map(Some),
                    None => Err(ClientError::NoSigner),
                },
                AuthDecision::Decline => Ok(None),
            };
            if let Some(inner) = weak.upgrade() {
                inner.finish_auth(socket, seq, outcome);
            }
        });
        // A newer challenge replaces the one still being answered.
        if let Some(previous) = state.auth_task.replace(task) {
            previous.abort();
        }
    }

    fn finish_auth(&self, socket: u64, seq: u64, outcome: Result<Option<Event>>) {
        let mut state = self.state.lock();
        if state.socket != Some(socket)
            || state.auth_seq != seq
            || state.status != RelayStatus::Authenticating
        {
            debug!("Auth for {} finished after the session changed", self.url);
            return;
        }
        state.auth_task = None;

        match outcome {
            Ok(Some(event)) => {
                let sent = state.outbound.as_ref().is_some_and(|outbound| {
                    outbound
                        .send(Outbound::Message(ClientMessage::Auth(event)))
                        .is_ok()
                });
                self.set_status(&mut state, RelayStatus::Connected);
                if sent {
                    info!("Authenticated to {}", self.url);
                    self.emit(RelaySignal::Authed);
                } else {
                    self.emit(RelaySignal::AuthFailed {
                        reason: "socket closed".to_string(),
                    });
                }
            }
            Ok(None) => {
                info!("Declined auth challenge from {}", self.url);
                self.set_status(&mut state, RelayStatus::Connected);
            }
            Err(e) => {
                warn!("Authentication to {} failed: {}", self.url, e);
                self.set_status(&mut state, RelayStatus::Connected);
                self.emit(RelaySignal::AuthFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Abort tasks tied to the live socket. The reader is left alone when it
    /// is the caller.
    fn abort_session_tasks(state: &mut State, abort_reader: bool) {
        if let Some(task) = state.auth_task.take() {
            task.abort();
        }
        if let Some(reader) = state.reader.take()
            && abort_reader
        {
            reader.abort();
        }
    }

    fn on_socket_closed(self: &Arc<Self>, socket: u64, reason: Option<String>) {
        let mut state = self.state.lock();
        if state.socket != Some(socket) {
            return;
        }
        state.socket = None;
        state.outbound = None;
        Self::abort_session_tasks(&mut state, false);

        match state.status {
            RelayStatus::Connected | RelayStatus::Authenticating => {
                let duration = state.stats.record_disconnect(Instant::now());
                info!(
                    "Relay {} dropped after {} ms ({})",
                    self.url,
                    duration.unwrap_or_default(),
                    reason.as_deref().unwrap_or("no reason")
                );
                self.set_status(&mut state, RelayStatus::Disconnected);
                self.emit(RelaySignal::Disconnected);
                self.schedule_reconnect(&mut state, 0);
            }
            RelayStatus::Disconnecting => {
                state.stats.connected_at = None;
                self.set_status(&mut state, RelayStatus::Disconnected);
                info!("Disconnected from relay: {}", self.url);
                self.emit(RelaySignal::Disconnected);
            }
            // A newer attempt owns the status.
            _ => self.emit(RelaySignal::Disconnected),
        }
    }

    fn finish_close(&self, state: &mut State) {
        state.socket = None;
        state.outbound = None;
        Self::abort_session_tasks(state, true);
        state.stats.connected_at = None;
        self.set_status(state, RelayStatus::Disconnected);
        self.emit(RelaySignal::Disconnected);
    }
}

async fn fire_reconnect(weak: Weak<Inner>, timer_id: u64, retry: u32) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let attempt = {
        let mut state = inner.state.lock();
        // Cancelled while waking up.
        if state.timer.as_ref().map(|timer| timer.id) != Some(timer_id) {
            return;
        }
        state.timer = None;
        state.stats.next_reconnect_at = None;
        inner.set_status(&mut state, RelayStatus::Reconnecting);
        inner.begin_attempt(&mut state, None)
    };

    if let Some(attempt) = attempt
        && let Err(e) = inner.run_attempt(attempt, AttemptOrigin::Timer { retry }).await
    {
        debug!("Reconnect attempt {} to {} failed: {}", retry + 1, inner.url, e);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        Inner::abort_session_tasks(state, true);
    }
}
