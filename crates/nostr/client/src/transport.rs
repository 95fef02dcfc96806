//! Socket seam between a relay connection and the network.
//!
//! A [`Connector`] opens a socket and hands back a pair of channels. The
//! relay state machine only ever talks to those channels, which lets tests
//! script connection outcomes without a network.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Frames queued for the socket writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ClientMessage),
    /// Start a clean close handshake
    Close,
}

/// What the socket reader reports.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Message(RelayMessage),
    /// The socket is gone. Always the last event on the channel.
    Closed(Option<String>),
}

/// Both directions of an open socket.
#[derive(Debug)]
pub struct SocketChannels {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets to relays.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`. Resolves once the socket is usable.
    async fn open(&self, url: &Url) -> Result<SocketChannels>;
}

/// WebSocket transport over `tokio-tungstenite`.
///
/// Each socket gets a writer task draining [`Outbound`] frames and a reader
/// task parsing relay frames. Frames that fail to parse are logged and
/// dropped without closing the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<SocketChannels> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketEvent>();

        let relay = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outbound::Message(msg) => {
                        let json = match msg.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Dropping unserializable {} for {}: {}", msg.kind(), relay, e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::text(json)).await {
                            warn!("Write to {} failed: {}", relay, e);
                            break;
                        }
                    }
                    Outbound::Close => {
                        debug!("Closing socket to {}", relay);
                        if let Err(e) = write.close().await {
                            debug!("Close handshake with {} failed: {}", relay, e);
                        }
                        break;
                    }
                }
            }
        });

        let relay = url.to_string();
        tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    frame = read.next() => frame,
                    _ = inbound_tx.closed() => break None,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => match RelayMessage::from_json(text.as_str()) {
                        Ok(msg) => {
                            if inbound_tx.send(SocketEvent::Message(msg)).is_err() {
                                break None;
                            }
                        }
                        Err(e) => warn!("Unparseable frame from {}: {}", relay, e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Relay {} closed connection", relay);
                        break frame.map(|f| f.reason.to_string());
                    }
                    // Pings are answered by tungstenite on the next write.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", relay, e);
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = inbound_tx.send(SocketEvent::Closed(reason));
        });

        Ok(SocketChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
