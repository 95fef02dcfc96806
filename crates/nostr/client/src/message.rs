//! Relay protocol frames.
//!
//! - Client to relay: EVENT, REQ, CLOSE, AUTH
//! - Relay to client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH, COUNT
//!
//! Every frame is a JSON array whose first element names the message type.

use crate::filter::Filter;
use nostr::Event;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),

    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },

    /// `["AUTH", <signed kind 22242 event>]`
    Auth(Event),
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Short name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
            ClientMessage::Auth(_) => "AUTH",
        }
    }

    /// Serialize to the JSON array sent on the wire.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) | ClientMessage::Auth(event) => {
                serde_json::json!([self.kind(), event])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(Value::from("REQ"));
                frame.push(Value::from(subscription_id.as_str()));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },

    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },

    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },

    /// `["AUTH", <challenge>]`
    Auth { challenge: String },

    /// `["COUNT", <subscription_id>, {"count": <n>}]`
    Count { subscription_id: String, count: u64 },
}

fn required<'a>(frame: &'a [Value], index: usize, name: &'static str) -> Result<&'a Value, MessageError> {
    frame.get(index).ok_or(MessageError::MissingField(name))
}

fn required_str(frame: &[Value], index: usize, name: &'static str) -> Result<String, MessageError> {
    required(frame, index, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{name} is not a string")))
}

/// Human-readable trailing messages are optional in practice.
fn optional_str(frame: &[Value], index: usize) -> String {
    frame
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl RelayMessage {
    /// Parse a JSON frame received from a relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let msg_type = frame
            .first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                let subscription_id = required_str(&frame, 1, "subscription_id")?;
                let event = Event::deserialize(required(&frame, 2, "event")?)?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = required_str(&frame, 1, "event_id")?;
                let success = required(&frame, 2, "accepted")?
                    .as_bool()
                    .ok_or_else(|| MessageError::InvalidFormat("accepted is not a boolean".to_string()))?;
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message: optional_str(&frame, 3),
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: required_str(&frame, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: required_str(&frame, 1, "subscription_id")?,
                message: optional_str(&frame, 2),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: required_str(&frame, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: required_str(&frame, 1, "challenge")?,
            }),
            "COUNT" => {
                let subscription_id = required_str(&frame, 1, "subscription_id")?;
                let count = required(&frame, 2, "count")?
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or(MessageError::MissingField("count"))?;
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Subscription this frame belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            }
            | RelayMessage::Count {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}
