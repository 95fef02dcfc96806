//! NIP-42: Authentication of clients to relays.
//!
//! A relay sends `["AUTH", <challenge>]`; the client answers with a signed
//! ephemeral event of kind 22242 carrying the relay URL and the challenge.

use crate::nip01::{Event, EventTemplate};
use thiserror::Error;

/// Kind for client authentication events.
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Maximum clock skew accepted between the auth event and "now", in seconds.
pub const AUTH_TIME_TOLERANCE: u64 = 600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip42Error {
    #[error("wrong kind: expected {KIND_CLIENT_AUTH}, got {0}")]
    WrongKind(u16),

    #[error("missing tag: {0}")]
    MissingTag(&'static str),

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("relay mismatch: expected {expected}, got {actual}")]
    RelayMismatch { expected: String, actual: String },

    #[error("created_at {created_at} is too far from {now}")]
    Stale { created_at: u64, now: u64 },
}

/// Build the unsigned authentication event answering `challenge` from `relay_url`.
pub fn create_auth_template(relay_url: &str, challenge: &str, created_at: u64) -> EventTemplate {
    EventTemplate {
        created_at,
        kind: KIND_CLIENT_AUTH,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

fn normalize_relay_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// Check that `event` is a well-formed answer to `challenge` for `relay_url`.
///
/// Signature verification is left to the caller.
pub fn validate_auth_event(
    event: &Event,
    relay_url: &str,
    challenge: &str,
    now: u64,
) -> Result<(), Nip42Error> {
    if event.kind != KIND_CLIENT_AUTH {
        return Err(Nip42Error::WrongKind(event.kind));
    }

    let event_challenge = event
        .tag_value("challenge")
        .ok_or(Nip42Error::MissingTag("challenge"))?;
    if event_challenge != challenge {
        return Err(Nip42Error::ChallengeMismatch);
    }

    let event_relay = event.tag_value("relay").ok_or(Nip42Error::MissingTag("relay"))?;
    if normalize_relay_url(event_relay) != normalize_relay_url(relay_url) {
        return Err(Nip42Error::RelayMismatch {
            expected: relay_url.to_string(),
            actual: event_relay.to_string(),
        });
    }

    if event.created_at.abs_diff(now) > AUTH_TIME_TOLERANCE {
        return Err(Nip42Error::Stale {
            created_at: event.created_at,
            now,
        });
    }

    Ok(())
}
