//! Nostr protocol types shared by the client crates.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, signing, verification)
//! - NIP-42: Authentication of clients to relays
//!
//! # Features
//!
//! - `full` (default): Full crypto support including key generation and signing
//! - `minimal`: Just Event type and serialization

mod nip01;
mod nip42;

// NIP-01: Basic protocol (Event type always available)
pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_RELAY_LIST, KIND_SHORT_TEXT_NOTE,
    Nip01Error, UnsignedEvent, serialize_event, sort_events, validate_event,
    validate_unsigned_event,
};

// NIP-01: Crypto functions (require full feature)
#[cfg(feature = "full")]
pub use nip01::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key, get_public_key_hex,
    verify_event,
};

// NIP-42: Client authentication
pub use nip42::{
    AUTH_TIME_TOLERANCE, KIND_CLIENT_AUTH, Nip42Error, create_auth_template, validate_auth_event,
};
