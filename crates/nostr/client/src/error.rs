//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A policy asked for a signed answer but no signing identity is configured
    #[error("No signer available for authentication")]
    NoSigner,

    /// Event signing failed
    #[error("Signing error: {0}")]
    Signing(#[from] nostr::Nip01Error),

    /// Filter is structurally invalid
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Backing event store failed
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
