//! NIP-42 authentication policies and signing identities.
//!
//! When a relay sends `["AUTH", <challenge>]`, the connection asks an
//! [`AuthPolicy`] what to do. The policy can hand back a ready-made event,
//! ask the connection to sign one with the configured [`Signer`], or
//! decline.
//!
//! Connections do not point back at the pool that owns them. The pool's
//! default policy and signer live in an [`AuthContext`], a cheap shared
//! handle that both sides hold.

use crate::error::Result;
use async_trait::async_trait;
use nostr::{Event, EventTemplate};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// What to answer an authentication challenge with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Send this signed kind 22242 event as is
    Send(Event),
    /// Sign a fresh answer with the context's signer
    Sign,
    /// Ignore the challenge
    Decline,
}

/// Decides how to answer a relay's authentication challenge.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    async fn on_challenge(&self, relay: &Url, challenge: &str) -> AuthDecision;
}

#[async_trait]
impl<F> AuthPolicy for F
where
    F: Fn(&Url, &str) -> AuthDecision + Send + Sync,
{
    async fn on_challenge(&self, relay: &Url, challenge: &str) -> AuthDecision {
        self(relay, challenge)
    }
}

/// Always authenticate with the configured signer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignIn;

#[async_trait]
impl AuthPolicy for SignIn {
    async fn on_challenge(&self, _relay: &Url, _challenge: &str) -> AuthDecision {
        AuthDecision::Sign
    }
}

/// Never authenticate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decline;

#[async_trait]
impl AuthPolicy for Decline {
    async fn on_challenge(&self, _relay: &Url, _challenge: &str) -> AuthDecision {
        AuthDecision::Decline
    }
}

/// A signing identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex-encoded x-only public key
    fn public_key(&self) -> &str;

    async fn sign(&self, template: EventTemplate) -> Result<Event>;
}

/// Signer holding a secret key in memory.
pub struct KeySigner {
    secret_key: [u8; 32],
    public_key: String,
}

impl KeySigner {
    pub fn new(secret_key: [u8; 32]) -> Result<Self> {
        let public_key = nostr::get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Signer for a freshly generated key.
    pub fn generate() -> Result<Self> {
        Self::new(nostr::generate_secret_key())
    }
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for KeySigner {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    async fn sign(&self, template: EventTemplate) -> Result<Event> {
        Ok(nostr::finalize_event(&template, &self.secret_key)?)
    }
}

/// Unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Sign a fresh answer to `challenge` from `relay`.
pub async fn sign_challenge(signer: &dyn Signer, relay: &Url, challenge: &str) -> Result<Event> {
    let template = nostr::create_auth_template(relay.as_str(), challenge, unix_now());
    signer.sign(template).await
}

#[derive(Default)]
struct AuthContextInner {
    policy: Option<Arc<dyn AuthPolicy>>,
    signer: Option<Arc<dyn Signer>>,
}

/// Client-wide default policy and signing identity.
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct AuthContext {
    inner: Arc<RwLock<AuthContextInner>>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: Option<Arc<dyn AuthPolicy>>) {
        self.inner.write().policy = policy;
    }

    pub fn policy(&self) -> Option<Arc<dyn AuthPolicy>> {
        self.inner.read().policy.clone()
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        self.inner.write().signer = signer;
    }

    pub fn signer(&self) -> Option<Arc<dyn Signer>> {
        self.inner.read().signer.clone()
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("AuthContext")
            .field("policy", &inner.policy.is_some())
            .field("signer", &inner.signer.as_ref().map(|s| s.public_key().to_string()))
            .finish()
    }
}
