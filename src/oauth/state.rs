//! Signed OAuth state for CSRF protection.
//!
//! The state parameter carries its own payload (nonce, account name, and the
//! origin identity for add-account flows) signed with HMAC-SHA256, so the
//! callback can recover the account name without a server-side session
//! lookup. A consumed-nonce set makes every state single-use.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

/// Payload recovered from a verified state parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    /// Unique per issued state; consumed on first successful verification
    pub nonce: String,
    /// Name the new account will be registered under
    pub account_name: String,
    /// Identity that initiated an add-account flow, absent for first logins
    pub origin_identity: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Why a state parameter was rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum StateError {
    /// Malformed, signature mismatch, or nonce already consumed
    Invalid,
    /// Signature valid but issued longer ago than the configured TTL
    Expired,
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Invalid => write!(f, "invalid OAuth state, restart the login flow"),
            StateError::Expired => write!(f, "expired OAuth state, restart the login flow"),
        }
    }
}

impl std::error::Error for StateError {}

/// Issues and verifies signed state parameters.
///
/// Cheap to clone; the consumed-nonce set is shared across clones.
#[derive(Clone)]
pub struct StateSigner {
    mac: Hmac<Sha256>,
    ttl: Duration,
    consumed: Arc<DashMap<String, DateTime<Utc>>>,
}

impl StateSigner {
    /// Create a signer keyed by the process-wide secret.
    ///
    /// # Arguments
    /// * `key` - Signing key bytes (the vault key is reused here)
    /// * `ttl_seconds` - How long issued states remain valid (default 600)
    pub fn new(key: &[u8], ttl_seconds: i64) -> anyhow::Result<Self> {
        use anyhow::Context;
        let mac = Hmac::<Sha256>::new_from_slice(key)
            .context("failed to initialize OAuth state signer")?;
        Ok(Self {
            mac,
            ttl: Duration::seconds(ttl_seconds),
            consumed: Arc::new(DashMap::new()),
        })
    }

    /// Issue a signed state embedding a fresh nonce.
    pub fn issue(&self, account_name: &str, origin_identity: Option<&str>) -> anyhow::Result<String> {
        use anyhow::Context;
        let payload = StatePayload {
            nonce: Uuid::new_v4().to_string(),
            account_name: account_name.to_string(),
            origin_identity: origin_identity.map(String::from),
            issued_at: Utc::now(),
        };

        let body = serde_json::to_vec(&payload).context("failed to encode OAuth state payload")?;
        let encoded = URL_SAFE_NO_PAD.encode(&body);

        let mut mac = self.mac.clone();
        mac.update(encoded.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", encoded, signature))
    }

    /// Verify a state parameter and consume its nonce.
    ///
    /// Any malformation, signature mismatch, or nonce reuse is reported as
    /// `Invalid`; a good signature past the TTL is `Expired`. Both mean the
    /// caller must restart the flow from the authorization step.
    pub fn verify_and_consume(&self, raw: &str) -> Result<StatePayload, StateError> {
        let (encoded, signature) = raw.split_once('.').ok_or(StateError::Invalid)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StateError::Invalid)?;

        let mut mac = self.mac.clone();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature_bytes)
            .map_err(|_| StateError::Invalid)?;

        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| StateError::Invalid)?;
        let payload: StatePayload =
            serde_json::from_slice(&body).map_err(|_| StateError::Invalid)?;

        if Utc::now() - payload.issued_at > self.ttl {
            return Err(StateError::Expired);
        }

        // Single-use: a nonce already in the set means a replay.
        if self
            .consumed
            .insert(payload.nonce.clone(), Utc::now())
            .is_some()
        {
            return Err(StateError::Invalid);
        }

        Ok(payload)
    }

    /// Drop consumed-nonce records older than the TTL; the states they guard
    /// can no longer verify anyway.
    pub fn prune_consumed(&self) {
        let cutoff = Utc::now() - self.ttl;
        self.consumed.retain(|_, consumed_at| *consumed_at > cutoff);
    }

    /// Count of tracked consumed nonces (for monitoring).
    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }
}

/// Background task to periodically prune consumed-nonce records.
pub async fn run_state_prune(signer: StateSigner, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        signer.prune_consumed();
        tracing::debug!(
            "OAuth state prune complete, {} consumed nonces tracked",
            signer.consumed_count()
        );
    }
}
