//! OAuth 2.0 authorization flow against the third-party provider.
//!
//! The authorization-code flow, end to end:
//! 1. GET /auth/login → redirect to the provider with a signed state
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to /auth/callback with `code` and `state`
//! 4. Verify the state, exchange the code, fetch the profile
//! 5. Upsert the identity and persist the encrypted credential pair
//!
//! Nothing in this module caches tokens between calls. Each callback is an
//! independent exchange, and the identity store holds the only durable copy
//! of any credential pair.

mod exchange;
mod provider;
mod state;

pub use exchange::{fetch_profile, refresh_credential_pair};
pub use provider::{ProviderConfig, ProviderEndpoints};
pub use state::{run_state_prune, StateError, StatePayload, StateSigner};

use crate::store::{CredentialPair, Identity, IdentityStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a callback handler needs after a successful code exchange.
#[derive(Debug)]
pub struct CallbackOutcome {
    pub identity: Identity,
    pub pair: CredentialPair,
    /// Name the account was registered under, recovered from the state
    pub account_name: String,
    /// Set when the flow was started by an already-authenticated identity
    /// adding another account
    pub origin_identity: Option<String>,
}

/// Callback failure, split by who has to act on it.
#[derive(Debug)]
pub enum FlowError {
    /// State rejected; the user restarts from the authorization step
    State(StateError),
    /// The provider refused or garbled the exchange or profile fetch
    Provider(anyhow::Error),
    /// Local persistence failed
    Store(anyhow::Error),
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::State(e) => write!(f, "{}", e),
            FlowError::Provider(e) => write!(f, "provider exchange failed: {}", e),
            FlowError::Store(e) => write!(f, "failed to persist credentials: {}", e),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<StateError> for FlowError {
    fn from(e: StateError) -> Self {
        FlowError::State(e)
    }
}

/// Builds authorization URLs and completes callbacks.
pub struct OAuthFlowManager {
    provider: ProviderConfig,
    signer: StateSigner,
    store: Arc<IdentityStore>,
}

impl OAuthFlowManager {
    pub fn new(provider: ProviderConfig, signer: StateSigner, store: Arc<IdentityStore>) -> Self {
        Self {
            provider,
            signer,
            store,
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Build the provider authorization URL for a new login or add-account
    /// flow. Returns the URL and the signed state embedded in it; every call
    /// issues a distinct nonce.
    pub fn build_authorization_url(
        &self,
        account_name: &str,
        origin_identity: Option<&str>,
    ) -> anyhow::Result<(String, String)> {
        let state = self.signer.issue(account_name, origin_identity)?;
        let url = self.provider.build_authorize_url(&state);

        debug!(
            account_name = %account_name,
            add_account = origin_identity.is_some(),
            "Issued authorization URL"
        );

        Ok((url, state))
    }

    /// Verify the callback state, exchange the code, and persist the result.
    ///
    /// The state check runs first so a forged or replayed callback never
    /// reaches the provider. On success the new pair is already sealed in
    /// the store; the returned plaintext copy exists only for the handler
    /// to hand to the current request.
    pub async fn complete_callback(
        &self,
        code: &str,
        raw_state: &str,
    ) -> Result<CallbackOutcome, FlowError> {
        let payload = self.signer.verify_and_consume(raw_state).map_err(|e| {
            warn!(error = %e, "OAuth callback state rejected");
            e
        })?;

        let pair = exchange::exchange_code_for_pair(&self.provider, code)
            .await
            .map_err(FlowError::Provider)?;

        let profile = exchange::fetch_profile(&self.provider, &pair.access_secret)
            .await
            .map_err(FlowError::Provider)?;

        let identity = self
            .store
            .create_or_update_identity(&profile)
            .map_err(FlowError::Store)?;

        self.store
            .save_credential(&identity.identity_id, &pair)
            .map_err(FlowError::Store)?;

        info!(
            identity_id = %identity.identity_id,
            account_name = %payload.account_name,
            has_refresh_token = pair.refresh_secret.is_some(),
            "OAuth flow completed"
        );

        Ok(CallbackOutcome {
            identity,
            pair,
            account_name: payload.account_name,
            origin_identity: payload.origin_identity,
        })
    }
}
