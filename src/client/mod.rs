//! The capability boundary handed to tool logic.
//!
//! Everything outside this crate depends on one call:
//! `CredentialBroker::resolve_client(request, explicit_account_name)`.
//! It runs the full path: resolve the identity, consult the session,
//! resolve the handle, refresh the pair if it is about to expire, and
//! return a ready-to-use bearer client scoped to exactly that request.

use crate::config::StagepassConfig;
use crate::handles::{AccountHandleRegistry, HandleError};
use crate::oauth::{refresh_credential_pair, ProviderConfig};
use crate::resolver::{InboundRequest, RequestIdentityResolver, ResolveError, SharedFallback};
use crate::session::{run_session_sweep, SessionError, SessionTable};
use crate::store::{IdentityStore, StoreError};
use reqwest::{Method, RequestBuilder};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Unified error surface of the capability boundary.
///
/// Callers branch on these to tell the end user the next action: log in
/// again, pick a different account name, or just retry.
#[derive(Debug)]
pub enum BrokerError {
    /// No identity could be resolved for the request
    Unauthenticated,
    /// Identity resolved, but the handle or account is not theirs
    Unauthorized,
    /// Explicit account name matches nothing in this session
    UnknownAccountName(String),
    /// Session has no current account and no explicit name was given
    NoAccountSelected,
    /// Stored ciphertext failed its integrity check; treated as revoked
    Integrity,
    /// Refresh kept failing past the threshold; the grant is unusable
    RefreshFailed,
    /// Plumbing failure unrelated to the caller's input
    Internal(anyhow::Error),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Unauthenticated => {
                write!(f, "no identity resolved for this request, log in at /auth/login")
            }
            BrokerError::Unauthorized => {
                write!(f, "account handle does not belong to the requesting identity")
            }
            BrokerError::UnknownAccountName(name) => {
                write!(f, "unknown account name '{}', list your accounts or register it first", name)
            }
            BrokerError::NoAccountSelected => {
                write!(f, "no account selected for this session, switch to one first")
            }
            BrokerError::Integrity => {
                write!(f, "stored credentials are no longer readable, log in again at /auth/login")
            }
            BrokerError::RefreshFailed => {
                write!(f, "credential refresh keeps failing, log in again at /auth/login")
            }
            BrokerError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<ResolveError> for BrokerError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Unauthenticated => BrokerError::Unauthenticated,
            ResolveError::Store(e) => BrokerError::Internal(e),
        }
    }
}

impl From<HandleError> for BrokerError {
    fn from(e: HandleError) -> Self {
        match e {
            HandleError::Unauthorized => BrokerError::Unauthorized,
            HandleError::InvalidName(msg) => {
                BrokerError::Internal(anyhow::anyhow!("invalid account name: {}", msg))
            }
            HandleError::Store(e) => BrokerError::Internal(e),
        }
    }
}

impl From<SessionError> for BrokerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NoAccountSelected => BrokerError::NoAccountSelected,
            SessionError::UnknownAccountName(name) => BrokerError::UnknownAccountName(name),
            SessionError::UnknownSession => {
                BrokerError::Internal(anyhow::anyhow!("session disappeared mid-request"))
            }
            SessionError::Handle(e) => e.into(),
        }
    }
}

impl From<StoreError> for BrokerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Integrity => BrokerError::Integrity,
            StoreError::Database(e) => BrokerError::Internal(e),
        }
    }
}

/// A third-party API client carrying one request's resolved credential.
///
/// Request-scoped: built for a call, dropped with it, never cached.
pub struct ThirdPartyClient {
    http: reqwest::Client,
    credential_ref: String,
    access_secret: String,
}

impl ThirdPartyClient {
    fn new(credential_ref: String, access_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential_ref,
            access_secret,
        }
    }

    /// Identity whose credential pair this client carries.
    pub fn credential_ref(&self) -> &str {
        &self.credential_ref
    }

    /// Start a request with the bearer secret attached.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_secret)
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }
}

// Debug output must never contain the plaintext secret.
impl std::fmt::Debug for ThirdPartyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThirdPartyClient")
            .field("credential_ref", &self.credential_ref)
            .field("access_secret", &"<redacted>")
            .finish()
    }
}

/// Builds authenticated clients for resolved credential references, with
/// transparent refresh.
pub struct ThirdPartyClientFactory {
    store: Arc<IdentityStore>,
    provider: ProviderConfig,
}

impl ThirdPartyClientFactory {
    pub fn new(store: Arc<IdentityStore>, provider: ProviderConfig) -> Self {
        Self { store, provider }
    }

    /// Build a client for one credential reference.
    ///
    /// Runs the single-flight refresh when the pair is about to expire. A
    /// failed refresh below the failure threshold still yields a client on
    /// the stale pair; past the threshold the grant is surfaced as dead.
    pub async fn client_for(&self, credential_ref: &str) -> Result<ThirdPartyClient, BrokerError> {
        let provider = self.provider.clone();
        let outcome = self
            .store
            .refresh_if_needed(credential_ref, move |pair| async move {
                refresh_credential_pair(&provider, pair).await
            })
            .await?;

        let outcome = match outcome {
            Some(outcome) => outcome,
            // No pair on file: the identity never completed an OAuth flow
            None => return Err(BrokerError::Unauthenticated),
        };

        if outcome.refresh_failed {
            let flagged = self
                .store
                .get_identity(credential_ref)
                .map_err(BrokerError::Internal)?
                .map(|identity| identity.needs_reauth)
                .unwrap_or(true);
            if flagged {
                return Err(BrokerError::RefreshFailed);
            }
            warn!(
                credential_ref = %credential_ref,
                "Refresh failed below threshold, serving stale credential pair"
            );
        }

        Ok(ThirdPartyClient::new(
            credential_ref.to_string(),
            outcome.pair.access_secret,
        ))
    }
}

/// Facade wiring resolver, sessions, handle registry, and client factory.
pub struct CredentialBroker {
    resolver: RequestIdentityResolver,
    sessions: Arc<SessionTable>,
    registry: Arc<AccountHandleRegistry>,
    factory: ThirdPartyClientFactory,
    store: Arc<IdentityStore>,
}

impl CredentialBroker {
    pub fn new(
        resolver: RequestIdentityResolver,
        sessions: Arc<SessionTable>,
        registry: Arc<AccountHandleRegistry>,
        factory: ThirdPartyClientFactory,
        store: Arc<IdentityStore>,
    ) -> Self {
        Self {
            resolver,
            sessions,
            registry,
            factory,
            store,
        }
    }

    /// Wires the standard stack from configuration: a session table sized
    /// by `[sessions]` with its sweep task spawned, and the shared fallback
    /// appended only when `[fallback]` opted in (see
    /// [`SharedFallback::from_config`]).
    ///
    /// Call from within a Tokio runtime; the sweep task is spawned here.
    pub fn from_config(
        store: Arc<IdentityStore>,
        registry: Arc<AccountHandleRegistry>,
        provider: ProviderConfig,
        config: &StagepassConfig,
    ) -> Self {
        let sessions = Arc::new(SessionTable::new(
            Arc::clone(&registry),
            config.sessions.ttl_secs,
        ));
        tokio::spawn(run_session_sweep(
            Arc::clone(&sessions),
            config.sessions.sweep_interval_secs,
        ));

        let fallback = SharedFallback::from_config(Arc::clone(&store), &config.fallback);
        let resolver = RequestIdentityResolver::standard(Arc::clone(&store), fallback);
        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider);
        Self::new(resolver, sessions, registry, factory, store)
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<AccountHandleRegistry> {
        &self.registry
    }

    /// Resolve one inbound request to a ready-to-use third-party client.
    ///
    /// `explicit_account_name` applies to this call only and never mutates
    /// the session's current account. A session that has never registered
    /// or switched accounts falls back to the identity's own primary pair;
    /// an explicit name that matches nothing still fails.
    pub async fn resolve_client(
        &self,
        request: &InboundRequest,
        explicit_account_name: Option<&str>,
    ) -> Result<ThirdPartyClient, BrokerError> {
        let identity = self.resolver.resolve(request)?;

        self.store
            .touch_last_active(&identity.identity_id)
            .map_err(BrokerError::Internal)?;

        // Clients that sent no session key get a per-identity session.
        let session_key = request
            .session_key
            .clone()
            .unwrap_or_else(|| format!("identity:{}", identity.identity_id));
        self.sessions.ensure_session(&session_key, &identity.identity_id);

        let credential_ref =
            match self.sessions.resolve_for_call(&session_key, explicit_account_name) {
                Ok(handle) => self.registry.resolve(&identity.identity_id, &handle)?,
                Err(SessionError::NoAccountSelected) => {
                    debug!(
                        identity_id = %identity.identity_id,
                        "No account selected, using the identity's own credential pair"
                    );
                    identity.identity_id.clone()
                }
                Err(e) => return Err(e.into()),
            };

        self.factory.client_for(&credential_ref).await
    }
}
