//! Per-request identity resolution.
//!
//! An ordered protocol, each step tried only if the previous yields
//! nothing:
//! 1. Structured context attached to this request by the transport layer
//! 2. The API key the request itself carried (header or query parameter)
//! 3. A degraded shared-token fallback, off by default
//!
//! Every input lives in an [`InboundRequest`] value owned by the request
//! being resolved. No step writes a token or identity into state shared
//! across requests; the historical cross-identity bleed came from exactly
//! that kind of shared variable.

use crate::config::FallbackConfig;
use crate::store::{Identity, IdentityStore};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};


/// Everything the resolver may consult about one inbound request.
///
/// Built per request and dropped with it.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Session key for account-switching state, when the client sent one
    pub session_key: Option<String>,
    /// Identity id already verified by the transport for this request
    pub verified_identity: Option<String>,
    /// Raw API key carried by this request, not yet validated
    pub api_key: Option<String>,
}

/// Why resolution failed.
///
/// `Unauthenticated` is deliberately distinct from the registry's
/// `Unauthorized`: the first means no identity at all, the second means an
/// identity tried to use someone else's handle.
#[derive(Debug)]
pub enum ResolveError {
    /// No step produced an identity; the user must authenticate
    Unauthenticated,
    /// Identity lookup plumbing failed
    Store(anyhow::Error),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Unauthenticated => {
                write!(f, "no identity resolved for this request, log in at /auth/login")
            }
            ResolveError::Store(e) => write!(f, "identity lookup failed: {}", e),
        }
    }
}

impl std::error::Error for ResolveError {}

/// One step of the resolution protocol.
///
/// `Ok(None)` means the step yields nothing and the next one runs; errors
/// abort resolution outright.
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, request: &InboundRequest) -> Result<Option<Identity>>;
}

/// Step 1: identity the transport layer already verified for this request.
pub struct StructuredContext {
    store: Arc<IdentityStore>,
}

impl StructuredContext {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }
}

impl ResolveStrategy for StructuredContext {
    fn name(&self) -> &'static str {
        "structured_context"
    }

    fn resolve(&self, request: &InboundRequest) -> Result<Option<Identity>> {
        if let Some(identity_id) = &request.verified_identity {
            let found = self.store.get_identity(identity_id)?;
            if found.is_none() {
                warn!(identity_id = %identity_id, "Verified identity no longer exists");
            }
            return Ok(found);
        }
        Ok(None)
    }
}

/// Step 2: the API key carried by the request itself.
///
/// The key is read from the request value and looked up; it is never
/// written anywhere that outlives the request.
pub struct TokenHint {
    store: Arc<IdentityStore>,
}

impl TokenHint {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }
}

impl ResolveStrategy for TokenHint {
    fn name(&self) -> &'static str {
        "token_hint"
    }

    fn resolve(&self, request: &InboundRequest) -> Result<Option<Identity>> {
        if let Some(api_key) = &request.api_key {
            let found = self.store.find_by_api_key(api_key)?;
            if found.is_none() {
                debug!("Request API key matched no identity");
            }
            return Ok(found);
        }
        Ok(None)
    }
}

struct FallbackLease {
    session_key: String,
    last_used: DateTime<Utc>,
}

/// Step 3: a single configured token serving every request that reaches it.
///
/// This exists for transports that cannot attach per-request identity. It
/// is unsafe under concurrent multi-user load (every caller becomes the same
/// identity), so it stays out of the strategy chain unless explicitly
/// enabled, and a lease limits it to one logical session at a time. A
/// second session is refused until the lease sits idle past the window.
pub struct SharedFallback {
    store: Arc<IdentityStore>,
    fallback_token: Option<String>,
    lease: Mutex<Option<FallbackLease>>,
    lease_idle: Duration,
}

impl SharedFallback {
    pub const DEFAULT_LEASE_IDLE_SECS: i64 = 60;

    pub fn new(
        store: Arc<IdentityStore>,
        fallback_token: Option<String>,
        lease_idle_secs: i64,
    ) -> Self {
        Self {
            store,
            fallback_token,
            lease: Mutex::new(None),
            lease_idle: Duration::seconds(lease_idle_secs),
        }
    }

    /// Builds the fallback step from its config section. Returns `None`
    /// unless the deployment opted in, which keeps the step out of the
    /// strategy chain entirely. The token itself comes from the
    /// `STAGEPASS_FALLBACK_TOKEN` environment variable, never the config
    /// file.
    pub fn from_config(store: Arc<IdentityStore>, config: &FallbackConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let token = std::env::var("STAGEPASS_FALLBACK_TOKEN").ok();
        if token.is_none() {
            warn!("Shared fallback enabled but STAGEPASS_FALLBACK_TOKEN is unset");
        }
        Some(Self::new(store, token, config.lease_idle_secs))
    }
}

impl ResolveStrategy for SharedFallback {
    fn name(&self) -> &'static str {
        "shared_fallback"
    }

    fn resolve(&self, request: &InboundRequest) -> Result<Option<Identity>> {
        let token = match &self.fallback_token {
            Some(token) => token,
            None => return Ok(None),
        };

        // Requests without a session key share one anonymous lease slot.
        let session_key = request.session_key.as_deref().unwrap_or("");
        let now = Utc::now();

        {
            let mut lease = self.lease.lock().unwrap();
            match lease.as_mut() {
                Some(held)
                    if held.session_key != session_key
                        && now - held.last_used <= self.lease_idle =>
                {
                    warn!(
                        session_key = %session_key,
                        "Shared fallback refused, another session holds the lease"
                    );
                    return Ok(None);
                }
                Some(held) if held.session_key == session_key => {
                    held.last_used = now;
                }
                _ => {
                    *lease = Some(FallbackLease {
                        session_key: session_key.to_string(),
                        last_used: now,
                    });
                }
            }
        }

        warn!(
            session_key = %session_key,
            "Resolving via shared fallback token; unsafe under concurrent multi-user load"
        );

        let found = self.store.find_by_api_key(token)?;
        if found.is_none() {
            warn!("Shared fallback token matches no identity");
        }
        Ok(found)
    }
}

/// Runs the resolution protocol over a fixed, ordered strategy chain.
pub struct RequestIdentityResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl RequestIdentityResolver {
    pub fn new(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain: structured context, then token hint, then the
    /// shared fallback only when the deployment opted into it.
    pub fn standard(store: Arc<IdentityStore>, fallback: Option<SharedFallback>) -> Self {
        let mut strategies: Vec<Box<dyn ResolveStrategy>> = vec![
            Box::new(StructuredContext::new(Arc::clone(&store))),
            Box::new(TokenHint::new(store)),
        ];
        if let Some(fallback) = fallback {
            strategies.push(Box::new(fallback));
        }
        Self::new(strategies)
    }

    /// Resolve the identity behind one inbound request.
    pub fn resolve(&self, request: &InboundRequest) -> Result<Identity, ResolveError> {
        for strategy in &self.strategies {
            match strategy.resolve(request) {
                Ok(Some(identity)) => {
                    debug!(
                        identity_id = %identity.identity_id,
                        strategy = strategy.name(),
                        "Resolved request identity"
                    );
                    return Ok(identity);
                }
                Ok(None) => continue,
                Err(e) => return Err(ResolveError::Store(e)),
            }
        }
        Err(ResolveError::Unauthenticated)
    }
}
