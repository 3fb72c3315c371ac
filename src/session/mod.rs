//! Per-conversation session state: which account handle is active.
//!
//! Sessions are ephemeral and in-memory; a restart loses them and nothing
//! durability-critical is kept here. Each session belongs to exactly one
//! identity, and every alias it registers is ownership-checked through the
//! handle registry, so a handle from another identity can never be injected
//! into a session's alias table.


use crate::handles::{AccountHandleRegistry, HandleError};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One logical conversation's account-switching state.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub identity_id: String,
    /// Active handle; `None` until the first switch
    pub current_handle: Option<String>,
    /// Session-scoped account_name → handle aliases
    pub aliases: HashMap<String, String>,
    pub last_activity: DateTime<Utc>,
}

/// Session-layer failures. Every variant is user-recoverable and the
/// message says what to do next.
#[derive(Debug)]
pub enum SessionError {
    /// No explicit account name and no current handle.
    NoAccountSelected,
    /// The requested name has no alias in this session.
    UnknownAccountName(String),
    /// The session disappeared (restart or inactivity sweep).
    UnknownSession,
    /// Alias registration rejected by the handle registry.
    Handle(HandleError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NoAccountSelected => write!(
                f,
                "no account selected; switch to an account or pass an account name"
            ),
            SessionError::UnknownAccountName(name) => write!(
                f,
                "unknown account name '{}'; list your accounts for valid names",
                name
            ),
            SessionError::UnknownSession => {
                write!(f, "session not found or expired; retry the request")
            }
            SessionError::Handle(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<HandleError> for SessionError {
    fn from(e: HandleError) -> Self {
        SessionError::Handle(e)
    }
}

/// In-memory session table with inactivity-based eviction.
pub struct SessionTable {
    sessions: DashMap<String, Session>,
    registry: Arc<AccountHandleRegistry>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(registry: Arc<AccountHandleRegistry>, ttl_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Creates the session on its first resolved request; refreshes activity
    /// on later ones. A key reappearing under a different identity gets a
    /// fresh session rather than inheriting the old alias table.
    pub fn ensure_session(&self, session_key: &str, identity_id: &str) {
        let now = Utc::now();
        match self.sessions.get_mut(session_key) {
            Some(mut session) if session.identity_id == identity_id => {
                session.last_activity = session.last_activity.max(now);
            }
            Some(mut session) => {
                warn!(
                    session_id = %session_key,
                    "Session key reused by a different identity; resetting session state"
                );
                *session = Session {
                    session_id: session_key.to_string(),
                    identity_id: identity_id.to_string(),
                    current_handle: None,
                    aliases: HashMap::new(),
                    last_activity: now,
                };
            }
            None => {
                debug!(session_id = %session_key, "Creating session");
                self.sessions.insert(
                    session_key.to_string(),
                    Session {
                        session_id: session_key.to_string(),
                        identity_id: identity_id.to_string(),
                        current_handle: None,
                        aliases: HashMap::new(),
                        last_activity: now,
                    },
                );
            }
        }
    }

    /// Adds a name → handle alias after verifying through the registry that
    /// the handle belongs to the session's identity. Does not change the
    /// current handle.
    pub fn register_alias(
        &self,
        session_key: &str,
        account_name: &str,
        handle: &str,
    ) -> Result<(), SessionError> {
        let identity_id = self
            .sessions
            .get(session_key)
            .map(|s| s.identity_id.clone())
            .ok_or(SessionError::UnknownSession)?;

        // Cross-identity handle injection stops here
        self.registry.resolve(&identity_id, handle)?;

        let mut session = self
            .sessions
            .get_mut(session_key)
            .ok_or(SessionError::UnknownSession)?;
        session
            .aliases
            .insert(account_name.to_string(), handle.to_string());
        session.last_activity = session.last_activity.max(Utc::now());
        Ok(())
    }

    /// Makes the named account the session's current one. Idempotent.
    pub fn switch(&self, session_key: &str, account_name: &str) -> Result<String, SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_key)
            .ok_or(SessionError::UnknownSession)?;
        let handle = session
            .aliases
            .get(account_name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownAccountName(account_name.to_string()))?;

        session.current_handle = Some(handle.clone());
        session.last_activity = session.last_activity.max(Utc::now());
        info!(
            session_id = %session_key,
            account_name = %account_name,
            "Switched active account"
        );
        Ok(handle)
    }

    /// Picks the handle for one call.
    ///
    /// An explicit account name is a one-shot override: it resolves for this
    /// call only and leaves `current_handle` untouched. Without one, the
    /// current handle is used; with neither, the caller must pick an account
    /// first.
    pub fn resolve_for_call(
        &self,
        session_key: &str,
        explicit_name: Option<&str>,
    ) -> Result<String, SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_key)
            .ok_or(SessionError::UnknownSession)?;
        session.last_activity = session.last_activity.max(Utc::now());

        match explicit_name {
            Some(name) => session
                .aliases
                .get(name)
                .cloned()
                .ok_or_else(|| SessionError::UnknownAccountName(name.to_string())),
            None => session
                .current_handle
                .clone()
                .ok_or(SessionError::NoAccountSelected),
        }
    }

    /// Cloned view of a session, if present.
    pub fn get(&self, session_key: &str) -> Option<Session> {
        self.sessions.get(session_key).map(|s| s.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Evicts sessions idle past the inactivity TTL. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.last_activity >= cutoff);
        let removed = before - self.sessions.len();
        if removed > 0 {
            info!(removed = removed, "Swept inactive sessions");
        }
        removed
    }
}

/// Background task evicting idle sessions on an interval.
pub async fn run_session_sweep(table: Arc<SessionTable>, interval_secs: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        table.sweep();
    }
}
