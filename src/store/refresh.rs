//! Refresh-before-expiry with per-identity single-flight.
//!
//! `refresh_if_needed` is the only path that exchanges a refresh secret for
//! a new pair. Concurrency rules:
//!
//! - One outbound refresh per identity at a time. Waiters queue on that
//!   identity's async lock and observe the attempt's published outcome,
//!   success or failure, instead of firing their own exchange.
//! - Unrelated identities never block each other (per-identity locks, not a
//!   process-wide one).
//! - The exchange runs in a spawned task holding the lock guard, so a caller
//!   that times out and drops its future does not abort the refresh for the
//!   waiters behind it; the result still lands in the store.
//! - A failed refresh returns the stale pair flagged `refresh_failed` rather
//!   than erroring, so a still-valid cached access secret keeps serving;
//!   the consecutive-failure counter eventually marks the identity
//!   `needs_reauth`.

use super::{CredentialPair, IdentityStore, StoreError};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Refresh tuning knobs, sourced from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshPolicy {
    /// Refresh when `expires_at` is within this many seconds of now
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u64,
    /// Consecutive failures before the identity is marked `needs_reauth`
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_buffer_secs() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            buffer_secs: default_buffer_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Result of [`IdentityStore::refresh_if_needed`].
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub pair: CredentialPair,
    /// True if this call (or a concurrent one it waited on) replaced the pair
    pub refreshed: bool,
    /// True if a refresh was attempted and failed; `pair` is the stale pair
    pub refresh_failed: bool,
}

/// Per-identity refresh serialization plus the published outcome of the
/// most recent attempt.
///
/// Callers contending for one identity queue on `lock`. A caller that sees
/// `attempts` move while it queued knows an exchange completed ahead of it
/// and adopts that attempt's outcome instead of firing another one.
#[derive(Debug, Default)]
pub(crate) struct RefreshGate {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Completed attempt count, bumped after the outcome is published
    attempts: AtomicU64,
    /// Error of the most recent attempt; `None` after a success
    last_error: Mutex<Option<String>>,
}

impl IdentityStore {
    /// Returns true if the pair does not need refreshing yet.
    ///
    /// A pair with no expiry never needs refreshing; one without a refresh
    /// secret cannot be refreshed and is served as-is until the provider
    /// rejects it.
    pub fn pair_is_fresh(&self, pair: &CredentialPair) -> bool {
        match (&pair.expires_at, &pair.refresh_secret) {
            (Some(expires_at), Some(_)) => {
                let threshold =
                    Utc::now() + Duration::seconds(self.refresh_policy().buffer_secs as i64);
                *expires_at > threshold
            }
            _ => true,
        }
    }

    /// Loads the identity's pair, refreshing it first when it is inside the
    /// expiry buffer.
    ///
    /// `refresh_fn` performs the outbound exchange (owned by the OAuth flow
    /// manager); it is invoked at most once per concurrent burst per
    /// identity. Callers queued behind a failed attempt receive the stale
    /// pair flagged `refresh_failed` without firing a second exchange; only
    /// a later, non-queued call retries.
    ///
    /// # Returns
    /// * `Ok(Some(outcome))` - Pair available (possibly stale, see flags)
    /// * `Ok(None)` - No pair stored for this identity
    /// * `Err(StoreError::Integrity)` - Stored pair failed decryption
    pub async fn refresh_if_needed<F, Fut>(
        self: &Arc<Self>,
        identity_id: &str,
        refresh_fn: F,
    ) -> Result<Option<RefreshOutcome>, StoreError>
    where
        F: FnOnce(CredentialPair) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<CredentialPair>> + Send + 'static,
    {
        // Fast path: no lock needed when the pair is comfortably fresh
        let pair = match self.load_credential(identity_id)? {
            Some(pair) => pair,
            None => return Ok(None),
        };
        if self.pair_is_fresh(&pair) {
            return Ok(Some(RefreshOutcome {
                pair,
                refreshed: false,
                refresh_failed: false,
            }));
        }

        let gate = self
            .refresh_locks
            .entry(identity_id.to_string())
            .or_insert_with(|| Arc::new(RefreshGate::default()))
            .clone();
        let seen_attempts = gate.attempts.load(Ordering::Acquire);
        let guard = gate.lock.clone().lock_owned().await;

        // Re-check inside the lock: the refresh we queued behind may have
        // already persisted a fresh pair
        let stale = match self.load_credential(identity_id)? {
            Some(pair) => pair,
            None => return Ok(None),
        };
        if self.pair_is_fresh(&stale) {
            return Ok(Some(RefreshOutcome {
                pair: stale,
                refreshed: true,
                refresh_failed: false,
            }));
        }

        // An attempt completed while we queued if the count moved. Its
        // failure is shared by the whole burst; waiters never fire their
        // own retry, so one burst records one failure.
        if gate.attempts.load(Ordering::Acquire) != seen_attempts {
            if let Some(error) = gate.last_error.lock().unwrap().clone() {
                warn!(
                    identity_id = %identity_id,
                    error = %error,
                    "Refresh already failed ahead of this caller; serving stale pair"
                );
                return Ok(Some(RefreshOutcome {
                    pair: stale,
                    refreshed: false,
                    refresh_failed: true,
                }));
            }
            // The finished attempt succeeded but its pair is already inside
            // the buffer again (very short-lived grant); refresh once more
        }

        info!(identity_id = %identity_id, "Refreshing credential pair before expiry");

        // Run the exchange in its own task holding the lock guard: if this
        // caller is cancelled mid-await, the refresh still completes, lands
        // in the store, and is published through the gate
        let store = Arc::clone(self);
        let id = identity_id.to_string();
        let exchange_input = stale.clone();
        let task_gate = Arc::clone(&gate);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = store.run_refresh_attempt(&id, exchange_input, refresh_fn).await;
            *task_gate.last_error.lock().unwrap() = result.as_ref().err().cloned();
            task_gate.attempts.fetch_add(1, Ordering::Release);
            result
        });

        match task.await {
            Ok(Ok(new_pair)) => Ok(Some(RefreshOutcome {
                pair: new_pair,
                refreshed: true,
                refresh_failed: false,
            })),
            Ok(Err(_)) => Ok(Some(RefreshOutcome {
                pair: stale,
                refreshed: false,
                refresh_failed: true,
            })),
            Err(join_err) => {
                warn!(identity_id = %identity_id, error = %join_err, "Refresh task aborted");
                Ok(Some(RefreshOutcome {
                    pair: stale,
                    refreshed: false,
                    refresh_failed: true,
                }))
            }
        }
    }

    /// One outbound exchange plus its bookkeeping. Success persists the new
    /// pair; failure bumps the consecutive-failure counter.
    async fn run_refresh_attempt<F, Fut>(
        &self,
        identity_id: &str,
        stale: CredentialPair,
        refresh_fn: F,
    ) -> Result<CredentialPair, String>
    where
        F: FnOnce(CredentialPair) -> Fut,
        Fut: Future<Output = anyhow::Result<CredentialPair>>,
    {
        match refresh_fn(stale).await {
            Ok(new_pair) => {
                self.save_credential(identity_id, &new_pair)
                    .map_err(|e| e.to_string())?;
                info!(identity_id = %identity_id, "Credential pair refreshed");
                Ok(new_pair)
            }
            Err(e) => {
                let failures = self
                    .record_refresh_failure(identity_id)
                    .map_err(|e| e.to_string())?;
                warn!(
                    identity_id = %identity_id,
                    consecutive_failures = failures,
                    error = %e,
                    "Credential refresh failed; serving stale pair"
                );
                Err(e.to_string())
            }
        }
    }
}
