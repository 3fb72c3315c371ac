//! Account handle registry: opaque indirection for multi-account access.
//!
//! A handle stands in for one credential pair and is the only account
//! reference that ever leaves the trust boundary. Handles are random (no
//! structure, nothing to decode), globally unique, and only resolvable
//! through this registry with an identity-scoped check: a handle learned or
//! guessed from another identity never resolves.

use crate::store::IdentityStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

/// Handle length in random base-36 characters. 26 chars ≈ 134 bits of
/// entropy, above the 128-bit guessing-infeasibility floor.
const HANDLE_LEN: usize = 26;

/// One registered account: (owner, name) → handle → credential reference.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountHandle {
    /// Opaque token (`acct_{random_26chars}`); never encodes the credential
    pub handle: String,
    /// Identity whose sessions may use this handle
    pub owner_identity: String,
    /// Human-chosen name ("work", "personal", ...)
    pub account_name: String,
    /// Identity id owning the referenced credential pair
    pub credential_ref: String,
    /// True for the handle created by the owner's own first authorization
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Registry failures.
#[derive(Debug)]
pub enum HandleError {
    /// The handle does not exist or belongs to a different identity.
    /// The two cases are deliberately indistinguishable to the caller.
    Unauthorized,
    InvalidName(String),
    Store(anyhow::Error),
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleError::Unauthorized => {
                write!(f, "account handle not found for this identity")
            }
            HandleError::InvalidName(detail) => write!(f, "invalid account name: {}", detail),
            HandleError::Store(e) => write!(f, "handle storage error: {}", e),
        }
    }
}

impl std::error::Error for HandleError {}

impl From<anyhow::Error> for HandleError {
    fn from(e: anyhow::Error) -> Self {
        HandleError::Store(e)
    }
}

/// Maps (identity, account name) to secure opaque handles and handles to
/// credential references. All lookups are identity-scoped.
pub struct AccountHandleRegistry {
    store: Arc<IdentityStore>,
}

impl AccountHandleRegistry {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }

    /// Registers (or re-registers) an account for an identity.
    ///
    /// A fresh registration mints a new handle, checking global uniqueness
    /// before commit. Re-registering an existing `(identity, account_name)`
    /// keeps the stored handle stable and updates the credential reference
    /// and primary flag instead, so re-authenticating an account does not
    /// break anything that remembered its handle.
    pub fn register(
        &self,
        owner_identity: &str,
        account_name: &str,
        credential_ref: &str,
        is_primary: bool,
    ) -> Result<AccountHandle, HandleError> {
        let account_name = validate_account_name(account_name)?;

        if let Some(existing) = self
            .store
            .find_handle_by_name(owner_identity, &account_name)?
        {
            self.store
                .update_handle_credential(&existing.handle, credential_ref, is_primary)?;
            info!(
                owner = %owner_identity,
                account_name = %account_name,
                "Re-registered existing account handle"
            );
            return Ok(AccountHandle {
                credential_ref: credential_ref.to_string(),
                is_primary,
                ..existing
            });
        }

        let handle = self.mint_handle()?;
        let record = AccountHandle {
            handle,
            owner_identity: owner_identity.to_string(),
            account_name,
            credential_ref: credential_ref.to_string(),
            is_primary,
            created_at: Utc::now(),
        };
        self.store.insert_handle(&record)?;
        info!(
            owner = %owner_identity,
            account_name = %record.account_name,
            is_primary = record.is_primary,
            "Registered account handle"
        );
        Ok(record)
    }

    /// Resolves a handle to its credential reference for the given identity.
    ///
    /// # Returns
    /// * `Ok(credential_ref)` - Handle exists and belongs to `identity`
    /// * `Err(HandleError::Unauthorized)` - Unknown handle or owned by a
    ///   different identity
    pub fn resolve(&self, identity: &str, handle: &str) -> Result<String, HandleError> {
        match self.store.find_handle(handle)? {
            Some(record) if record.owner_identity == identity => Ok(record.credential_ref),
            _ => Err(HandleError::Unauthorized),
        }
    }

    /// Issues a new handle for the same registration and invalidates the old
    /// one immediately. No re-authentication with the third party involved.
    pub fn rotate(&self, identity: &str, handle: &str) -> Result<String, HandleError> {
        // Ownership check first, same posture as resolve
        self.resolve(identity, handle)?;

        let new_handle = self.mint_handle()?;
        let replaced = self.store.replace_handle(handle, &new_handle)?;
        if !replaced {
            // Lost a race with a concurrent rotate of the same handle
            return Err(HandleError::Unauthorized);
        }
        info!(owner = %identity, "Rotated account handle");
        Ok(new_handle)
    }

    /// All accounts registered to an identity, oldest first.
    pub fn list(&self, identity: &str) -> Result<Vec<AccountHandle>, HandleError> {
        Ok(self.store.list_handles(identity)?)
    }

    /// Generates a globally unique handle value.
    fn mint_handle(&self) -> Result<String, HandleError> {
        loop {
            let candidate = generate_handle();
            if !self.store.handle_exists(&candidate)? {
                return Ok(candidate);
            }
        }
    }
}

/// Generate handle: acct_{random_26chars}, drawn from the OS entropy source.
fn generate_handle() -> String {
    let mut rng = OsRng;
    let random: String = (0..HANDLE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..36);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect();
    format!("acct_{}", random)
}

fn validate_account_name(name: &str) -> Result<String, HandleError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(HandleError::InvalidName("name is empty".to_string()));
    }
    if trimmed.len() > 64 {
        return Err(HandleError::InvalidName(
            "name longer than 64 characters".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
