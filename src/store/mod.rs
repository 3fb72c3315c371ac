//! Durable identity and credential storage using SQLite.
//!
//! One database holds the three broker tables: identities, encrypted
//! credential pairs, and account handles. Secrets are sealed by the
//! [`CredentialVault`](crate::vault::CredentialVault) before they reach a
//! row and opened only on the way back out; nothing here logs or returns
//! ciphertext alongside plaintext.

mod refresh;

pub use refresh::{RefreshOutcome, RefreshPolicy};

use crate::handles::AccountHandle;
use crate::vault::{CredentialVault, SealedSecret, VaultError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

/// A registered end-user of the broker.
///
/// Created on the first successful OAuth exchange for a third-party account.
/// Never hard-deleted: revocation nulls `api_key` and drops the credential
/// pair, keeping the row so the provider-account mapping stays stable.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Opaque, immutable internal id (`idn_{random}`)
    pub identity_id: String,
    /// The third party's own user id; upsert key for re-authentication
    pub provider_user_id: String,
    /// Unique bearer key for this service; `None` once revoked
    pub api_key: Option<String>,
    pub display_name: String,
    /// Set after the consecutive refresh-failure threshold is crossed
    pub needs_reauth: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// One third-party OAuth grant, in its transient plaintext form.
///
/// Instances exist only in memory between vault open/seal calls. They are
/// never serialized, never logged, and never stored as-is.
#[derive(Clone, PartialEq)]
pub struct CredentialPair {
    pub access_secret: String,
    pub refresh_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Space-separated scope string as granted by the provider
    pub granted_scopes: String,
}

// Debug output must never contain the plaintext secrets.
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_secret", &"<redacted>")
            .field(
                "refresh_secret",
                &self.refresh_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("granted_scopes", &self.granted_scopes)
            .finish()
    }
}

/// Profile fields fetched from the third party after a code exchange.
/// Input to [`IdentityStore::create_or_update_identity`].
#[derive(Debug, Clone)]
pub struct AccountProfile {
    pub provider_user_id: String,
    pub display_name: String,
}

/// Credential-path storage failure.
///
/// `Integrity` is kept distinguishable from plumbing errors because callers
/// react differently: an integrity failure means the pair is revoked and the
/// user must re-authenticate, not retry.
#[derive(Debug)]
pub enum StoreError {
    /// Stored ciphertext failed its integrity check (tampered, truncated, or
    /// the vault key changed). The pair is treated as revoked.
    Integrity,
    Database(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Integrity => {
                write!(f, "stored credential failed integrity check; re-authentication required")
            }
            StoreError::Database(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Database(e)
    }
}

/// Identity, credential, and handle persistence.
///
/// # Schema
/// ```sql
/// CREATE TABLE identities (
///     identity_id      TEXT PRIMARY KEY,
///     provider_user_id TEXT UNIQUE NOT NULL,
///     api_key          TEXT UNIQUE,          -- NULL once revoked
///     display_name     TEXT NOT NULL,
///     needs_reauth     INTEGER NOT NULL,
///     created_at       TEXT NOT NULL,        -- RFC 3339
///     last_active      TEXT NOT NULL
/// );
/// CREATE TABLE credentials (
///     identity_id      TEXT PRIMARY KEY,
///     access_secret    TEXT NOT NULL,        -- Sealed (AES-256-GCM)
///     access_nonce     TEXT NOT NULL,
///     refresh_secret   TEXT,                 -- Sealed (optional)
///     refresh_nonce    TEXT,
///     expires_at       TEXT,
///     granted_scopes   TEXT NOT NULL,
///     refresh_failures INTEGER NOT NULL,
///     created_at       TEXT NOT NULL,
///     updated_at       TEXT NOT NULL
/// );
/// CREATE TABLE account_handles (
///     handle           TEXT PRIMARY KEY,
///     owner_identity   TEXT NOT NULL,
///     account_name     TEXT NOT NULL,
///     credential_ref   TEXT NOT NULL,
///     is_primary       INTEGER NOT NULL,
///     created_at       TEXT NOT NULL,
///     UNIQUE(owner_identity, account_name)
/// );
/// ```
///
/// # Security
/// - Access and refresh secrets are sealed separately with unique nonces
/// - The vault key lives in memory only, supplied from the environment
/// - SQLite ACID guarantees prevent partial credential updates
///
/// # Thread Safety
/// - The connection sits behind a `Mutex`, serializing writes per process
/// - Refresh serialization is finer-grained: one async lock per identity
pub struct IdentityStore {
    conn: Mutex<Connection>,
    vault: CredentialVault,
    refresh_policy: RefreshPolicy,
    /// Per-identity refresh gates (single-flight, see `refresh.rs`)
    pub(crate) refresh_locks: DashMap<String, Arc<refresh::RefreshGate>>,
}

impl IdentityStore {
    /// Opens (or creates) the broker database and ensures the schema exists.
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        vault: CredentialVault,
        refresh_policy: RefreshPolicy,
    ) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open broker database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                identity_id      TEXT PRIMARY KEY,
                provider_user_id TEXT UNIQUE NOT NULL,
                api_key          TEXT UNIQUE,
                display_name     TEXT NOT NULL,
                needs_reauth     INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                last_active      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credentials (
                identity_id      TEXT PRIMARY KEY,
                access_secret    TEXT NOT NULL,
                access_nonce     TEXT NOT NULL,
                refresh_secret   TEXT,
                refresh_nonce    TEXT,
                expires_at       TEXT,
                granted_scopes   TEXT NOT NULL DEFAULT '',
                refresh_failures INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS account_handles (
                handle           TEXT PRIMARY KEY,
                owner_identity   TEXT NOT NULL,
                account_name     TEXT NOT NULL,
                credential_ref   TEXT NOT NULL,
                is_primary       INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                UNIQUE(owner_identity, account_name)
            );
            CREATE INDEX IF NOT EXISTS idx_identities_api_key ON identities(api_key);
            CREATE INDEX IF NOT EXISTS idx_handles_owner ON account_handles(owner_identity);
            "#,
        )
        .context("Failed to create broker schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            vault,
            refresh_policy,
            refresh_locks: DashMap::new(),
        })
    }

    pub(crate) fn refresh_policy(&self) -> &RefreshPolicy {
        &self.refresh_policy
    }

    // --- identities ---

    /// Upserts an identity by the third party's own user id.
    ///
    /// The API key is generated on first creation only and stays stable
    /// across later re-authentications of the same provider account. A
    /// revoked identity (nulled key) re-authenticating gets a fresh key.
    ///
    /// # Returns
    /// The stored identity, including its (possibly pre-existing) API key.
    pub fn create_or_update_identity(&self, profile: &AccountProfile) -> Result<Identity> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT identity_id, api_key FROM identities WHERE provider_user_id = ?1",
                params![profile.provider_user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up identity by provider user id")?;

        let identity_id = match existing {
            Some((identity_id, api_key)) => {
                // Re-auth: refresh profile fields, only mint a key if revoked
                let api_key = match api_key {
                    Some(key) => key,
                    None => Uuid::new_v4().to_string(),
                };
                conn.execute(
                    "UPDATE identities
                     SET api_key = ?1, display_name = ?2, needs_reauth = 0, last_active = ?3
                     WHERE identity_id = ?4",
                    params![api_key, profile.display_name, now, identity_id],
                )
                .context("Failed to update identity on re-auth")?;
                identity_id
            }
            None => {
                let identity_id = generate_identity_id();
                let api_key = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO identities
                        (identity_id, provider_user_id, api_key, display_name,
                         needs_reauth, created_at, last_active)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                    params![
                        identity_id,
                        profile.provider_user_id,
                        api_key,
                        profile.display_name,
                        now
                    ],
                )
                .context("Failed to insert identity")?;
                identity_id
            }
        };

        drop(conn);
        self.get_identity(&identity_id)?
            .context("Identity vanished after upsert")
    }

    /// Looks up an identity by its API key. Revoked identities (nulled key)
    /// are unreachable through this path.
    pub fn find_by_api_key(&self, api_key: &str) -> Result<Option<Identity>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT identity_id, provider_user_id, api_key, display_name,
                        needs_reauth, created_at, last_active
                 FROM identities WHERE api_key = ?1",
                params![api_key],
                row_to_identity_fields,
            )
            .optional()
            .context("Failed to query identity by api key")?;
        row.map(identity_from_fields).transpose()
    }

    pub fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT identity_id, provider_user_id, api_key, display_name,
                        needs_reauth, created_at, last_active
                 FROM identities WHERE identity_id = ?1",
                params![identity_id],
                row_to_identity_fields,
            )
            .optional()
            .context("Failed to query identity by id")?;
        row.map(identity_from_fields).transpose()
    }

    /// Records request activity for an identity.
    pub fn touch_last_active(&self, identity_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE identities SET last_active = ?1 WHERE identity_id = ?2",
            params![Utc::now().to_rfc3339(), identity_id],
        )
        .context("Failed to update last_active")?;
        Ok(())
    }

    /// Revokes an identity: nulls its API key, deletes its credential pair,
    /// removes every handle it owns or that references its pair, and drops
    /// its refresh gate. The identity row itself is kept.
    pub fn revoke_identity(&self, identity_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .context("Failed to begin revocation transaction")?;
        tx.execute(
            "UPDATE identities SET api_key = NULL, needs_reauth = 0 WHERE identity_id = ?1",
            params![identity_id],
        )
        .context("Failed to null api key")?;
        tx.execute(
            "DELETE FROM credentials WHERE identity_id = ?1",
            params![identity_id],
        )
        .context("Failed to delete credential pair")?;
        tx.execute(
            "DELETE FROM account_handles WHERE owner_identity = ?1 OR credential_ref = ?1",
            params![identity_id],
        )
        .context("Failed to delete account handles")?;
        tx.commit().context("Failed to commit revocation")?;
        drop(conn);
        self.refresh_locks.remove(identity_id);
        Ok(())
    }

    // --- credential pairs ---

    /// Seals and stores the credential pair for an identity (upsert).
    ///
    /// A successfully saved pair resets the refresh-failure bookkeeping:
    /// fresh credentials mean the grant is healthy again.
    pub fn save_credential(&self, identity_id: &str, pair: &CredentialPair) -> Result<()> {
        let access = self
            .vault
            .seal(&pair.access_secret)
            .context("Failed to seal access secret")?;

        let refresh = match &pair.refresh_secret {
            Some(secret) => Some(
                self.vault
                    .seal(secret)
                    .context("Failed to seal refresh secret")?,
            ),
            None => None,
        };
        let (refresh_secret, refresh_nonce) = match refresh {
            Some(sealed) => (Some(sealed.ciphertext), Some(sealed.nonce)),
            None => (None, None),
        };

        let expires_at = pair.expires_at.map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO credentials (
                identity_id,
                access_secret, access_nonce,
                refresh_secret, refresh_nonce,
                expires_at, granted_scopes, refresh_failures,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            ON CONFLICT(identity_id) DO UPDATE SET
                access_secret = excluded.access_secret,
                access_nonce = excluded.access_nonce,
                refresh_secret = excluded.refresh_secret,
                refresh_nonce = excluded.refresh_nonce,
                expires_at = excluded.expires_at,
                granted_scopes = excluded.granted_scopes,
                refresh_failures = 0,
                updated_at = excluded.updated_at
            "#,
            params![
                identity_id,
                access.ciphertext,
                access.nonce,
                refresh_secret,
                refresh_nonce,
                expires_at,
                pair.granted_scopes,
                now,
            ],
        )
        .context("Failed to store credential pair")?;
        conn.execute(
            "UPDATE identities SET needs_reauth = 0 WHERE identity_id = ?1",
            params![identity_id],
        )
        .context("Failed to clear needs_reauth")?;
        Ok(())
    }

    /// Loads and opens the credential pair for an identity.
    ///
    /// # Returns
    /// * `Ok(Some(pair))` - Pair found and decrypted
    /// * `Ok(None)` - No pair stored
    /// * `Err(StoreError::Integrity)` - Ciphertext failed authentication; the
    ///   identity is flagged `needs_reauth` before the error is returned
    pub fn load_credential(&self, identity_id: &str) -> Result<Option<CredentialPair>, StoreError> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT access_secret, access_nonce, refresh_secret, refresh_nonce,
                        expires_at, granted_scopes
                 FROM credentials WHERE identity_id = ?1",
                params![identity_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query credential pair")?
        };

        let (access_ct, access_nonce, refresh_ct, refresh_nonce, expires_at, granted_scopes) =
            match row {
                Some(r) => r,
                None => return Ok(None),
            };

        let access_secret = self.open_or_flag(identity_id, &access_ct, &access_nonce)?;

        let refresh_secret = match (refresh_ct, refresh_nonce) {
            (Some(ct), Some(nonce)) => Some(self.open_or_flag(identity_id, &ct, &nonce)?),
            _ => None,
        };

        let expires_at = expires_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .context("Failed to parse credential expiry")?;

        Ok(Some(CredentialPair {
            access_secret,
            refresh_secret,
            expires_at,
            granted_scopes,
        }))
    }

    /// Opens one sealed secret; on integrity failure flags the identity for
    /// re-auth and surfaces the error instead of treating the pair as absent.
    fn open_or_flag(
        &self,
        identity_id: &str,
        ciphertext: &str,
        nonce: &str,
    ) -> Result<String, StoreError> {
        let sealed = SealedSecret {
            ciphertext: ciphertext.to_string(),
            nonce: nonce.to_string(),
        };
        match self.vault.open(&sealed) {
            Ok(plaintext) => Ok(plaintext),
            Err(VaultError::Integrity) => {
                warn!(
                    identity_id = %identity_id,
                    "Credential ciphertext failed integrity check; treating as revoked"
                );
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    "UPDATE identities SET needs_reauth = 1 WHERE identity_id = ?1",
                    params![identity_id],
                )
                .context("Failed to flag identity after integrity failure")?;
                Err(StoreError::Integrity)
            }
            Err(e) => Err(StoreError::Database(anyhow::Error::new(e))),
        }
    }

    /// Increments the consecutive refresh-failure counter; once the policy
    /// threshold is crossed the identity is marked `needs_reauth`.
    ///
    /// Returns the new consecutive-failure count.
    pub(crate) fn record_refresh_failure(&self, identity_id: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE credentials SET refresh_failures = refresh_failures + 1
             WHERE identity_id = ?1",
            params![identity_id],
        )
        .context("Failed to record refresh failure")?;
        let failures: u32 = conn
            .query_row(
                "SELECT refresh_failures FROM credentials WHERE identity_id = ?1",
                params![identity_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read refresh failure count")?
            .unwrap_or(0);

        if failures >= self.refresh_policy.failure_threshold {
            conn.execute(
                "UPDATE identities SET needs_reauth = 1 WHERE identity_id = ?1",
                params![identity_id],
            )
            .context("Failed to mark identity needs_reauth")?;
        }
        Ok(failures)
    }

    // --- account handles (persistence for the handle registry) ---

    pub(crate) fn handle_exists(&self, handle: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM account_handles WHERE handle = ?1",
                params![handle],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check handle existence")?;
        Ok(found.is_some())
    }

    pub(crate) fn insert_handle(&self, record: &AccountHandle) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO account_handles
                (handle, owner_identity, account_name, credential_ref, is_primary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.handle,
                record.owner_identity,
                record.account_name,
                record.credential_ref,
                record.is_primary as i64,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert account handle")?;
        Ok(())
    }

    pub(crate) fn find_handle(&self, handle: &str) -> Result<Option<AccountHandle>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT handle, owner_identity, account_name, credential_ref, is_primary, created_at
                 FROM account_handles WHERE handle = ?1",
                params![handle],
                row_to_handle_fields,
            )
            .optional()
            .context("Failed to query account handle")?;
        row.map(handle_from_fields).transpose()
    }

    pub(crate) fn find_handle_by_name(
        &self,
        owner_identity: &str,
        account_name: &str,
    ) -> Result<Option<AccountHandle>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT handle, owner_identity, account_name, credential_ref, is_primary, created_at
                 FROM account_handles WHERE owner_identity = ?1 AND account_name = ?2",
                params![owner_identity, account_name],
                row_to_handle_fields,
            )
            .optional()
            .context("Failed to query account handle by name")?;
        row.map(handle_from_fields).transpose()
    }

    /// Points an existing `(owner, name)` registration at a new credential
    /// reference, keeping the stored handle value stable.
    pub(crate) fn update_handle_credential(
        &self,
        handle: &str,
        credential_ref: &str,
        is_primary: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE account_handles SET credential_ref = ?1, is_primary = ?2 WHERE handle = ?3",
            params![credential_ref, is_primary as i64, handle],
        )
        .context("Failed to update account handle")?;
        Ok(())
    }

    /// Atomically replaces a handle value. The old value stops resolving the
    /// moment this commits; there is no grace window.
    pub(crate) fn replace_handle(&self, old_handle: &str, new_handle: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE account_handles SET handle = ?1 WHERE handle = ?2",
                params![new_handle, old_handle],
            )
            .context("Failed to rotate account handle")?;
        Ok(changed > 0)
    }

    /// Handles owned by an identity, oldest registration first.
    pub(crate) fn list_handles(&self, owner_identity: &str) -> Result<Vec<AccountHandle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT handle, owner_identity, account_name, credential_ref, is_primary, created_at
                 FROM account_handles WHERE owner_identity = ?1
                 ORDER BY created_at ASC, account_name ASC",
            )
            .context("Failed to prepare handle list query")?;
        let rows = stmt
            .query_map(params![owner_identity], row_to_handle_fields)
            .context("Failed to query handles")?;

        let mut handles = Vec::new();
        for row in rows {
            let fields = row.context("Failed to read handle row")?;
            handles.push(handle_from_fields(fields)?);
        }
        Ok(handles)
    }
}

type IdentityFields = (
    String,
    String,
    Option<String>,
    String,
    i64,
    String,
    String,
);

fn row_to_identity_fields(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityFields> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn identity_from_fields(fields: IdentityFields) -> Result<Identity> {
    let (identity_id, provider_user_id, api_key, display_name, needs_reauth, created, active) =
        fields;
    Ok(Identity {
        created_at: parse_timestamp(&created, &identity_id)?,
        last_active: parse_timestamp(&active, &identity_id)?,
        identity_id,
        provider_user_id,
        api_key,
        display_name,
        needs_reauth: needs_reauth != 0,
    })
}

type HandleFields = (String, String, String, String, i64, String);

fn row_to_handle_fields(row: &rusqlite::Row<'_>) -> rusqlite::Result<HandleFields> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn handle_from_fields(fields: HandleFields) -> Result<AccountHandle> {
    let (handle, owner_identity, account_name, credential_ref, is_primary, created) = fields;
    Ok(AccountHandle {
        created_at: parse_timestamp(&created, &handle)?,
        handle,
        owner_identity,
        account_name,
        credential_ref,
        is_primary: is_primary != 0,
    })
}

fn parse_timestamp(value: &str, record_id: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp for {}", record_id))
}

/// Generate identity ID: idn_{random_12chars}
fn generate_identity_id() -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..12)
        .map(|_| {
            let idx = rng.gen_range(0..36);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect();
    format!("idn_{}", random)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    pub(crate) fn test_store() -> IdentityStore {
        let vault = CredentialVault::new(&BASE64.encode([0u8; 32])).unwrap();
        IdentityStore::open(":memory:", vault, RefreshPolicy::default())
            .expect("Failed to create test store")
    }

    fn sample_profile(provider_id: &str) -> AccountProfile {
        AccountProfile {
            provider_user_id: provider_id.to_string(),
            display_name: format!("{} display", provider_id),
        }
    }

    fn sample_pair() -> CredentialPair {
        CredentialPair {
            access_secret: "access-token-12345".to_string(),
            refresh_secret: Some("refresh-token-67890".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            granted_scopes: "library-read playlist-modify".to_string(),
        }
    }

    #[test]
    fn test_create_identity_mints_api_key() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();

        assert!(identity.identity_id.starts_with("idn_"));
        assert!(identity.api_key.is_some());
        assert_eq!(identity.provider_user_id, "prov-1");
        assert!(!identity.needs_reauth);
    }

    #[test]
    fn test_api_key_stable_across_reauth() {
        let store = test_store();
        let first = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        let second = store
            .create_or_update_identity(&AccountProfile {
                provider_user_id: "prov-1".to_string(),
                display_name: "renamed".to_string(),
            })
            .unwrap();

        // Same identity, same key, refreshed profile
        assert_eq!(first.identity_id, second.identity_id);
        assert_eq!(first.api_key, second.api_key);
        assert_eq!(second.display_name, "renamed");
    }

    #[test]
    fn test_revoked_identity_gets_fresh_key_on_reauth() {
        let store = test_store();
        let first = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        store.revoke_identity(&first.identity_id).unwrap();

        let revoked = store.get_identity(&first.identity_id).unwrap().unwrap();
        assert!(revoked.api_key.is_none());

        let again = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        assert_eq!(again.identity_id, first.identity_id);
        assert!(again.api_key.is_some());
        assert_ne!(again.api_key, first.api_key);
    }

    #[test]
    fn test_find_by_api_key() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        let key = identity.api_key.clone().unwrap();

        let found = store.find_by_api_key(&key).unwrap().unwrap();
        assert_eq!(found.identity_id, identity.identity_id);

        assert!(store.find_by_api_key("no-such-key").unwrap().is_none());
    }

    #[test]
    fn test_revoked_key_is_unreachable() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        let key = identity.api_key.clone().unwrap();

        store.revoke_identity(&identity.identity_id).unwrap();
        assert!(store.find_by_api_key(&key).unwrap().is_none());
    }

    #[test]
    fn test_credential_roundtrip() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        let pair = sample_pair();

        store.save_credential(&identity.identity_id, &pair).unwrap();
        let loaded = store
            .load_credential(&identity.identity_id)
            .unwrap()
            .unwrap();

        assert_eq!(loaded.access_secret, pair.access_secret);
        assert_eq!(loaded.refresh_secret, pair.refresh_secret);
        assert_eq!(loaded.granted_scopes, pair.granted_scopes);
        assert!(loaded.expires_at.is_some());
    }

    #[test]
    fn test_load_missing_credential() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        assert!(store
            .load_credential(&identity.identity_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_credential_without_refresh_secret() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        let pair = CredentialPair {
            access_secret: "access-only".to_string(),
            refresh_secret: None,
            expires_at: None,
            granted_scopes: String::new(),
        };

        store.save_credential(&identity.identity_id, &pair).unwrap();
        let loaded = store
            .load_credential(&identity.identity_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.access_secret, "access-only");
        assert!(loaded.refresh_secret.is_none());
        assert!(loaded.expires_at.is_none());
    }

    #[test]
    fn test_tampered_ciphertext_surfaces_integrity() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        store
            .save_credential(&identity.identity_id, &sample_pair())
            .unwrap();

        // Corrupt the stored access ciphertext directly
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE credentials SET access_secret = ?1 WHERE identity_id = ?2",
                params![BASE64.encode(b"garbage-ciphertext"), identity.identity_id],
            )
            .unwrap();
        }

        let err = store.load_credential(&identity.identity_id).unwrap_err();
        assert!(matches!(err, StoreError::Integrity));

        // Identity is flagged for re-auth, not silently emptied
        let flagged = store.get_identity(&identity.identity_id).unwrap().unwrap();
        assert!(flagged.needs_reauth);
    }

    #[test]
    fn test_refresh_failure_threshold_marks_needs_reauth() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        store
            .save_credential(&identity.identity_id, &sample_pair())
            .unwrap();

        // Default threshold is 3 consecutive failures
        for expected in 1..=2u32 {
            let count = store.record_refresh_failure(&identity.identity_id).unwrap();
            assert_eq!(count, expected);
            let current = store.get_identity(&identity.identity_id).unwrap().unwrap();
            assert!(!current.needs_reauth);
        }

        let count = store.record_refresh_failure(&identity.identity_id).unwrap();
        assert_eq!(count, 3);
        let current = store.get_identity(&identity.identity_id).unwrap().unwrap();
        assert!(current.needs_reauth);

        // A successful save resets the counter and the flag
        store
            .save_credential(&identity.identity_id, &sample_pair())
            .unwrap();
        let current = store.get_identity(&identity.identity_id).unwrap().unwrap();
        assert!(!current.needs_reauth);
        assert_eq!(store.record_refresh_failure(&identity.identity_id).unwrap(), 1);
    }

    #[test]
    fn test_revocation_deletes_pair_and_handles() {
        let store = test_store();
        let identity = store
            .create_or_update_identity(&sample_profile("prov-1"))
            .unwrap();
        store
            .save_credential(&identity.identity_id, &sample_pair())
            .unwrap();
        store
            .insert_handle(&AccountHandle {
                handle: "acct_testhandle".to_string(),
                owner_identity: identity.identity_id.clone(),
                account_name: "primary".to_string(),
                credential_ref: identity.identity_id.clone(),
                is_primary: true,
                created_at: Utc::now(),
            })
            .unwrap();

        store.revoke_identity(&identity.identity_id).unwrap();

        assert!(store
            .load_credential(&identity.identity_id)
            .unwrap()
            .is_none());
        assert!(store.list_handles(&identity.identity_id).unwrap().is_empty());
    }
}
