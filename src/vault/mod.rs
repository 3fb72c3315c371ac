//! AES-256-GCM vault for credential secrets at rest.
//!
//! Every secret is sealed separately with a fresh random nonce. The vault key
//! is a single process-wide 32-byte (256-bit) secret supplied at startup and
//! never written to disk. Decryption is authenticated: a tampered ciphertext
//! or a rotated key surfaces [`VaultError::Integrity`], which callers treat
//! as a revoked credential rather than an empty one.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the vault key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Vault failure modes.
///
/// `Integrity` covers every way stored ciphertext can fail to open: bit
/// flips, truncation, a different key, a mismatched nonce. Callers must not
/// collapse it into "no credential" silently.
#[derive(Debug, PartialEq)]
pub enum VaultError {
    /// The configured key is not valid base64 or not 32 bytes.
    InvalidKey(String),
    /// Ciphertext failed authentication or is structurally corrupt.
    Integrity,
    /// Encryption itself failed (should not happen with a valid key).
    Encrypt(String),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::InvalidKey(detail) => write!(f, "invalid vault key: {}", detail),
            VaultError::Integrity => {
                write!(f, "credential ciphertext failed integrity check")
            }
            VaultError::Encrypt(detail) => write!(f, "encryption failed: {}", detail),
        }
    }
}

impl std::error::Error for VaultError {}

/// A secret sealed for storage: base64 ciphertext plus the base64 nonce it
/// was sealed with. Safe to persist and to log at the type level (neither
/// field reveals the plaintext), though nothing in this crate logs them.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub nonce: String,
}

/// Authenticated symmetric encryption over credential secrets.
///
/// Pure over bytes: no network, no database, no knowledge of identities.
/// The key is read-only after construction, so one vault instance is safe
/// to share across concurrent requests.
#[derive(Debug)]
pub struct CredentialVault {
    key: Vec<u8>,
}

impl CredentialVault {
    /// Builds a vault from a base64-encoded 32-byte key.
    ///
    /// # Returns
    /// * `Ok(CredentialVault)` - Key decoded and length-checked
    /// * `Err(VaultError::InvalidKey)` - Bad base64 or wrong length
    pub fn new(key_base64: &str) -> Result<Self, VaultError> {
        let key = BASE64
            .decode(key_base64)
            .map_err(|e| VaultError::InvalidKey(format!("not valid base64: {}", e)))?;

        if key.len() != KEY_SIZE {
            return Err(VaultError::InvalidKey(format!(
                "must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            )));
        }

        Ok(Self { key })
    }

    /// Seals a plaintext secret with a fresh random nonce.
    ///
    /// # Security
    /// - Nonce comes from a cryptographically secure source and is never reused
    /// - Output is authenticated; any later mutation is detected by `open`
    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| VaultError::Encrypt(format!("failed to create cipher: {}", e)))?;

        let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext_bytes = cipher
            .encrypt(&nonce_bytes, plaintext.as_bytes())
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        Ok(SealedSecret {
            ciphertext: BASE64.encode(ciphertext_bytes),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    /// Opens a sealed secret back into plaintext.
    ///
    /// # Returns
    /// * `Ok(String)` - The original plaintext
    /// * `Err(VaultError::Integrity)` - Tampered, truncated, or sealed under a
    ///   different key; the credential must be treated as revoked
    pub fn open(&self, sealed: &SealedSecret) -> Result<String, VaultError> {
        let ciphertext_bytes = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|_| VaultError::Integrity)?;
        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|_| VaultError::Integrity)?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(VaultError::Integrity);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| VaultError::Encrypt(format!("failed to create cipher: {}", e)))?;

        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext_bytes = cipher
            .decrypt(nonce, ciphertext_bytes.as_ref())
            .map_err(|_| VaultError::Integrity)?;

        String::from_utf8(plaintext_bytes).map_err(|_| VaultError::Integrity)
    }
}
