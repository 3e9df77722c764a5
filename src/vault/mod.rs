//! Credential vault.
//!
//! Holds the symmetric key protecting each user's exchange credential
//! pair and exposes scoped decryption: `with_decrypted` hands the
//! plaintext to a closure and guarantees it is zeroed on every exit
//! path. Decrypted material lives in `secrecy::SecretString`, is never
//! persisted, and never appears in logs.
//!
//! Wire format: `base64url(nonce ‖ ciphertext)` under AES-256-GCM, key
//! derived from a configured passphrase via SHA-256.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use std::future::Future;
use thiserror::Error;

use crate::types::UserTradeProfile;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// User-scoped credential failure. Never aborts a cycle; the affected
/// user's outcome is failed and siblings proceed.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential blob is not valid base64")]
    Encoding(#[from] base64::DecodeError),
    #[error("credential blob too short")]
    Truncated,
    #[error("credential decryption failed")]
    Decrypt,
    #[error("decrypted credential is not valid UTF-8")]
    NotUtf8,
}

/// A decrypted exchange credential pair, zeroed on drop.
pub struct ApiCredentials {
    pub api_key: SecretString,
    pub api_secret: SecretString,
}

/// Scoped-decrypt vault over a passphrase-derived AES-256 key.
///
/// Decryption is read-only and safe for concurrent callers.
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; 32],
}

impl CredentialVault {
    /// Derive the vault key from a passphrase (SHA-256 digest).
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        CredentialVault { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        // 32-byte key from SHA-256, so this cannot fail.
        Aes256Gcm::new_from_slice(&self.key).expect("AES-256 key length")
    }

    /// Encrypt a credential string into the vault wire format.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Decrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(blob))
    }

    /// Decrypt a vault blob into secret material.
    pub fn decrypt(&self, blob: &str) -> Result<SecretString, CredentialError> {
        let raw = URL_SAFE.decode(blob.trim())?;
        if raw.len() <= NONCE_LEN {
            return Err(CredentialError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        let text = String::from_utf8(plaintext).map_err(|_| CredentialError::NotUtf8)?;
        Ok(SecretString::new(text))
    }

    /// Scoped acquisition: decrypt the profile's credential pair, run
    /// the execution step, and discard the plaintext.
    ///
    /// The credentials move into the closure; their `SecretString`
    /// halves are zeroed on drop whether the closure returns, errors,
    /// or is cancelled at an await point.
    pub async fn with_decrypted<F, Fut, T>(
        &self,
        profile: &UserTradeProfile,
        f: F,
    ) -> Result<T, CredentialError>
    where
        F: FnOnce(ApiCredentials) -> Fut,
        Fut: Future<Output = T>,
    {
        let api_key = self.decrypt(&profile.encrypted_api_key)?;
        let api_secret = self.decrypt(&profile.encrypted_api_secret)?;
        Ok(f(ApiCredentials { api_key, api_secret }).await)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
