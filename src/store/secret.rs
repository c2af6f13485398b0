//! Column-secret codec: AES-256-GCM wrap of device secrets at rest.
//!
//! The key is derived from a caller-supplied passphrase; a fresh random
//! nonce is prepended to each ciphertext, so two encryptions of the same
//! plaintext differ. Output is lowercase hex of `nonce || ciphertext || tag`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::anyhow;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::status::{AuthError, Result};
use crate::store::KeyProvider;

/// Environment variable callers conventionally use to carry the column
/// passphrase. The codec itself never reads the environment.
pub const COLUMN_KEY_ENV: &str = "DB_COL_KEY";

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Encrypts and decrypts one database column's values. Holds the key
/// provider at construction so per-tenant keys only require separate
/// codec instances.
pub struct SecretCodec {
    provider: KeyProvider,
}

impl SecretCodec {
    pub fn new(provider: KeyProvider) -> Self {
        Self { provider }
    }

    /// Convenience constructor for a fixed passphrase.
    pub fn from_passphrase(passphrase: impl Into<String>) -> Self {
        let passphrase = passphrase.into();
        Self::new(std::sync::Arc::new(move || passphrase.clone()))
    }

    // The AES-256 key is the first 32 hex characters of
    // SHA-256(passphrase), used as raw bytes. Inherited format; changing
    // it strands every secret already at rest.
    fn derive_key(passphrase: &str) -> [u8; 32] {
        let digest = hex::encode(Sha256::digest(passphrase.as_bytes()));
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest.as_bytes()[..32]);
        key
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = Self::derive_key(&(self.provider)());
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AuthError::backend(anyhow!("cipher init failed: {e}")))
    }

    /// Encrypt bytes and return a hex encoding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AuthError::backend(anyhow!("column encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    /// Decrypt a hex encoding from [`SecretCodec::encrypt`] back to the
    /// plaintext bytes.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let combined = hex::decode(encoded)
            .map_err(|e| AuthError::backend(anyhow!("stored secret is not valid hex: {e}")))?;
        if combined.len() < NONCE_SIZE {
            return Err(AuthError::backend(anyhow!("stored secret is too short")));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let cipher = self.cipher()?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| AuthError::backend(anyhow!("column decryption failed: {e}")))
    }
}
