//! AES-256-GCM symmetric encryption
//!
//! Ciphertexts are `base64(nonce || sealed)` with a random 12-byte nonce.
//! Every failure carries a stable `ENC-N` code so that operators can triage
//! from logs without seeing key material.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;
use thiserror::Error;

use crate::secret::Secret;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encryption failures with stable triage codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// Key is not 32 bytes (or not valid base64)
    #[error("ENC-1: invalid encryption key: {0}")]
    InvalidKey(String),
    /// Sealing failed
    #[error("ENC-2: encrypt failed")]
    Seal,
    /// Ciphertext is not valid base64
    #[error("ENC-3: decode ciphertext: {0}")]
    Decode(String),
    /// Ciphertext shorter than a nonce
    #[error("ENC-4: ciphertext too short")]
    TooShort,
    /// Authentication tag mismatch or wrong key
    #[error("ENC-5: decrypt failed")]
    Open,
}

impl EncryptionError {
    /// Stable code (`ENC-1` .. `ENC-5`)
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "ENC-1",
            Self::Seal => "ENC-2",
            Self::Decode(_) => "ENC-3",
            Self::TooShort => "ENC-4",
            Self::Open => "ENC-5",
        }
    }
}

/// AES-256-GCM encryptor bound to one key.
#[derive(Clone)]
pub struct Encryption {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption").finish_non_exhaustive()
    }
}

impl Encryption {
    /// Create from raw key bytes (must be 32 bytes).
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Create from a base64-encoded key.
    pub fn from_base64(key: &Secret<String>) -> Result<Self, EncryptionError> {
        let raw = STANDARD
            .decode(key.reveal().trim())
            .map_err(|e| EncryptionError::InvalidKey(format!("decode key: {e}")))?;
        Self::new(&raw)
    }

    /// Generate a random key, base64-encoded.
    #[must_use]
    pub fn generate_key() -> String {
        let key: [u8; KEY_LEN] = rand::rng().random();
        STANDARD.encode(key)
    }

    /// Encrypt bytes and return base64 text.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| EncryptionError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt base64 text produced by [`Encryption::encrypt`].
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, EncryptionError> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| EncryptionError::Decode(e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(EncryptionError::TooShort);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EncryptionError::Open)
    }

    /// Encrypt a UTF-8 secret.
    pub fn encrypt_secret(&self, value: &Secret<String>) -> Result<String, EncryptionError> {
        self.encrypt(value.reveal().as_bytes())
    }

    /// Decrypt into a UTF-8 secret.
    pub fn decrypt_secret(&self, ciphertext: &str) -> Result<Secret<String>, EncryptionError> {
        let bytes = self.decrypt(ciphertext)?;
        String::from_utf8(bytes)
            .map(Secret::new)
            .map_err(|_| EncryptionError::Open)
    }
}
