//! Encodings for the `secure_session` record.
//!
//! `ObfuscatedCodec` is readable by anyone with access to the store; it only
//! keeps the record off casual inspection and stays compatible with records
//! written by the web client. `SealedCodec` encrypts and authenticates the
//! record with ChaCha20-Poly1305.

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::session::Session;
use crate::error::CodecError;

/// ChaCha20-Poly1305 nonce length in bytes
const NONCE_LEN: usize = 12;

/// Derived key length in bytes
const KEY_LEN: usize = 32;

/// Minimum salt length accepted by Argon2
pub const MIN_SALT_LEN: usize = 8;

pub trait SessionCodec: Send + Sync {
    fn encode(&self, session: &Session) -> Result<String, CodecError>;

    fn decode(&self, encoded: &str) -> Result<Session, CodecError>;
}

/// Base64 over JSON. Reversible by anyone, not encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObfuscatedCodec;

impl SessionCodec for ObfuscatedCodec {
    fn encode(&self, session: &Session) -> Result<String, CodecError> {
        let json = serde_json::to_vec(session)?;
        Ok(STANDARD.encode(json))
    }

    fn decode(&self, encoded: &str) -> Result<Session, CodecError> {
        let json = STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Authenticated encryption of the session record.
///
/// Output is base64 of `nonce || ciphertext`. A fresh random nonce is used for
/// every encode.
pub struct SealedCodec {
    cipher: ChaCha20Poly1305,
}

impl SealedCodec {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Derive the key from a passphrase with Argon2 (default parameters)
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, CodecError> {
        if salt.len() < MIN_SALT_LEN {
            return Err(CodecError::KeyDerivation(format!(
                "salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| CodecError::KeyDerivation(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// Random salt suitable for [`SealedCodec::from_passphrase`]
    pub fn generate_salt() -> [u8; 16] {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}

impl SessionCodec for SealedCodec {
    fn encode(&self, session: &Session) -> Result<String, CodecError> {
        let plaintext = serde_json::to_vec(session)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CodecError::Malformed("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn decode(&self, encoded: &str) -> Result<Session, CodecError> {
        let sealed = STANDARD.decode(encoded.trim())?;
        if sealed.len() <= NONCE_LEN {
            return Err(CodecError::Malformed("sealed record too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Unauthenticated)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
