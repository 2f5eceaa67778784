//! # Payload Encryption
//!
//! XChaCha20-Poly1305 AEAD encryption for packet payloads.
//!
//! Encrypted payloads carry their 24 byte nonce in front of the ciphertext:
//!
//! ```text
//! [nonce (24)] [ciphertext + tag (N + 16)]
//! ```
//!
//! Nonces are drawn from the operating system RNG through `getrandom`, so a key can
//! safely be shared by every session of an engine.

use crate::error::{NetworkError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Encrypts outbound payloads and decrypts inbound ones.
pub trait PacketEncryptor: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Fresh random key.
    pub fn generate_key() -> Result<[u8; KEY_SIZE]> {
        let mut key = [0u8; KEY_SIZE];
        getrandom::fill(&mut key).map_err(|_| NetworkError::EncryptionFailure)?;
        Ok(key)
    }
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypto").finish_non_exhaustive()
    }
}

impl PacketEncryptor for Crypto {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| NetworkError::EncryptionFailure)?;

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| NetworkError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(NetworkError::DecryptionFailure);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| NetworkError::DecryptionFailure)
    }
}
