//! Optional at-rest encryption of message bodies.
//!
//! When a 32-byte secret is configured, values in the Messages
//! partition are sealed with ChaCha20-Poly1305. The 12-byte random
//! nonce is prepended to the ciphertext; lifecycle partitions hold only
//! small tokens and stay in the clear.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("sealed body is too short")]
    TooShort,
    #[error("body failed authentication")]
    BadSeal,
}

/// Seals and opens message bodies with a fixed key.
#[derive(Clone)]
pub struct BodyCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for BodyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BodyCipher")
    }
}

impl BodyCipher {
    #[must_use]
    pub fn new(secret: &[u8; 32]) -> Self {
        BodyCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(secret)),
        }
    }

    /// Encrypts `plain`, returning `nonce || ciphertext`.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CryptoError::BadSeal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a value produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::BadSeal)
    }
}
