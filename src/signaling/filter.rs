//! Pluggable encryption of SDP/ICE bodies.

use crate::error::CallError;
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"peercall signaling body v1";

/// Transforms signaling bodies before transport and back after receipt.
pub trait PayloadFilter: Send + Sync {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CallError>;

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, CallError>;

    /// Passthrough filters let the codec keep bodies as plain text.
    fn is_passthrough(&self) -> bool {
        false
    }
}

/// Leaves bodies untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFilter;

impl PayloadFilter for NoopFilter {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CallError> {
        Ok(plaintext.to_vec())
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, CallError> {
        Ok(encoded.to_vec())
    }

    fn is_passthrough(&self) -> bool {
        true
    }
}

/// AES-256-GCM with a random nonce prefixed to each ciphertext.
pub struct AesGcmFilter {
    cipher: Aes256Gcm,
}

impl AesGcmFilter {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Derives the body key from a secret both peers already share.
    pub fn from_shared_secret(secret: &[u8]) -> Result<Self, CallError> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|_| CallError::Encryption("HKDF expand failed".into()))?;
        Ok(Self::new(&key))
    }
}

impl PayloadFilter for AesGcmFilter {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CallError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                aes_gcm::Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CallError::Encryption("AES-GCM encrypt failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, CallError> {
        if encoded.len() < NONCE_LEN {
            return Err(CallError::Encryption("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = encoded.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                aes_gcm::Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CallError::Encryption("AES-GCM decrypt failed".into()))
    }
}
