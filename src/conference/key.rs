use rand::RngCore;
use sha2::{Digest, Sha256};

/// Symmetric media key shared with the current participants.
///
/// A fresh key is generated on every membership change so that a departed
/// peer cannot decrypt later media and a newcomer cannot decrypt earlier media.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaKey {
    generation: u32,
    key: [u8; 32],
}

impl MediaKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { generation: 1, key }
    }

    /// Next generation with fresh key material.
    pub fn rotate(&self) -> Self {
        let mut next = Self::generate();
        next.generation = self.generation.wrapping_add(1);
        next
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Short, non-secret identifier for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.key)[..8])
    }
}

impl std::fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaKey")
            .field("generation", &self.generation)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
