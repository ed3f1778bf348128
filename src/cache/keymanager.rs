use zeroize::Zeroizing;

use crate::crypto::{generate_key, to_key, CryptoError, Envelope, KEY_SIZE};

/// Holds the at-rest key of the persistent cache.
///
/// The key doubles as its own retrieval material: it is stored in plaintext
/// in the cache's `meta` bucket so a restarted agent can reopen the file.
pub struct KeyManager {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyManager {
    pub fn generate() -> Self {
        Self { key: generate_key() }
    }

    /// Rebuild from stored retrieval material, a user supplied key or a key
    /// agreed through [`crate::crypto::DhKeyPair::shared_key`]
    pub fn from_material(material: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            key: Zeroizing::new(to_key(material)?),
        })
    }

    pub fn retrieval_material(&self) -> &[u8] {
        self.key.as_slice()
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Envelope::seal(&self.key, None, plaintext, aad)?.to_json()
    }

    pub fn decrypt(&self, blob: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        Envelope::from_json(blob)?.open(&self.key, aad)
    }
}
