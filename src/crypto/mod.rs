//! Symmetric encryption and curve25519 key agreement shared by the DH sink
//! output and the persistent cache.

pub mod aead;
pub mod dh;

pub use aead::{decrypt, encrypt, generate_key, KEY_SIZE, NONCE_SIZE};
pub use dh::{derive_shared_key, DhKeyPair, Envelope, PublicKeyInfo};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid nonce length: expected 12 bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("public keys are identical")]
    IdenticalPublicKeys,

    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),

    #[error("key derivation failed")]
    KeyDerivation,
}

pub(crate) fn to_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })
}
