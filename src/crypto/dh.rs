use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{aead, to_key, CryptoError, KEY_SIZE};

/// Per-process curve25519 key pair
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Shared key with `peer`. With `derive` the raw agreement is run through
    /// HKDF-SHA256 salted with the lower public key and keyed on the higher one,
    /// so both sides obtain the same key regardless of role.
    pub fn shared_key(
        &self,
        peer: &[u8; 32],
        derive: bool,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let raw = Zeroizing::new(*self.secret.diffie_hellman(&PublicKey::from(*peer)).as_bytes());
        if !derive {
            return Ok(raw);
        }
        derive_shared_key(&raw[..], &self.public_key(), peer)
    }
}

pub fn derive_shared_key(
    secret: &[u8],
    ours: &[u8; 32],
    theirs: &[u8; 32],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let (salt, info) = match ours.cmp(theirs) {
        Ordering::Equal => return Err(CryptoError::IdenticalPublicKeys),
        Ordering::Less => (ours, theirs),
        Ordering::Greater => (theirs, ours),
    };

    let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), secret);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(info.as_slice(), key.as_mut())
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => super::serialize(b, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
            let s = Option::<String>::deserialize(d)?;
            s.filter(|s| !s.is_empty())
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Serialised AES-GCM payload, optionally carrying the sender's public key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        default,
        with = "b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub curve25519_public_key: Option<Vec<u8>>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub encrypted_payload: Vec<u8>,
}

impl Envelope {
    pub fn seal(
        key: &[u8; KEY_SIZE],
        sender: Option<[u8; 32]>,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Self, CryptoError> {
        let (encrypted_payload, nonce) = aead::encrypt(key, plaintext, aad)?;
        Ok(Self {
            curve25519_public_key: sender.map(|k| k.to_vec()),
            nonce: nonce.to_vec(),
            encrypted_payload,
        })
    }

    pub fn open(&self, key: &[u8; KEY_SIZE], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        aead::decrypt(key, &self.encrypted_payload, &self.nonce, aad)
    }

    /// Sender public key, if the envelope carries one
    pub fn sender_key(&self) -> Result<Option<[u8; 32]>, CryptoError> {
        self.curve25519_public_key
            .as_deref()
            .map(to_key)
            .transpose()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Contents of a peer public key file: `{"curve25519_public_key": "<base64>"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub curve25519_public_key: String,
}

impl PublicKeyInfo {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            curve25519_public_key: STANDARD.encode(key),
        }
    }

    pub fn key(&self) -> Result<[u8; 32], CryptoError> {
        to_key(&STANDARD.decode(&self.curve25519_public_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_shared_key_agreement() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();

        for derive in [false, true] {
            let ab = a.shared_key(&b.public_key(), derive).unwrap();
            let ba = b.shared_key(&a.public_key(), derive).unwrap();
            assert_eq!(*ab, *ba);
        }
        assert_ne!(
            *a.shared_key(&b.public_key(), false).unwrap(),
            *a.shared_key(&b.public_key(), true).unwrap()
        );
    }

    #[test]
    fn test_derive_rejects_identical_keys() {
        let key = [7u8; 32];
        let result = derive_shared_key(&[1u8; 32], &key, &key);
        assert!(matches!(result, Err(CryptoError::IdenticalPublicKeys)));
    }

    #[test]
    fn test_envelope_json_shape() {
        let sender = DhKeyPair::generate();
        let receiver = DhKeyPair::generate();
        let key = sender.shared_key(&receiver.public_key(), true).unwrap();

        let envelope = Envelope::seal(&key, Some(sender.public_key()), b"s.token", b"aad").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert!(json["curve25519_public_key"].is_string());
        assert!(json["nonce"].is_string());
        assert!(json["encrypted_payload"].is_string());

        let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        let peer = parsed.sender_key().unwrap().unwrap();
        let receiver_key = receiver.shared_key(&peer, true).unwrap();
        assert_eq!(parsed.open(&receiver_key, b"aad").unwrap().as_slice(), b"s.token");
        assert!(parsed.open(&receiver_key, b"other").is_err());
    }

    #[test]
    fn test_symmetric_envelope_omits_public_key() {
        let key = aead::generate_key();
        let envelope = Envelope::seal(&key, None, b"payload", b"").unwrap();
        let json = String::from_utf8(envelope.to_json().unwrap()).unwrap();
        assert!(!json.contains("curve25519_public_key"));
        assert!(Envelope::from_json(json.as_bytes()).unwrap().sender_key().unwrap().is_none());
    }

    #[test]
    fn test_public_key_info_round_trip() {
        let pair = DhKeyPair::generate();
        let info = PublicKeyInfo::new(&pair.public_key());
        let parsed: PublicKeyInfo =
            serde_json::from_str(&serde_json::to_string(&info).unwrap()).unwrap();
        assert_eq!(parsed.key().unwrap(), pair.public_key());
    }

    proptest! {
        #[test]
        fn prop_derived_keys_agree(seed_a in any::<[u8; 32]>(), seed_b in any::<[u8; 32]>()) {
            let sa = StaticSecret::from(seed_a);
            let sb = StaticSecret::from(seed_b);
            let pa = PublicKey::from(&sa);
            let pb = PublicKey::from(&sb);
            prop_assume!(pa.as_bytes() != pb.as_bytes());

            let raw_a = sa.diffie_hellman(&pb);
            let raw_b = sb.diffie_hellman(&pa);
            let ka = derive_shared_key(raw_a.as_bytes(), pa.as_bytes(), pb.as_bytes()).unwrap();
            let kb = derive_shared_key(raw_b.as_bytes(), pb.as_bytes(), pa.as_bytes()).unwrap();
            prop_assert_eq!(*ka, *kb);
        }
    }
}
