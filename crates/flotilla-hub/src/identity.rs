//! Hub identity: signing key, exchange key and the derived hub ID

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use flotilla_core::session::StaticExchangeKey;
use flotilla_core::{Error, Result};

/// Stable hub identifier: BLAKE3 of the verifying key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HubId(pub [u8; 32]);

impl HubId {
    /// Derive the hub ID from a verifying key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"flotilla-hub-id-v1:");
        hasher.update(public_key);
        Self(*hasher.finalize().as_bytes())
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex rendering, used in store keys and bootstrap entries.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full hex rendering.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|err| Error::MalformedData(format!("invalid hub id hex: {err}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::MalformedData("hub id must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for HubId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A hub's own identity
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    exchange_key: StaticExchangeKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key, exchange_key: StaticExchangeKey::generate() }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        // Exchange key gets its own domain-separated seed.
        let exchange_seed = *blake3::hash(&[b"flotilla-exchange-seed:" as &[u8], seed].concat())
            .as_bytes();
        Self { signing_key, exchange_key: StaticExchangeKey::from_seed(&exchange_seed) }
    }

    /// Restore from stored key material.
    pub fn from_parts(signing_seed: &[u8; 32], exchange_seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing_seed),
            exchange_key: StaticExchangeKey::from_seed(exchange_seed),
        }
    }

    /// The derived hub ID
    pub fn hub_id(&self) -> HubId {
        HubId::from_public_key(&self.public_key())
    }

    /// The verifying key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The signing key seed, for persistence.
    pub fn signing_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The exchange key seed, for persistence.
    pub fn exchange_seed(&self) -> [u8; 32] {
        self.exchange_key.to_bytes()
    }

    /// The static exchange key used for session handshakes
    pub fn exchange_key(&self) -> &StaticExchangeKey {
        &self.exchange_key
    }

    /// The advertised exchange public key
    pub fn exchange_public(&self) -> [u8; 32] {
        self.exchange_key.public_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against a verifying key.
    pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| Error::Integrity("invalid verifying key".to_string()))?;
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::Integrity("signature must be 64 bytes".to_string()))?;
        verifying_key
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| Error::Integrity("signature verification failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_id_is_stable() {
        let identity = Identity::from_seed(&[1; 32]);
        let again = Identity::from_seed(&[1; 32]);
        assert_eq!(identity.hub_id(), again.hub_id());

        let other = Identity::from_seed(&[2; 32]);
        assert_ne!(identity.hub_id(), other.hub_id());
    }

    #[test]
    fn sign_verify() {
        let identity = Identity::generate();
        let sig = identity.sign(b"gossip record");
        assert!(Identity::verify(&identity.public_key(), b"gossip record", &sig).is_ok());
        assert!(Identity::verify(&identity.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn hub_id_hex_roundtrip() {
        let id = Identity::from_seed(&[3; 32]).hub_id();
        assert_eq!(HubId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(HubId::from_hex("abcd").is_err());
    }
}
