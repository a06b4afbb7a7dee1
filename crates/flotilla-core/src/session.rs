//! Seal/open session for terminal payloads
//!
//! A session is built from an X25519 exchange against a peer's static
//! exchange key, with HKDF-SHA256 deriving one key per direction and
//! ChaCha20-Poly1305 sealing individual payloads under counter nonces.
//! Payloads must be delivered in order per session, which the terminal
//! layer guarantees.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

use crate::error::{Error, Result};

/// Static X25519 exchange key advertised by a hub
#[derive(Clone)]
pub struct StaticExchangeKey {
    secret: StaticSecret,
}

impl StaticExchangeKey {
    /// Generate a new random exchange key
    pub fn generate() -> Self {
        Self { secret: StaticSecret::random_from_rng(OsRng) }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { secret: StaticSecret::from(*seed) }
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        *X25519Public::from(&self.secret).as_bytes()
    }

    /// Get the secret bytes, for persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// An established seal/open session
pub struct Session {
    seal_key: [u8; 32],
    open_key: [u8; 32],
    seal_counter: u64,
    open_counter: u64,
}

impl Session {
    /// Initiate a session against a peer's static exchange key.
    ///
    /// Returns the session and the ephemeral public key the peer needs to
    /// derive the same session via [`Session::accept`].
    pub fn initiate(their_static: &[u8; 32], context: &[u8]) -> Result<(Self, [u8; 32])> {
        let (shared, ephemeral_pub) = initiate_shared(their_static);
        let session = Self::derive(&shared, true, context)?;
        Ok((session, ephemeral_pub))
    }

    /// Accept a session as the holder of the static exchange key.
    pub fn accept(
        our_static: &StaticExchangeKey,
        their_ephemeral: &[u8; 32],
        context: &[u8],
    ) -> Result<Self> {
        let shared = accept_shared(our_static, their_ephemeral);
        Self::derive(&shared, false, context)
    }

    /// Derive a session from an already-exchanged shared secret.
    ///
    /// Used when one exchange backs several sessions, distinguished by
    /// `context`.
    pub fn from_shared(shared: &[u8; 32], is_initiator: bool, context: &[u8]) -> Result<Self> {
        Self::derive(shared, is_initiator, context)
    }

    fn derive(shared_secret: &[u8], is_initiator: bool, context: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

        let (seal_info, open_info): (&[u8], &[u8]) = if is_initiator {
            (b"initiator_to_responder", b"responder_to_initiator")
        } else {
            (b"responder_to_initiator", b"initiator_to_responder")
        };

        let mut seal_key = [0u8; 32];
        let mut seal_context = context.to_vec();
        seal_context.extend_from_slice(seal_info);
        hkdf.expand(&seal_context, &mut seal_key)
            .map_err(|_| Error::Internal("session key derivation failed".to_string()))?;

        let mut open_key = [0u8; 32];
        let mut open_context = context.to_vec();
        open_context.extend_from_slice(open_info);
        hkdf.expand(&open_context, &mut open_key)
            .map_err(|_| Error::Internal("session key derivation failed".to_string()))?;

        Ok(Self { seal_key, open_key, seal_counter: 0, open_counter: 0 })
    }

    /// Seal a payload, consuming the next outbound nonce.
    pub fn seal(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.seal_key)
            .map_err(|_| Error::Internal("invalid session key length".to_string()))?;

        let nonce_bytes = Self::nonce(self.seal_counter);
        self.seal_counter += 1;

        cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: plaintext, aad: associated_data },
            )
            .map_err(|_| Error::Internal("sealing failed".to_string()))
    }

    /// Open a payload, consuming the next inbound nonce.
    pub fn open(&mut self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.open_key)
            .map_err(|_| Error::Internal("invalid session key length".to_string()))?;

        let nonce_bytes = Self::nonce(self.open_counter);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: ciphertext, aad: associated_data },
            )
            .map_err(|_| Error::Integrity("failed to open sealed payload".to_string()))?;
        self.open_counter += 1;

        Ok(plaintext)
    }

    fn nonce(counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..12].copy_from_slice(&counter.to_le_bytes());
        nonce
    }
}

/// Perform the initiating half of an exchange, returning the shared secret
/// and the ephemeral public key for the peer.
pub fn initiate_shared(their_static: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = *X25519Public::from(&ephemeral).as_bytes();
    let shared = ephemeral.diffie_hellman(&X25519Public::from(*their_static));
    (*shared.as_bytes(), ephemeral_pub)
}

/// Perform the accepting half of an exchange.
pub fn accept_shared(our_static: &StaticExchangeKey, their_ephemeral: &[u8; 32]) -> [u8; 32] {
    *our_static
        .secret
        .diffie_hellman(&X25519Public::from(*their_ephemeral))
        .as_bytes()
}
