//! NaCl primitives for the transport and message layers.
//!
//! Two constructions cover everything the protocol needs: `box` (Curve25519
//! public-key authenticated encryption, XSalsa20-Poly1305) for the transport
//! frames and end-to-end payloads, and `secretbox` (same cipher, single
//! 32-byte key) for symmetric blob envelopes. Both either return the full
//! plaintext or fail hard; there is no partial success.

use crypto_box::{aead::Aead, PublicKey, SalsaBox, SecretKey};
use crypto_secretbox::{
    aead::KeyInit, Key as SecretboxKey, Nonce as SecretboxNonce, XSalsa20Poly1305,
};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::errors::CryptoError;
use crate::{KEY_SIZE, NONCE_PREFIX_SIZE, NONCE_SIZE};

/// X25519 keypair, either a long-term identity key or a per-session
/// ephemeral key.
///
/// The secret half is zeroized when the pair is dropped.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: [u8; KEY_SIZE],
    pub secret_key: [u8; KEY_SIZE],
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// Generate a fresh X25519 keypair from the OS CSPRNG.
pub fn generate_keypair() -> KeyPair {
    let mut secret_bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut secret_bytes);
    let public_key = derive_public_key(&secret_bytes);
    KeyPair {
        public_key,
        secret_key: secret_bytes,
    }
}

/// Derive the Curve25519 public key for a secret scalar.
pub fn derive_public_key(secret_key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let sk = SecretKey::from(*secret_key);
    *sk.public_key().as_bytes()
}

/// A 24-byte NaCl nonce.
///
/// Session nonces are structured as a 16-byte prefix followed by a
/// little-endian 8-byte counter; free-standing nonces (message seals, blob
/// envelopes) are fully random.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// A fully random nonce, used once per end-to-end seal.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Nonce(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Nonce(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    pub fn prefix(&self) -> [u8; NONCE_PREFIX_SIZE] {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        prefix.copy_from_slice(&self.0[..NONCE_PREFIX_SIZE]);
        prefix
    }

    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[NONCE_PREFIX_SIZE..]);
        u64::from_le_bytes(counter)
    }
}

/// One direction of a session's nonce chain.
///
/// The prefix is fixed for the lifetime of the session and the counter
/// increases by exactly one per use. `advance` consumes the sequence and
/// hands back the successor, so a counter value can never be used for two
/// seals: the only way to obtain a nonce is to give up the old sequence.
#[derive(Debug, PartialEq, Eq)]
pub struct NonceSequence {
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u64,
}

impl NonceSequence {
    /// A new sequence with a random prefix. The first `advance` yields
    /// counter value 1.
    pub fn fresh() -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut prefix);
        NonceSequence { prefix, counter: 0 }
    }

    /// A new sequence with a prefix taken from the wire, as received in
    /// the server hello. The first `advance` yields counter value 1.
    pub fn with_prefix(prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        NonceSequence { prefix, counter: 0 }
    }

    pub fn prefix(&self) -> [u8; NONCE_PREFIX_SIZE] {
        self.prefix
    }

    /// The counter value of the most recently issued nonce.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Bump the counter and yield the next nonce together with the
    /// successor sequence. Wraparound is a hard error.
    pub fn advance(self) -> Result<(Nonce, NonceSequence), CryptoError> {
        let counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;

        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..NONCE_PREFIX_SIZE].copy_from_slice(&self.prefix);
        bytes[NONCE_PREFIX_SIZE..].copy_from_slice(&counter.to_le_bytes());

        let next = NonceSequence {
            prefix: self.prefix,
            counter,
        };
        Ok((Nonce(bytes), next))
    }
}

/// Seal plaintext with NaCl box.
///
/// Output is `ciphertext || 16-byte Poly1305 tag` appended by the cipher;
/// the nonce is not included and travels separately on the wire.
pub fn box_seal(
    plaintext: &[u8],
    nonce: &Nonce,
    peer_public_key: &[u8; KEY_SIZE],
    own_secret_key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let pk = PublicKey::from(*peer_public_key);
    let sk = SecretKey::from(*own_secret_key);
    SalsaBox::new(&pk, &sk)
        .encrypt(nonce.as_bytes().into(), plaintext)
        .map_err(|_| CryptoError::SealFailed)
}

/// Open a NaCl box. Fails on any tampering, truncation or key mismatch.
pub fn box_open(
    ciphertext: &[u8],
    nonce: &Nonce,
    peer_public_key: &[u8; KEY_SIZE],
    own_secret_key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let pk = PublicKey::from(*peer_public_key);
    let sk = SecretKey::from(*own_secret_key);
    SalsaBox::new(&pk, &sk)
        .decrypt(nonce.as_bytes().into(), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Seal plaintext with NaCl secretbox under a single 32-byte key.
pub fn secretbox_seal(
    plaintext: &[u8],
    nonce: &Nonce,
    key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(key));
    cipher
        .encrypt(SecretboxNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CryptoError::SealFailed)
}

/// Open a NaCl secretbox.
pub fn secretbox_open(
    ciphertext: &[u8],
    nonce: &Nonce,
    key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(key));
    cipher
        .decrypt(SecretboxNonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Generate a fresh random 32-byte secretbox key.
pub fn generate_symmetric_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}
