//! Client identities and the encrypted identity backup format.
//!
//! An identity is an 8-character ID plus a 32-byte long-term secret key.
//! The backup format carries both, protected by a password: base32 in
//! dash-separated groups of four, decoding to
//! `salt(8) || XSalsa20(key, zero-nonce){ id(8) || lsk(32) || sha256[..2] }`
//! with the key derived via PBKDF2-HMAC-SHA256 over 100 000 rounds.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::crypto::derive_public_key;
use crate::errors::IdentityError;
use crate::{ID_SIZE, KEY_SIZE, NICK_SIZE};

const BACKUP_SALT_SIZE: usize = 8;
const BACKUP_BODY_SIZE: usize = ID_SIZE + KEY_SIZE + 2;
const BACKUP_DECODED_SIZE: usize = BACKUP_SALT_SIZE + BACKUP_BODY_SIZE;
const BACKUP_KDF_ROUNDS: u32 = 100_000;

/// An 8-byte ASCII client ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PeerId([u8; ID_SIZE]);

impl PeerId {
    /// Build an ID from a string, which must be exactly 8 ASCII characters.
    pub fn new(id: &str) -> Result<Self, IdentityError> {
        if id.len() != ID_SIZE || !id.is_ascii() {
            return Err(IdentityError::BadId);
        }
        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(id.as_bytes());
        Ok(PeerId(bytes))
    }

    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::new(s)
    }
}

/// The public nickname carried in every message packet, 32 bytes,
/// zero padded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PubNick([u8; NICK_SIZE]);

impl PubNick {
    /// Build a nickname from a string; longer input is truncated to
    /// 32 bytes.
    pub fn new(nick: &str) -> Self {
        let mut bytes = [0u8; NICK_SIZE];
        let n = nick.len().min(NICK_SIZE);
        bytes[..n].copy_from_slice(&nick.as_bytes()[..n]);
        PubNick(bytes)
    }

    pub fn from_bytes(bytes: [u8; NICK_SIZE]) -> Self {
        PubNick(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NICK_SIZE] {
        &self.0
    }
}

impl fmt::Display for PubNick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(NICK_SIZE);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

/// An owned identity: ID, nickname and long-term secret key.
///
/// The secret key is zeroized on drop. The public key is derived on
/// demand, it is rarely needed locally.
pub struct Identity {
    pub id: PeerId,
    pub nick: PubNick,
    secret_key: [u8; KEY_SIZE],
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

impl Identity {
    pub fn new(id: PeerId, secret_key: [u8; KEY_SIZE]) -> Self {
        Identity {
            id,
            nick: PubNick::new(&id.to_string()),
            secret_key,
        }
    }

    pub fn with_nick(mut self, nick: &str) -> Self {
        self.nick = PubNick::new(nick);
        self
    }

    pub fn secret_key(&self) -> &[u8; KEY_SIZE] {
        &self.secret_key
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        derive_public_key(&self.secret_key)
    }

    /// Decrypt a dash-grouped base32 backup string into an identity.
    pub fn from_backup(backup: &str, password: &[u8]) -> Result<Self, IdentityError> {
        let compact: String = backup
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        let decoded = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &compact)
            .ok_or(IdentityError::Base32)?;
        if decoded.len() != BACKUP_DECODED_SIZE {
            return Err(IdentityError::BadLength);
        }

        let mut salt = [0u8; BACKUP_SALT_SIZE];
        salt.copy_from_slice(&decoded[..BACKUP_SALT_SIZE]);
        let key = backup_key(password, &salt);

        let mut body = [0u8; BACKUP_BODY_SIZE];
        body.copy_from_slice(&decoded[BACKUP_SALT_SIZE..]);
        apply_backup_cipher(&key, &mut body);

        // The last two bytes are a truncated SHA-256 over id || lsk and
        // double as the password check.
        let digest = Sha256::digest(&body[..ID_SIZE + KEY_SIZE]);
        if digest[..2] != body[ID_SIZE + KEY_SIZE..] {
            return Err(IdentityError::WrongPassword);
        }

        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&body[..ID_SIZE]);
        let mut secret_key = [0u8; KEY_SIZE];
        secret_key.copy_from_slice(&body[ID_SIZE..ID_SIZE + KEY_SIZE]);
        body.zeroize();

        Ok(Identity::new(PeerId::from_bytes(id), secret_key))
    }

    /// Encrypt this identity into the backup string format.
    ///
    /// The salt is drawn fresh on every export, so two backups of the same
    /// identity never look alike.
    pub fn export_backup(&self, password: &[u8]) -> String {
        let mut salt = [0u8; BACKUP_SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let key = backup_key(password, &salt);

        let mut body = [0u8; BACKUP_BODY_SIZE];
        body[..ID_SIZE].copy_from_slice(self.id.as_bytes());
        body[ID_SIZE..ID_SIZE + KEY_SIZE].copy_from_slice(&self.secret_key);
        let digest = Sha256::digest(&body[..ID_SIZE + KEY_SIZE]);
        body[ID_SIZE + KEY_SIZE..].copy_from_slice(&digest[..2]);
        apply_backup_cipher(&key, &mut body);

        let mut decoded = Vec::with_capacity(BACKUP_DECODED_SIZE);
        decoded.extend_from_slice(&salt);
        decoded.extend_from_slice(&body);
        let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &decoded);

        // Dash-separated groups of four.
        let mut grouped = String::with_capacity(encoded.len() + encoded.len() / 4);
        for (i, c) in encoded.chars().enumerate() {
            if i > 0 && i % 4 == 0 {
                grouped.push('-');
            }
            grouped.push(c);
        }
        grouped
    }

    /// Load a backup string from a file and decrypt it.
    pub fn load_from_file(path: impl AsRef<Path>, password: &[u8]) -> Result<Self, IdentityError> {
        let backup = std::fs::read_to_string(path)?;
        Identity::from_backup(backup.trim(), password)
    }

    /// Export this identity to a backup file readable by `load_from_file`.
    pub fn save_to_file(&self, path: impl AsRef<Path>, password: &[u8]) -> Result<(), IdentityError> {
        std::fs::write(path, self.export_backup(password))?;
        Ok(())
    }
}

fn backup_key(password: &[u8], salt: &[u8; BACKUP_SALT_SIZE]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password, salt, BACKUP_KDF_ROUNDS, &mut key);
    key
}

/// XSalsa20 keystream under a zero nonce. Encryption and decryption are
/// the same operation.
fn apply_backup_cipher(key: &[u8; KEY_SIZE], body: &mut [u8]) {
    let nonce = [0u8; 24];
    let mut cipher = XSalsa20::new(key.into(), (&nonce).into());
    cipher.apply_keystream(body);
}
