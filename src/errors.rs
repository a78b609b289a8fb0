//! Error types for every failure category of the client.
//!
//! Fatal session errors (`SessionError`) end up on the session's error
//! channel and terminate the connection. Per-message failures
//! (`ReceiveError`) are delivered inline on the receive channel so the
//! stream keeps flowing around a single bad message.

use crate::identity::PeerId;

/// Failures in the NaCl primitives or nonce bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Sealing a box or secretbox failed.
    #[error("encryption failed")]
    SealFailed,

    /// Opening a box or secretbox failed (wrong key, tampered data).
    #[error("decryption failed")]
    OpenFailed,

    /// A session nonce counter would wrap around. Sessions are short
    /// lived and must never get anywhere near 2^64 seals.
    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// Failures reading or writing the binary wire layout.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("short buffer: needed {needed} more bytes")]
    Short { needed: usize },

    #[error("invalid padding length {0}")]
    Padding(u8),
}

/// Failures parsing a decrypted transport frame into a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unknown packet type {0:#06x}")]
    UnknownType(u32),
}

/// Failures decoding an end-to-end message body.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("unknown delivery status {0:#04x}")]
    UnknownStatus(u8),

    #[error("message text is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("member list length {0} is not a multiple of 8")]
    MemberList(usize),
}

/// Failures talking to the directory service.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory request failed")]
    Http(#[from] reqwest::Error),

    #[error("directory returned status {0}")]
    Status(u16),

    #[error("no identity found for {0}")]
    NotFound(PeerId),

    #[error("directory returned an invalid public key")]
    BadKey,

    #[error("directory returned an invalid identity")]
    BadIdentity,

    #[error("identity creation rejected by server")]
    CreateRejected,
}

/// Failures talking to the blob store.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob request failed")]
    Http(#[from] reqwest::Error),

    #[error("blob server returned status {0}")]
    Status(u16),

    #[error("blob server returned an invalid blob ID")]
    BadId,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures loading, decrypting or exporting an identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity ID must be exactly 8 ASCII characters")]
    BadId,

    #[error("backup string is not valid base32")]
    Base32,

    #[error("backup has invalid length")]
    BadLength,

    #[error("backup checksum mismatch, wrong password?")]
    WrongPassword,

    #[error("could not read identity file")]
    Io(#[from] std::io::Error),
}

/// Failures loading or saving the address book and group directory.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed")]
    Io(#[from] std::io::Error),

    #[error("malformed store record")]
    Csv(#[from] csv::Error),

    #[error("record {record}: {reason}")]
    BadRecord { record: usize, reason: String },
}

/// A message slot on the receive channel that could not be produced.
///
/// The surrounding session survives all of these.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("could not open message {msg_id:#018x} from {sender}")]
    Open { sender: PeerId, msg_id: u64 },

    #[error("malformed message {msg_id:#018x} from {sender}: {source}")]
    Malformed {
        sender: PeerId,
        msg_id: u64,
        source: MessageError,
    },

    #[error("could not resolve sender {id}: {source}")]
    UnknownSender {
        id: PeerId,
        source: DirectoryError,
    },
}

/// Errors surfaced on the session error channel.
///
/// `DuplicateConnection`, `Io`, `Handshake`, `FrameOpen` and `Frame` are
/// terminal: the session shuts down after reporting them. The remaining
/// variants describe a single failed operation on a session that keeps
/// running.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport frame could not be opened")]
    FrameOpen,

    #[error("malformed transport frame: {0}")]
    Frame(#[from] PacketError),

    #[error("another client connected with the same identity")]
    DuplicateConnection,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("could not resolve recipient {id}: {source}")]
    Resolve {
        id: PeerId,
        source: DirectoryError,
    },

    #[error("unknown packet type {0:#06x}")]
    UnknownPacket(u32),

    #[error("outbound frame of {0} bytes exceeds the transport limit")]
    Oversize(usize),

    #[error("session closed")]
    Closed,
}
