//! Packet types and their binary layouts.
//!
//! The transport carries two kinds of frames. Handshake packets have
//! fixed sizes and travel in plain (their sensitive parts are sealed
//! individually). Session packets are length-prefixed, outer-sealed as a
//! whole and start with a 4-byte little-endian type tag once decrypted.

use crate::crypto::Nonce;
use crate::errors::{PacketError, WireError};
use crate::identity::{PeerId, PubNick};
use crate::wire::Cursor;
use crate::{
    AUTH_PACKET_SIZE, AUTH_PAYLOAD_SIZE, CLIENT_HELLO_SIZE, HANDSHAKE_ACK_SIZE, KEY_SIZE,
    NONCE_PREFIX_SIZE, SERVER_HELLO_SIZE,
};

pub const PKT_SENDING_MSG: u32 = 0x01;
pub const PKT_DELIVERING_MSG: u32 = 0x02;
pub const PKT_ECHO: u32 = 0x80;
pub const PKT_SERVER_ACK: u32 = 0x81;
pub const PKT_CLIENT_ACK: u32 = 0x82;
pub const PKT_CONN_ESTABLISHED: u32 = 0xD0;
pub const PKT_DUPLICATE_CONNECTION: u32 = 0xE0;

/// First packet on the wire: the client's ephemeral public key and its
/// nonce prefix, in plain.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ClientHello {
    pub client_spk: [u8; KEY_SIZE],
    pub nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl ClientHello {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CLIENT_HELLO_SIZE);
        buf.extend_from_slice(&self.client_spk);
        buf.extend_from_slice(&self.nonce_prefix);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        Ok(ClientHello {
            client_spk: cur.read_array()?,
            nonce_prefix: cur.read_array()?,
        })
    }
}

/// Server reply: the server's nonce prefix in plain, followed by a sealed
/// body carrying the server's ephemeral key and the echoed client prefix.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ServerHello {
    pub nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    pub ciphertext: [u8; 64],
}

impl ServerHello {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SERVER_HELLO_SIZE);
        buf.extend_from_slice(&self.nonce_prefix);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        Ok(ServerHello {
            nonce_prefix: cur.read_array()?,
            ciphertext: cur.read_array()?,
        })
    }
}

/// The sealed authentication packet, 144 bytes of ciphertext.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AuthPacket {
    pub ciphertext: [u8; AUTH_PACKET_SIZE],
}

/// Plain content of the authentication packet before the outer seal.
///
/// The inner ciphertext is the client's ephemeral public key sealed with
/// the long-term keys under `random_nonce`, proving possession of the
/// identity secret.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AuthPayload {
    pub username: PeerId,
    pub sys_data: [u8; 32],
    pub server_nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    pub random_nonce: Nonce,
    pub ciphertext: [u8; 48],
}

impl AuthPayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUTH_PAYLOAD_SIZE);
        buf.extend_from_slice(self.username.as_bytes());
        buf.extend_from_slice(&self.sys_data);
        buf.extend_from_slice(&self.server_nonce_prefix);
        buf.extend_from_slice(self.random_nonce.as_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        Ok(AuthPayload {
            username: PeerId::from_bytes(cur.read_array()?),
            sys_data: cur.read_array()?,
            server_nonce_prefix: cur.read_array()?,
            random_nonce: Nonce::from_bytes(cur.read_array()?),
            ciphertext: cur.read_array()?,
        })
    }
}

/// Final handshake frame: a 32-byte ciphertext whose content carries no
/// information, only the proof that the server sealed it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HandshakeAck {
    pub ciphertext: [u8; HANDSHAKE_ACK_SIZE],
}

/// The flags byte of a message packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MessageFlags {
    pub push_message: bool,
    pub no_queuing: bool,
    pub no_ack_expected: bool,
    pub already_delivered: bool,
    pub group_message: bool,
}

impl MessageFlags {
    /// The default flag set for an outbound content message.
    pub fn push() -> Self {
        MessageFlags {
            push_message: true,
            ..Default::default()
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        if self.push_message {
            byte |= 1 << 0;
        }
        if self.no_queuing {
            byte |= 1 << 1;
        }
        if self.no_ack_expected {
            byte |= 1 << 2;
        }
        if self.already_delivered {
            byte |= 1 << 3;
        }
        if self.group_message {
            byte |= 1 << 4;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        MessageFlags {
            push_message: byte & (1 << 0) != 0,
            no_queuing: byte & (1 << 1) != 0,
            no_ack_expected: byte & (1 << 2) != 0,
            already_delivered: byte & (1 << 3) != 0,
            group_message: byte & (1 << 4) != 0,
        }
    }
}

/// A message frame in either direction.
///
/// The header fields travel outside the end-to-end ciphertext; the
/// receiver trusts them only as routing hints. The embedded nonce is the
/// one the sender used for the end-to-end seal.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MessagePacket {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub msg_id: u64,
    pub timestamp: u32,
    pub flags: MessageFlags,
    pub pub_nick: PubNick,
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
}

/// Everything that can appear on the session transport after the
/// handshake, one variant per type tag.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Packet {
    SendingMsg(MessagePacket),
    DeliveringMsg(MessagePacket),
    Echo { counter: u64 },
    ServerAck { sender: PeerId, msg_id: u64 },
    ClientAck { sender: PeerId, msg_id: u64 },
    ConnEstablished,
    DuplicateConnection,
}

impl Packet {
    pub fn type_tag(&self) -> u32 {
        match self {
            Packet::SendingMsg(_) => PKT_SENDING_MSG,
            Packet::DeliveringMsg(_) => PKT_DELIVERING_MSG,
            Packet::Echo { .. } => PKT_ECHO,
            Packet::ServerAck { .. } => PKT_SERVER_ACK,
            Packet::ClientAck { .. } => PKT_CLIENT_ACK,
            Packet::ConnEstablished => PKT_CONN_ESTABLISHED,
            Packet::DuplicateConnection => PKT_DUPLICATE_CONNECTION,
        }
    }

    /// Serialize into the plaintext form that gets outer-sealed.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.type_tag().to_le_bytes());

        match self {
            Packet::SendingMsg(mp) | Packet::DeliveringMsg(mp) => {
                buf.extend_from_slice(mp.sender.as_bytes());
                buf.extend_from_slice(mp.recipient.as_bytes());
                buf.extend_from_slice(&mp.msg_id.to_le_bytes());
                buf.extend_from_slice(&mp.timestamp.to_le_bytes());
                buf.push(mp.flags.to_byte());
                // Three unused bytes follow the flags.
                buf.extend_from_slice(&[0u8; 3]);
                buf.extend_from_slice(mp.pub_nick.as_bytes());
                buf.extend_from_slice(mp.nonce.as_bytes());
                buf.extend_from_slice(&mp.ciphertext);
            }
            Packet::Echo { counter } => {
                buf.extend_from_slice(&counter.to_le_bytes());
            }
            Packet::ServerAck { sender, msg_id } | Packet::ClientAck { sender, msg_id } => {
                buf.extend_from_slice(sender.as_bytes());
                buf.extend_from_slice(&msg_id.to_le_bytes());
            }
            Packet::ConnEstablished | Packet::DuplicateConnection => {}
        }
        buf
    }

    /// Parse a decrypted transport frame.
    pub fn parse(buf: &[u8]) -> Result<Packet, PacketError> {
        let mut cur = Cursor::new(buf);
        let tag = cur.read_u32()?;

        let packet = match tag {
            PKT_SENDING_MSG | PKT_DELIVERING_MSG => {
                let mp = MessagePacket {
                    sender: PeerId::from_bytes(cur.read_array()?),
                    recipient: PeerId::from_bytes(cur.read_array()?),
                    msg_id: cur.read_u64()?,
                    timestamp: cur.read_u32()?,
                    flags: {
                        let flags = MessageFlags::from_byte(cur.read_u8()?);
                        let _unused: [u8; 3] = cur.read_array()?;
                        flags
                    },
                    pub_nick: PubNick::from_bytes(cur.read_array()?),
                    nonce: Nonce::from_bytes(cur.read_array()?),
                    ciphertext: cur.read_rest().to_vec(),
                };
                if tag == PKT_SENDING_MSG {
                    Packet::SendingMsg(mp)
                } else {
                    Packet::DeliveringMsg(mp)
                }
            }
            PKT_ECHO => Packet::Echo {
                counter: cur.read_u64()?,
            },
            PKT_SERVER_ACK | PKT_CLIENT_ACK => {
                let sender = PeerId::from_bytes(cur.read_array()?);
                let msg_id = cur.read_u64()?;
                if tag == PKT_SERVER_ACK {
                    Packet::ServerAck { sender, msg_id }
                } else {
                    Packet::ClientAck { sender, msg_id }
                }
            }
            PKT_CONN_ESTABLISHED => Packet::ConnEstablished,
            PKT_DUPLICATE_CONNECTION => Packet::DuplicateConnection,
            other => return Err(PacketError::UnknownType(other)),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn sample_message_packet() -> MessagePacket {
        MessagePacket {
            sender: id("AAAAAAAA"),
            recipient: id("BBBBBBBB"),
            msg_id: 0x1122334455667788,
            timestamp: 1_700_000_000,
            flags: MessageFlags::push(),
            pub_nick: PubNick::new("alice"),
            nonce: Nonce::from_bytes([0x33; 24]),
            ciphertext: vec![0xDE, 0xAD, 0xBE, 0xEF],
        }
    }

    #[test]
    fn test_client_hello_layout() {
        let hello = ClientHello {
            client_spk: [0x11; 32],
            nonce_prefix: [0x22; 16],
        };
        let bytes = hello.serialize();
        assert_eq!(bytes.len(), CLIENT_HELLO_SIZE);
        assert_eq!(&bytes[..32], &[0x11; 32]);
        assert_eq!(&bytes[32..], &[0x22; 16]);
        assert_eq!(ClientHello::parse(&bytes).unwrap(), hello);
    }

    #[test]
    fn test_server_hello_roundtrip() {
        let hello = ServerHello {
            nonce_prefix: [0x01; 16],
            ciphertext: [0x02; 64],
        };
        let bytes = hello.serialize();
        assert_eq!(bytes.len(), SERVER_HELLO_SIZE);
        assert_eq!(ServerHello::parse(&bytes).unwrap(), hello);
    }

    #[test]
    fn test_auth_payload_is_128_bytes() {
        let payload = AuthPayload {
            username: id("AAAAAAAA"),
            sys_data: [0u8; 32],
            server_nonce_prefix: [0x05; 16],
            random_nonce: Nonce::from_bytes([0x06; 24]),
            ciphertext: [0x07; 48],
        };
        let bytes = payload.serialize();
        assert_eq!(bytes.len(), AUTH_PAYLOAD_SIZE);
        assert_eq!(AuthPayload::parse(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_message_packet_layout() {
        let packet = Packet::SendingMsg(sample_message_packet());
        let bytes = packet.serialize();

        // tag(4) sender(8) recipient(8) id(8) time(4) flags(1) pad(3)
        // nick(32) nonce(24) ciphertext(4)
        assert_eq!(bytes.len(), 4 + 8 + 8 + 8 + 4 + 1 + 3 + 32 + 24 + 4);
        assert_eq!(&bytes[..4], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[4..12], b"AAAAAAAA");
        assert_eq!(&bytes[12..20], b"BBBBBBBB");
        assert_eq!(bytes[28..32], 1_700_000_000u32.to_le_bytes());
        assert_eq!(bytes[32], 0x01, "push flag is bit zero");
        assert_eq!(&bytes[33..36], &[0, 0, 0]);
    }

    #[test]
    fn test_packet_roundtrip_all_variants() {
        let packets = vec![
            Packet::SendingMsg(sample_message_packet()),
            Packet::DeliveringMsg(sample_message_packet()),
            Packet::Echo { counter: 42 },
            Packet::ServerAck {
                sender: id("AAAAAAAA"),
                msg_id: 7,
            },
            Packet::ClientAck {
                sender: id("BBBBBBBB"),
                msg_id: 9,
            },
            Packet::ConnEstablished,
            Packet::DuplicateConnection,
        ];

        for packet in packets {
            let bytes = packet.serialize();
            let parsed = Packet::parse(&bytes)
                .unwrap_or_else(|e| panic!("parse failed for {:?}: {e}", packet.type_tag()));
            assert_eq!(parsed, packet);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let mut buf = 0xBEu32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            Packet::parse(&buf),
            Err(PacketError::UnknownType(0xBE))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_frame() {
        let packet = Packet::Echo { counter: 1 };
        let bytes = packet.serialize();
        assert!(Packet::parse(&bytes[..6]).is_err());
    }

    #[test]
    fn test_flags_byte_roundtrip() {
        for byte in 0..=0x1Fu8 {
            assert_eq!(MessageFlags::from_byte(byte).to_byte(), byte);
        }
        let flags = MessageFlags {
            push_message: true,
            group_message: true,
            ..Default::default()
        };
        assert_eq!(flags.to_byte(), 0b1_0001);
    }
}
