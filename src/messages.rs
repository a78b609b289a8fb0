//! End-to-end message kinds and their wire forms.
//!
//! An inner plaintext starts with a single type byte, followed by the
//! type-specific body and random padding. Media kinds are indirect: the
//! body only references a blob in the external store together with the
//! material needed to decrypt it. Group messages exist purely between
//! clients; sending to a group means one transport message per member.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::Nonce;
use crate::errors::MessageError;
use crate::groups::Group;
use crate::identity::{PeerId, PubNick};
use crate::wire::{pad, strip_padding, Cursor};
use crate::{BLOB_ID_SIZE, GROUP_ID_SIZE, KEY_SIZE};

pub const MSG_TEXT: u8 = 0x01;
pub const MSG_IMAGE: u8 = 0x02;
pub const MSG_AUDIO: u8 = 0x14;
pub const MSG_POLL: u8 = 0x15;
pub const MSG_LOCATION: u8 = 0x16;
pub const MSG_FILE: u8 = 0x17;
pub const MSG_GROUP_TEXT: u8 = 0x41;
pub const MSG_GROUP_IMAGE: u8 = 0x43;
pub const MSG_GROUP_SET_MEMBERS: u8 = 0x4A;
pub const MSG_GROUP_SET_NAME: u8 = 0x4B;
pub const MSG_GROUP_MEMBER_LEFT: u8 = 0x4C;
pub const MSG_GROUP_SET_IMAGE: u8 = 0x50;
pub const MSG_DELIVERY_RECEIPT: u8 = 0x80;
pub const MSG_TYPING_NOTIFICATION: u8 = 0x90;

/// Status byte of a delivery receipt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeliveryStatus {
    Delivered,
    Read,
    Approved,
    Disapproved,
}

impl DeliveryStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
            DeliveryStatus::Approved => 3,
            DeliveryStatus::Disapproved => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, MessageError> {
        match byte {
            1 => Ok(DeliveryStatus::Delivered),
            2 => Ok(DeliveryStatus::Read),
            3 => Ok(DeliveryStatus::Approved),
            4 => Ok(DeliveryStatus::Disapproved),
            other => Err(MessageError::UnknownStatus(other)),
        }
    }
}

/// Creator ID plus group ID, the 16-byte prefix of most group bodies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GroupHeader {
    pub creator: PeerId,
    pub group_id: [u8; GROUP_ID_SIZE],
}

impl GroupHeader {
    pub fn for_group(group: &Group) -> Self {
        GroupHeader {
            creator: group.creator,
            group_id: group.group_id,
        }
    }
}

/// The decrypted content of an end-to-end message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MessageBody {
    Text {
        text: String,
    },
    /// Reference to an asymmetrically sealed blob; the nonce decrypts it
    /// together with the sender and recipient long-term keys.
    Image {
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        nonce: Nonce,
    },
    /// Reference to a symmetrically sealed blob with an embedded key.
    Audio {
        duration_secs: u16,
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        key: [u8; KEY_SIZE],
    },
    DeliveryReceipt {
        status: DeliveryStatus,
        msg_id: u64,
    },
    TypingNotification {
        active: bool,
    },
    GroupText {
        group: GroupHeader,
        text: String,
    },
    GroupImage {
        group: GroupHeader,
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        key: [u8; KEY_SIZE],
    },
    GroupSetMembers {
        group_id: [u8; GROUP_ID_SIZE],
        members: Vec<PeerId>,
    },
    GroupSetName {
        group_id: [u8; GROUP_ID_SIZE],
        name: String,
    },
    GroupMemberLeft {
        group: GroupHeader,
    },
    GroupSetImage {
        group_id: [u8; GROUP_ID_SIZE],
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        key: [u8; KEY_SIZE],
    },
    /// Poll, location and file messages are carried without
    /// interpretation.
    Opaque {
        msg_type: u8,
        data: Vec<u8>,
    },
}

impl MessageBody {
    pub fn type_byte(&self) -> u8 {
        match self {
            MessageBody::Text { .. } => MSG_TEXT,
            MessageBody::Image { .. } => MSG_IMAGE,
            MessageBody::Audio { .. } => MSG_AUDIO,
            MessageBody::DeliveryReceipt { .. } => MSG_DELIVERY_RECEIPT,
            MessageBody::TypingNotification { .. } => MSG_TYPING_NOTIFICATION,
            MessageBody::GroupText { .. } => MSG_GROUP_TEXT,
            MessageBody::GroupImage { .. } => MSG_GROUP_IMAGE,
            MessageBody::GroupSetMembers { .. } => MSG_GROUP_SET_MEMBERS,
            MessageBody::GroupSetName { .. } => MSG_GROUP_SET_NAME,
            MessageBody::GroupMemberLeft { .. } => MSG_GROUP_MEMBER_LEFT,
            MessageBody::GroupSetImage { .. } => MSG_GROUP_SET_IMAGE,
            MessageBody::Opaque { msg_type, .. } => *msg_type,
        }
    }

    /// True for bodies that address a group; the containing packet gets
    /// the group flag set.
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            MessageBody::GroupText { .. }
                | MessageBody::GroupImage { .. }
                | MessageBody::GroupSetMembers { .. }
                | MessageBody::GroupSetName { .. }
                | MessageBody::GroupMemberLeft { .. }
                | MessageBody::GroupSetImage { .. }
        )
    }

    /// Serialize into the padded plaintext that gets end-to-end sealed.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.encode_unpadded();
        pad(&mut buf);
        buf
    }

    fn encode_unpadded(&self) -> Vec<u8> {
        let mut buf = vec![self.type_byte()];
        match self {
            MessageBody::Text { text } => {
                buf.extend_from_slice(text.as_bytes());
            }
            MessageBody::Image {
                blob_id,
                size,
                nonce,
            } => {
                buf.extend_from_slice(blob_id);
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(nonce.as_bytes());
            }
            MessageBody::Audio {
                duration_secs,
                blob_id,
                size,
                key,
            } => {
                buf.extend_from_slice(&duration_secs.to_le_bytes());
                buf.extend_from_slice(blob_id);
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(key);
            }
            MessageBody::DeliveryReceipt { status, msg_id } => {
                buf.push(status.to_byte());
                buf.extend_from_slice(&msg_id.to_le_bytes());
            }
            MessageBody::TypingNotification { active } => {
                buf.push(u8::from(*active));
            }
            MessageBody::GroupText { group, text } => {
                buf.extend_from_slice(group.creator.as_bytes());
                buf.extend_from_slice(&group.group_id);
                buf.extend_from_slice(text.as_bytes());
            }
            MessageBody::GroupImage {
                group,
                blob_id,
                size,
                key,
            } => {
                buf.extend_from_slice(group.creator.as_bytes());
                buf.extend_from_slice(&group.group_id);
                buf.extend_from_slice(blob_id);
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(key);
            }
            MessageBody::GroupSetMembers { group_id, members } => {
                buf.extend_from_slice(group_id);
                for member in members {
                    buf.extend_from_slice(member.as_bytes());
                }
            }
            MessageBody::GroupSetName { group_id, name } => {
                buf.extend_from_slice(group_id);
                buf.extend_from_slice(name.as_bytes());
            }
            MessageBody::GroupMemberLeft { group } => {
                buf.extend_from_slice(group.creator.as_bytes());
                buf.extend_from_slice(&group.group_id);
            }
            MessageBody::GroupSetImage {
                group_id,
                blob_id,
                size,
                key,
            } => {
                buf.extend_from_slice(group_id);
                buf.extend_from_slice(blob_id);
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(key);
            }
            MessageBody::Opaque { data, .. } => {
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    /// Decode a decrypted plaintext into a message body.
    ///
    /// The padding is stripped here, by the type-specific decoder, not by
    /// the caller. Typing notifications are the exception: peers send
    /// them unpadded, so only the first body byte is interpreted.
    pub fn decode(plaintext: &[u8]) -> Result<MessageBody, MessageError> {
        let mut cur = Cursor::new(plaintext);
        let msg_type = cur.read_u8()?;
        let rest = cur.read_rest();

        if msg_type == MSG_TYPING_NOTIFICATION {
            let mut cur = Cursor::new(rest);
            return Ok(MessageBody::TypingNotification {
                active: cur.read_u8()? != 0,
            });
        }

        let body = strip_padding(rest)?;
        let mut cur = Cursor::new(body);

        let decoded = match msg_type {
            MSG_TEXT => MessageBody::Text {
                text: String::from_utf8(cur.read_rest().to_vec())?,
            },
            MSG_IMAGE => MessageBody::Image {
                blob_id: cur.read_array()?,
                size: cur.read_u32()?,
                nonce: Nonce::from_bytes(cur.read_array()?),
            },
            MSG_AUDIO => MessageBody::Audio {
                duration_secs: cur.read_u16()?,
                blob_id: cur.read_array()?,
                size: cur.read_u32()?,
                key: cur.read_array()?,
            },
            MSG_DELIVERY_RECEIPT => MessageBody::DeliveryReceipt {
                status: DeliveryStatus::from_byte(cur.read_u8()?)?,
                msg_id: cur.read_u64()?,
            },
            MSG_GROUP_TEXT => MessageBody::GroupText {
                group: read_group_header(&mut cur)?,
                text: String::from_utf8(cur.read_rest().to_vec())?,
            },
            MSG_GROUP_IMAGE => MessageBody::GroupImage {
                group: read_group_header(&mut cur)?,
                blob_id: cur.read_array()?,
                size: cur.read_u32()?,
                key: cur.read_array()?,
            },
            MSG_GROUP_SET_MEMBERS => {
                let group_id: [u8; GROUP_ID_SIZE] = cur.read_array()?;
                let member_bytes = cur.read_rest();
                if member_bytes.len() % 8 != 0 {
                    return Err(MessageError::MemberList(member_bytes.len()));
                }
                let members = member_bytes
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut id = [0u8; 8];
                        id.copy_from_slice(chunk);
                        PeerId::from_bytes(id)
                    })
                    .collect();
                MessageBody::GroupSetMembers { group_id, members }
            }
            MSG_GROUP_SET_NAME => MessageBody::GroupSetName {
                group_id: cur.read_array()?,
                name: String::from_utf8(cur.read_rest().to_vec())?,
            },
            MSG_GROUP_MEMBER_LEFT => MessageBody::GroupMemberLeft {
                group: read_group_header(&mut cur)?,
            },
            MSG_GROUP_SET_IMAGE => MessageBody::GroupSetImage {
                group_id: cur.read_array()?,
                blob_id: cur.read_array()?,
                size: cur.read_u32()?,
                key: cur.read_array()?,
            },
            MSG_POLL | MSG_LOCATION | MSG_FILE => MessageBody::Opaque {
                msg_type,
                data: cur.read_rest().to_vec(),
            },
            other => return Err(MessageError::UnknownType(other)),
        };
        Ok(decoded)
    }
}

fn read_group_header(cur: &mut Cursor<'_>) -> Result<GroupHeader, MessageError> {
    Ok(GroupHeader {
        creator: PeerId::from_bytes(cur.read_array()?),
        group_id: cur.read_array()?,
    })
}

/// A decrypted inbound message together with its packet header fields.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReceivedMessage {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub msg_id: u64,
    pub timestamp: u32,
    pub pub_nick: PubNick,
    pub body: MessageBody,
}

/// An application message queued for sending.
///
/// The session fills in sender, nickname and timestamp when it builds the
/// transport packet.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OutgoingMessage {
    pub recipient: PeerId,
    pub msg_id: u64,
    pub body: MessageBody,
}

/// A random 64-bit message ID from the OS CSPRNG.
pub fn random_msg_id() -> u64 {
    OsRng.next_u64()
}

impl OutgoingMessage {
    pub fn new(recipient: PeerId, body: MessageBody) -> Self {
        OutgoingMessage {
            recipient,
            msg_id: random_msg_id(),
            body,
        }
    }

    pub fn text(recipient: PeerId, text: &str) -> Self {
        OutgoingMessage::new(
            recipient,
            MessageBody::Text {
                text: text.to_string(),
            },
        )
    }

    pub fn image(
        recipient: PeerId,
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        nonce: Nonce,
    ) -> Self {
        OutgoingMessage::new(
            recipient,
            MessageBody::Image {
                blob_id,
                size,
                nonce,
            },
        )
    }

    pub fn audio(
        recipient: PeerId,
        duration_secs: u16,
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        key: [u8; KEY_SIZE],
    ) -> Self {
        OutgoingMessage::new(
            recipient,
            MessageBody::Audio {
                duration_secs,
                blob_id,
                size,
                key,
            },
        )
    }

    pub fn delivery_receipt(recipient: PeerId, status: DeliveryStatus, msg_id: u64) -> Self {
        OutgoingMessage::new(recipient, MessageBody::DeliveryReceipt { status, msg_id })
    }

    pub fn typing(recipient: PeerId, active: bool) -> Self {
        OutgoingMessage::new(recipient, MessageBody::TypingNotification { active })
    }

    /// One group text message per member, identical content, fresh
    /// message IDs.
    pub fn group_text(group: &Group, text: &str) -> Vec<Self> {
        fan_out(group, |_| MessageBody::GroupText {
            group: GroupHeader::for_group(group),
            text: text.to_string(),
        })
    }

    pub fn group_image(
        group: &Group,
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        key: [u8; KEY_SIZE],
    ) -> Vec<Self> {
        fan_out(group, |_| MessageBody::GroupImage {
            group: GroupHeader::for_group(group),
            blob_id,
            size,
            key,
        })
    }

    /// Announce the full member list to every member.
    pub fn group_set_members(group: &Group) -> Vec<Self> {
        fan_out(group, |g| MessageBody::GroupSetMembers {
            group_id: g.group_id,
            members: g.members.clone(),
        })
    }

    /// Announce the group name to every member.
    pub fn group_set_name(group: &Group) -> Vec<Self> {
        fan_out(group, |g| MessageBody::GroupSetName {
            group_id: g.group_id,
            name: g.name.clone(),
        })
    }

    /// Tell every member that we left.
    pub fn group_member_left(group: &Group) -> Vec<Self> {
        fan_out(group, |g| MessageBody::GroupMemberLeft {
            group: GroupHeader::for_group(g),
        })
    }

    pub fn group_set_image(
        group: &Group,
        blob_id: [u8; BLOB_ID_SIZE],
        size: u32,
        key: [u8; KEY_SIZE],
    ) -> Vec<Self> {
        fan_out(group, |g| MessageBody::GroupSetImage {
            group_id: g.group_id,
            blob_id,
            size,
            key,
        })
    }
}

/// Announce a freshly created group: first the member list, then the
/// name, each fanned out to all members.
pub fn create_group_messages(group: &Group) -> Vec<OutgoingMessage> {
    let mut messages = OutgoingMessage::group_set_members(group);
    messages.extend(OutgoingMessage::group_set_name(group));
    messages
}

fn fan_out(group: &Group, body: impl Fn(&Group) -> MessageBody) -> Vec<OutgoingMessage> {
    group
        .members
        .iter()
        .map(|member| OutgoingMessage::new(*member, body(group)))
        .collect()
}

/// Current time as the uint32 unix seconds carried in message packets.
pub fn now_timestamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
