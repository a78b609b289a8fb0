pub mod addressbook;
pub mod blob;
pub mod crypto;
pub mod directory;
pub mod errors;
pub mod groups;
pub mod identity;
pub mod messages;
pub mod packets;
pub mod queue;
pub mod session;
pub mod wire;

pub use addressbook::{AddressBook, Contact};
pub use blob::{BlobClient, BlobConfig, BlobId};
pub use directory::{Directory, RestDirectory};
pub use groups::{Group, GroupDirectory};
pub use identity::{Identity, PeerId, PubNick};
pub use messages::{DeliveryStatus, MessageBody, OutgoingMessage, ReceivedMessage};
pub use session::{Incoming, Session, SessionConfig, SessionHandle};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const NONCE_PREFIX_SIZE: usize = 16;
pub const BOX_OVERHEAD: usize = 16;
pub const ID_SIZE: usize = 8;
pub const NICK_SIZE: usize = 32;
pub const BLOB_ID_SIZE: usize = 16;
pub const GROUP_ID_SIZE: usize = 8;

pub const CLIENT_HELLO_SIZE: usize = 48;
pub const SERVER_HELLO_SIZE: usize = 80;
pub const AUTH_PACKET_SIZE: usize = 144;
pub const AUTH_PAYLOAD_SIZE: usize = 128;
pub const HANDSHAKE_ACK_SIZE: usize = 32;

pub const CHAT_SERVER_PORT: u16 = 5222;
