//! The long-lived chat session: handshake, receive loop, send loop and
//! the echo keepalive.
//!
//! One TCP connection carries everything. After the handshake the socket
//! is split: the receive task owns the read half and the inbound nonce
//! chain, the writer task owns the write half and the outbound nonce
//! chain, so neither direction ever needs a lock. A third task ticks the
//! periodic echo. Acknowledgements for delivered messages are ordered
//! through the writer and confirmed back to the receive task before a
//! message is surfaced to the application, so a crash can lose an ack but
//! never a message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::addressbook::{AddressBook, Contact};
use crate::crypto::{box_open, box_seal, generate_keypair, KeyPair, Nonce, NonceSequence};
use crate::directory::Directory;
use crate::errors::{DirectoryError, PacketError, ReceiveError, SessionError};
use crate::groups::Group;
use crate::identity::{Identity, PeerId};
use crate::messages::{
    create_group_messages, now_timestamp, MessageBody, OutgoingMessage, ReceivedMessage,
};
use crate::packets::{
    AuthPacket, AuthPayload, ClientHello, HandshakeAck, MessageFlags, MessagePacket, Packet,
    ServerHello,
};
use crate::queue::elastic_channel;
use crate::wire::Cursor;
use crate::{
    BOX_OVERHEAD, CHAT_SERVER_PORT, HANDSHAKE_ACK_SIZE, KEY_SIZE, SERVER_HELLO_SIZE,
};

/// Long-term public key of the production chat server. The server hello
/// must be sealed with the matching secret key or the handshake fails.
pub const DEFAULT_SERVER_PUBLIC_KEY: [u8; KEY_SIZE] = [
    69, 11, 151, 87, 53, 39, 159, 222, 203, 51, 19, 100, 143, 95, 198, 238, 159, 244, 54, 14,
    169, 42, 140, 23, 81, 198, 97, 228, 192, 216, 201, 9,
];

/// Cadence of the echo keepalive.
pub const ECHO_INTERVAL: Duration = Duration::from_secs(180);

/// Where and whom to connect to.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub server_addr: String,
    pub server_public_key: [u8; KEY_SIZE],
    pub echo_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            server_addr: format!("g-33.0.chat.o3net.org:{CHAT_SERVER_PORT}"),
            server_public_key: DEFAULT_SERVER_PUBLIC_KEY,
            echo_interval: ECHO_INTERVAL,
        }
    }
}

/// One slot on the receive channel: a decrypted message or the reason
/// this particular slot could not be produced. The stream continues
/// either way until a terminal error shows up on the error channel.
pub type Incoming = Result<ReceivedMessage, ReceiveError>;

/// The application's view of a running session.
pub struct SessionHandle {
    outbound: mpsc::Sender<OutgoingMessage>,
    control: mpsc::UnboundedSender<WriterOrder>,
    pub inbound: mpsc::Receiver<Incoming>,
    pub errors: mpsc::UnboundedReceiver<SessionError>,
}

impl SessionHandle {
    /// Queue a message for sending. The queue grows as needed; this only
    /// fails once the session is gone.
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue several messages in order.
    pub async fn send_all(
        &self,
        messages: impl IntoIterator<Item = OutgoingMessage>,
    ) -> Result<(), SessionError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Announce a new group to all its members: member list first, then
    /// the name.
    pub async fn create_group(&self, group: &Group) -> Result<(), SessionError> {
        self.send_all(create_group_messages(group)).await
    }

    /// Push the current member list of a group to every member.
    pub async fn change_group_members(&self, group: &Group) -> Result<(), SessionError> {
        self.send_all(OutgoingMessage::group_set_members(group)).await
    }

    /// Push the current name of a group to every member.
    pub async fn rename_group(&self, group: &Group) -> Result<(), SessionError> {
        self.send_all(OutgoingMessage::group_set_name(group)).await
    }

    /// Tell every member of a group that we are leaving it.
    pub async fn leave_group(&self, group: &Group) -> Result<(), SessionError> {
        self.send_all(OutgoingMessage::group_member_left(group)).await
    }

    /// Shut the session down. The writer stops and closes its half of
    /// the socket; the receive task winds down on the resulting EOF and
    /// the inbound channel closes.
    pub fn close(&self) {
        let _ = self.control.send(WriterOrder::Shutdown);
    }
}

/// Session entry point.
pub struct Session;

impl Session {
    /// Connect, run the handshake and start the session tasks.
    ///
    /// Returns once the handshake is complete. Received messages appear
    /// on `inbound`, terminal and per-operation errors on `errors`; the
    /// inbound channel closes when the session ends.
    pub async fn open(
        identity: Identity,
        contacts: Arc<AddressBook>,
        directory: Arc<dyn Directory>,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        let stream = TcpStream::connect(&config.server_addr).await?;
        debug!("connected to {}", config.server_addr);

        let outcome = handshake(stream, &identity, &config).await?;
        info!("handshake with {} completed", config.server_addr);

        let (read_half, write_half) = outcome.stream.into_split();

        let ctx = Arc::new(SessionContext {
            identity,
            contacts,
            directory,
            server_spk: outcome.server_spk,
            session_keys: outcome.session_keys,
            last_echo: AtomicU64::new(0),
        });

        let (out_tx, out_rx) = elastic_channel();
        let (in_tx, in_rx) = elastic_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (order_tx, order_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_task(
            write_half,
            outcome.client_seq,
            ctx.clone(),
            order_rx,
            out_rx,
            err_tx.clone(),
        ));
        tokio::spawn(receive_task(
            read_half,
            outcome.server_seq,
            ctx,
            order_tx.clone(),
            in_tx,
            err_tx,
        ));
        tokio::spawn(echo_task(config.echo_interval, order_tx.clone()));

        Ok(SessionHandle {
            outbound: out_tx,
            control: order_tx,
            inbound: in_rx,
            errors: err_rx,
        })
    }
}

/// Keys and collaborators shared by the session tasks.
struct SessionContext {
    identity: Identity,
    contacts: Arc<AddressBook>,
    directory: Arc<dyn Directory>,
    server_spk: [u8; KEY_SIZE],
    session_keys: KeyPair,
    /// Most recent echo counter observed from the server.
    last_echo: AtomicU64,
}

struct HandshakeOutcome {
    stream: TcpStream,
    session_keys: KeyPair,
    server_spk: [u8; KEY_SIZE],
    client_seq: NonceSequence,
    server_seq: NonceSequence,
}

/// Run the four-step handshake on a fresh connection.
///
/// Leaves the client nonce at counter 1 (used by the auth packet) and the
/// server nonce at counter 2 (used by the handshake ack), so the first
/// session frame in each direction advances to the next counter.
async fn handshake(
    mut stream: TcpStream,
    identity: &Identity,
    config: &SessionConfig,
) -> Result<HandshakeOutcome, SessionError> {
    let session_keys = generate_keypair();
    let client_seq = NonceSequence::fresh();

    // Step 1: client hello, in plain.
    let hello = ClientHello {
        client_spk: session_keys.public_key,
        nonce_prefix: client_seq.prefix(),
    };
    stream.write_all(&hello.serialize()).await?;

    // Step 2: server hello. The sealed body proves the server holds the
    // pinned long-term key and binds our nonce prefix to the session.
    let mut buf = [0u8; SERVER_HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let server_hello = ServerHello::parse(&buf)
        .map_err(|_| SessionError::Handshake("short server hello".to_string()))?;

    let server_seq = NonceSequence::with_prefix(server_hello.nonce_prefix);
    let (nonce, server_seq) = server_seq.advance()?;
    let plaintext = box_open(
        &server_hello.ciphertext,
        &nonce,
        &config.server_public_key,
        &session_keys.secret_key,
    )
    .map_err(|_| SessionError::Handshake("server hello rejected, wrong server key?".to_string()))?;

    let mut cur = Cursor::new(&plaintext);
    let server_spk: [u8; KEY_SIZE] = cur
        .read_array()
        .map_err(|_| SessionError::Handshake("truncated server hello body".to_string()))?;
    let echoed_prefix: [u8; 16] = cur
        .read_array()
        .map_err(|_| SessionError::Handshake("truncated server hello body".to_string()))?;
    if echoed_prefix != client_seq.prefix() {
        return Err(SessionError::Handshake(
            "server echoed a foreign nonce prefix".to_string(),
        ));
    }

    // Step 3: authentication. The inner seal binds our ephemeral key to
    // the long-term identity; the outer seal is the first frame of the
    // client nonce chain.
    let random_nonce = Nonce::random();
    let inner = box_seal(
        &session_keys.public_key,
        &random_nonce,
        &config.server_public_key,
        identity.secret_key(),
    )?;
    let inner: [u8; 48] = inner
        .try_into()
        .map_err(|_| SessionError::Handshake("inner auth seal has unexpected size".to_string()))?;

    let payload = AuthPayload {
        username: identity.id,
        sys_data: [0u8; 32],
        server_nonce_prefix: server_seq.prefix(),
        random_nonce,
        ciphertext: inner,
    };
    let (nonce, client_seq) = client_seq.advance()?;
    let sealed = box_seal(
        &payload.serialize(),
        &nonce,
        &server_spk,
        &session_keys.secret_key,
    )?;
    let auth = AuthPacket {
        ciphertext: sealed
            .try_into()
            .map_err(|_| SessionError::Handshake("auth packet has unexpected size".to_string()))?,
    };
    stream.write_all(&auth.ciphertext).await?;

    // Step 4: handshake ack at server counter 2. The content is empty;
    // only the successful open matters.
    let mut buf = [0u8; HANDSHAKE_ACK_SIZE];
    stream.read_exact(&mut buf).await?;
    let ack = HandshakeAck { ciphertext: buf };
    let (nonce, server_seq) = server_seq.advance()?;
    box_open(&ack.ciphertext, &nonce, &server_spk, &session_keys.secret_key)
        .map_err(|_| SessionError::Handshake("handshake ack rejected".to_string()))?;

    Ok(HandshakeOutcome {
        stream,
        session_keys,
        server_spk,
        client_seq,
        server_seq,
    })
}

/// Work items for the writer task.
enum WriterOrder {
    /// Acknowledge a delivered message. `done` fires after the ack frame
    /// has been written out.
    Ack {
        sender: PeerId,
        msg_id: u64,
        done: oneshot::Sender<()>,
    },
    /// Send an echo with the next counter value.
    Echo,
    /// The server finished draining the offline queue; start sending
    /// application messages.
    StartSending,
    Shutdown,
}

/// Owns the write half of the socket and the outbound nonce chain.
///
/// Control orders (acks, echoes) are always served; the application queue
/// is only drained once the server has signalled `connEstablished`.
async fn writer_task(
    mut write_half: OwnedWriteHalf,
    client_seq: NonceSequence,
    ctx: Arc<SessionContext>,
    mut orders: mpsc::UnboundedReceiver<WriterOrder>,
    mut outbound: mpsc::Receiver<OutgoingMessage>,
    errors: mpsc::UnboundedSender<SessionError>,
) {
    let mut seq = client_seq;
    let mut started = false;

    loop {
        tokio::select! {
            biased;

            order = orders.recv() => match order {
                None | Some(WriterOrder::Shutdown) => break,
                Some(WriterOrder::Ack { sender, msg_id, done }) => {
                    let packet = Packet::ClientAck { sender, msg_id };
                    match write_frame(&mut write_half, seq, &ctx, &packet.serialize()).await {
                        Ok(next) => {
                            seq = next;
                            let _ = done.send(());
                        }
                        Err(e) => {
                            let _ = errors.send(e);
                            break;
                        }
                    }
                }
                Some(WriterOrder::Echo) => {
                    let counter = ctx.last_echo.load(Ordering::Relaxed) + 1;
                    debug!("sending echo {counter}");
                    let frame = Packet::Echo { counter }.serialize();
                    match write_frame(&mut write_half, seq, &ctx, &frame).await {
                        Ok(next) => seq = next,
                        Err(e) => {
                            let _ = errors.send(e);
                            break;
                        }
                    }
                }
                Some(WriterOrder::StartSending) => {
                    debug!("outbound queue enabled");
                    started = true;
                }
            },

            message = outbound.recv(), if started => match message {
                None => break,
                Some(message) => match send_message(&mut write_half, seq, &ctx, message, &errors).await {
                    Ok(next) => seq = next,
                    Err(e) => {
                        let _ = errors.send(e);
                        break;
                    }
                },
            },
        }
    }
    debug!("writer task finished");
}

/// Build, seal and write one application message.
///
/// Failures that only concern this message (unknown recipient, oversized
/// body) are reported on the error channel and the nonce chain is handed
/// back untouched; an `Err` from here is terminal for the session.
async fn send_message(
    write_half: &mut OwnedWriteHalf,
    seq: NonceSequence,
    ctx: &SessionContext,
    message: OutgoingMessage,
    errors: &mpsc::UnboundedSender<SessionError>,
) -> Result<NonceSequence, SessionError> {
    let recipient_key = match resolve_peer(ctx, message.recipient).await {
        Ok(key) => key,
        Err(source) => {
            let _ = errors.send(SessionError::Resolve {
                id: message.recipient,
                source,
            });
            return Ok(seq);
        }
    };

    let flags = if message.body.is_group() {
        MessageFlags {
            push_message: true,
            group_message: true,
            ..Default::default()
        }
    } else {
        MessageFlags::push()
    };

    // End-to-end seal under a fresh random nonce; the nonce travels in
    // plain inside the packet.
    let e2e_nonce = Nonce::random();
    let plaintext = message.body.encode();
    let ciphertext = box_seal(
        &plaintext,
        &e2e_nonce,
        &recipient_key,
        ctx.identity.secret_key(),
    )?;

    let packet = Packet::SendingMsg(MessagePacket {
        sender: ctx.identity.id,
        recipient: message.recipient,
        msg_id: message.msg_id,
        timestamp: now_timestamp(),
        flags,
        pub_nick: ctx.identity.nick,
        nonce: e2e_nonce,
        ciphertext,
    });

    let frame = packet.serialize();
    if frame.len() + BOX_OVERHEAD > u16::MAX as usize {
        let _ = errors.send(SessionError::Oversize(frame.len() + BOX_OVERHEAD));
        return Ok(seq);
    }

    debug!(
        "sending message {:#018x} to {}",
        message.msg_id, message.recipient
    );
    write_frame(write_half, seq, ctx, &frame).await
}

/// Outer-seal a serialized packet at the next counter and write the
/// length-prefixed frame.
async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    seq: NonceSequence,
    ctx: &SessionContext,
    plaintext: &[u8],
) -> Result<NonceSequence, SessionError> {
    let (nonce, next) = seq.advance()?;
    let ciphertext = box_seal(
        plaintext,
        &nonce,
        &ctx.server_spk,
        &ctx.session_keys.secret_key,
    )?;

    write_half
        .write_all(&(ciphertext.len() as u16).to_le_bytes())
        .await?;
    write_half.write_all(&ciphertext).await?;
    write_half.flush().await?;
    Ok(next)
}

/// Owns the read half of the socket and the inbound nonce chain.
///
/// Frames are consumed strictly in arrival order and dispatched in that
/// same order. A delivered message is acknowledged through the writer,
/// and only after the ack frame is on the wire is the message surfaced.
async fn receive_task(
    mut read_half: OwnedReadHalf,
    server_seq: NonceSequence,
    ctx: Arc<SessionContext>,
    orders: mpsc::UnboundedSender<WriterOrder>,
    inbound: mpsc::Sender<Incoming>,
    errors: mpsc::UnboundedSender<SessionError>,
) {
    let mut seq = server_seq;

    loop {
        let mut len_buf = [0u8; 2];
        if let Err(e) = read_half.read_exact(&mut len_buf).await {
            let _ = errors.send(SessionError::Io(e));
            break;
        }
        let frame_len = u16::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; frame_len];
        if let Err(e) = read_half.read_exact(&mut frame).await {
            let _ = errors.send(SessionError::Io(e));
            break;
        }

        let (nonce, next) = match seq.advance() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = errors.send(e.into());
                break;
            }
        };
        seq = next;

        // An outer frame that does not open cannot be resynchronised.
        let plaintext = match box_open(
            &frame,
            &nonce,
            &ctx.server_spk,
            &ctx.session_keys.secret_key,
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                let _ = errors.send(SessionError::FrameOpen);
                break;
            }
        };

        let packet = match Packet::parse(&plaintext) {
            Ok(packet) => packet,
            Err(PacketError::UnknownType(tag)) => {
                // The session can keep running; framing stays intact.
                let _ = errors.send(SessionError::UnknownPacket(tag));
                continue;
            }
            Err(e) => {
                let _ = errors.send(SessionError::Frame(e));
                break;
            }
        };

        match packet {
            Packet::DeliveringMsg(packet) => {
                // Ack first. If the process dies after the message is
                // surfaced the server must still believe it undelivered,
                // never the other way around.
                let (done_tx, done_rx) = oneshot::channel();
                let order = WriterOrder::Ack {
                    sender: packet.sender,
                    msg_id: packet.msg_id,
                    done: done_tx,
                };
                if orders.send(order).is_err() || done_rx.await.is_err() {
                    break;
                }

                let incoming = open_delivery(&ctx, packet).await;
                if inbound.send(incoming).await.is_err() {
                    debug!("application dropped the receive channel");
                    break;
                }
            }
            Packet::Echo { counter } => {
                debug!("echo reply {counter}");
                ctx.last_echo.store(counter, Ordering::Relaxed);
            }
            Packet::ServerAck { sender, msg_id } => {
                debug!("server acknowledged {msg_id:#018x} for {sender}");
            }
            Packet::ConnEstablished => {
                info!("offline queue drained, connection established");
                let _ = orders.send(WriterOrder::StartSending);
            }
            Packet::DuplicateConnection => {
                warn!("another client took over this identity");
                let _ = errors.send(SessionError::DuplicateConnection);
                break;
            }
            Packet::SendingMsg(_) | Packet::ClientAck { .. } => {
                warn!("server sent a client-only packet, ignoring");
            }
        }
    }

    let _ = orders.send(WriterOrder::Shutdown);
    debug!("receive task finished");
}

/// Decrypt and decode one delivered message. All failure modes are
/// per-message; the session is unaffected.
async fn open_delivery(ctx: &SessionContext, packet: MessagePacket) -> Incoming {
    let sender_key = match resolve_peer(ctx, packet.sender).await {
        Ok(key) => key,
        Err(source) => {
            return Err(ReceiveError::UnknownSender {
                id: packet.sender,
                source,
            })
        }
    };

    let plaintext = match box_open(
        &packet.ciphertext,
        &packet.nonce,
        &sender_key,
        ctx.identity.secret_key(),
    ) {
        Ok(plaintext) => plaintext,
        Err(_) => {
            return Err(ReceiveError::Open {
                sender: packet.sender,
                msg_id: packet.msg_id,
            })
        }
    };

    match MessageBody::decode(&plaintext) {
        Ok(body) => Ok(ReceivedMessage {
            sender: packet.sender,
            recipient: packet.recipient,
            msg_id: packet.msg_id,
            timestamp: packet.timestamp,
            pub_nick: packet.pub_nick,
            body,
        }),
        Err(source) => Err(ReceiveError::Malformed {
            sender: packet.sender,
            msg_id: packet.msg_id,
            source,
        }),
    }
}

/// Long-term key of a peer, from the address book or, failing that, the
/// directory. Directory results are cached in the book.
async fn resolve_peer(
    ctx: &SessionContext,
    id: PeerId,
) -> Result<[u8; KEY_SIZE], DirectoryError> {
    if let Some(contact) = ctx.contacts.get(&id) {
        return Ok(contact.public_key);
    }
    let key = ctx.directory.lookup(id).await?;
    ctx.contacts.add(Contact::new(id, key));
    debug!("cached {id} from directory");
    Ok(key)
}

/// Orders an echo from the writer on a fixed cadence.
async fn echo_task(interval: Duration, orders: mpsc::UnboundedSender<WriterOrder>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if orders.send(WriterOrder::Echo).is_err() {
            break;
        }
    }
}
