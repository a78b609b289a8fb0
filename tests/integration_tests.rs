// End-to-end tests against an in-process mock chat server. The mock
// implements the real server side of the handshake, relays message
// frames between connected clients and records everything it sees, so
// the full client stack (handshake, nonce chains, packet codec, message
// layer, ack discipline, keepalive) is exercised over a loopback socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use ozone::addressbook::{AddressBook, Contact};
use ozone::crypto::{box_open, box_seal, generate_keypair, KeyPair, NonceSequence};
use ozone::directory::Directory;
use ozone::errors::{DirectoryError, SessionError};
use ozone::groups::Group;
use ozone::identity::{Identity, PeerId};
use ozone::messages::{MessageBody, OutgoingMessage};
use ozone::packets::{AuthPayload, ClientHello, MessagePacket, Packet};
use ozone::session::{Session, SessionConfig, SessionHandle};

// ============================================================================
// Test doubles
// ============================================================================

/// Directory backed by a fixed map, no network involved.
#[derive(Default)]
struct StaticDirectory {
    keys: HashMap<PeerId, [u8; 32]>,
}

impl StaticDirectory {
    fn with(entries: &[(PeerId, [u8; 32])]) -> Arc<Self> {
        Arc::new(StaticDirectory {
            keys: entries.iter().copied().collect(),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(StaticDirectory::default())
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(&self, id: PeerId) -> Result<[u8; 32], DirectoryError> {
        self.keys
            .get(&id)
            .copied()
            .ok_or(DirectoryError::NotFound(id))
    }
}

/// In-process chat server: real handshake, frame relay, full recording.
struct MockServer {
    addr: std::net::SocketAddr,
    public_key: [u8; 32],
    inner: Arc<ServerInner>,
    echoes: mpsc::UnboundedReceiver<u64>,
}

struct ServerInner {
    secret_key: [u8; 32],
    client_keys: Mutex<HashMap<PeerId, [u8; 32]>>,
    conns: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Packet>>>,
    sent: Mutex<Vec<MessagePacket>>,
    acks: Mutex<Vec<(PeerId, u64)>>,
    echo_tx: mpsc::UnboundedSender<u64>,
}

impl MockServer {
    async fn spawn() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_keys = generate_keypair();
        let (echo_tx, echoes) = mpsc::unbounded_channel();

        let inner = Arc::new(ServerInner {
            secret_key: server_keys.secret_key,
            client_keys: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            echo_tx,
        });

        let accept_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_conn(accept_inner.clone(), stream));
            }
        });

        MockServer {
            addr,
            public_key: server_keys.public_key,
            inner,
            echoes,
        }
    }

    fn config(&self) -> SessionConfig {
        SessionConfig {
            server_addr: self.addr.to_string(),
            server_public_key: self.public_key,
            echo_interval: Duration::from_secs(180),
        }
    }

    /// The server needs the long-term key of every enrolled client to
    /// verify its auth packet.
    fn register_client(&self, id: PeerId, public_key: [u8; 32]) {
        self.inner.client_keys.lock().unwrap().insert(id, public_key);
    }

    /// Push a server-originated packet onto a client's session.
    fn inject(&self, id: &PeerId, packet: Packet) {
        let conns = self.inner.conns.lock().unwrap();
        conns
            .get(id)
            .expect("client is not connected")
            .send(packet)
            .expect("client connection is gone");
    }

    fn sent(&self) -> Vec<MessagePacket> {
        self.inner.sent.lock().unwrap().clone()
    }

    fn acks(&self) -> Vec<(PeerId, u64)> {
        self.inner.acks.lock().unwrap().clone()
    }

    async fn next_echo(&mut self) -> u64 {
        self.echoes.recv().await.expect("echo channel closed")
    }
}

/// Server side of one client connection.
async fn handle_conn(inner: Arc<ServerInner>, mut stream: TcpStream) -> Option<()> {
    // Client hello, in plain.
    let mut hello_buf = [0u8; 48];
    stream.read_exact(&mut hello_buf).await.ok()?;
    let hello = ClientHello::parse(&hello_buf).ok()?;
    let client_spk = hello.client_spk;
    let client_seq = NonceSequence::with_prefix(hello.nonce_prefix);

    // Server hello: fresh session key, sealed with the long-term key so
    // the client can verify who it is talking to.
    let session_keys = generate_keypair();
    let server_seq = NonceSequence::fresh();
    let server_prefix = server_seq.prefix();

    let mut body = Vec::with_capacity(48);
    body.extend_from_slice(&session_keys.public_key);
    body.extend_from_slice(&hello.nonce_prefix);
    let (nonce, server_seq) = server_seq.advance().unwrap();
    let sealed = box_seal(&body, &nonce, &client_spk, &inner.secret_key).unwrap();

    let mut server_hello = server_prefix.to_vec();
    server_hello.extend_from_slice(&sealed);
    stream.write_all(&server_hello).await.ok()?;

    // Auth packet: outer seal with the session keys, inner seal with the
    // long-term keys. Both must verify.
    let mut auth_buf = [0u8; 144];
    stream.read_exact(&mut auth_buf).await.ok()?;
    let (nonce, client_seq) = client_seq.advance().unwrap();
    let payload_bytes =
        box_open(&auth_buf, &nonce, &client_spk, &session_keys.secret_key).ok()?;
    let payload = AuthPayload::parse(&payload_bytes).ok()?;
    assert_eq!(
        payload.server_nonce_prefix, server_prefix,
        "auth packet must echo the server nonce prefix"
    );

    let client_lpk = *inner
        .client_keys
        .lock()
        .unwrap()
        .get(&payload.username)
        .expect("client identity not registered with mock server");
    let vouched_spk = box_open(
        &payload.ciphertext,
        &payload.random_nonce,
        &client_lpk,
        &inner.secret_key,
    )
    .expect("inner auth seal must open with the client long-term key");
    assert_eq!(
        vouched_spk, client_spk,
        "auth packet must vouch for the session key"
    );

    // Handshake ack: sealed zero content at counter 2.
    let (nonce, server_seq) = server_seq.advance().unwrap();
    let ack = box_seal(&[0u8; 16], &nonce, &client_spk, &session_keys.secret_key).unwrap();
    stream.write_all(&ack).await.ok()?;

    // Session established. There is no offline queue in the mock, so the
    // connection is marked established right away.
    let username = payload.username;
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<Packet>();
    inner
        .conns
        .lock()
        .unwrap()
        .insert(username, to_client_tx.clone());
    to_client_tx.send(Packet::ConnEstablished).unwrap();

    let (mut read_half, mut write_half) = stream.into_split();
    let server_ssk = session_keys.secret_key;

    // Frames to the client, one seal per packet on the server chain.
    tokio::spawn(async move {
        let mut seq = server_seq;
        while let Some(packet) = to_client_rx.recv().await {
            let plaintext = packet.serialize();
            let (nonce, next) = seq.advance().unwrap();
            seq = next;
            let ciphertext = box_seal(&plaintext, &nonce, &client_spk, &server_ssk).unwrap();
            if write_half
                .write_all(&(ciphertext.len() as u16).to_le_bytes())
                .await
                .is_err()
                || write_half.write_all(&ciphertext).await.is_err()
            {
                break;
            }
        }
    });

    // Frames from the client.
    let mut seq = client_seq;
    loop {
        let mut len_buf = [0u8; 2];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let mut frame = vec![0u8; u16::from_le_bytes(len_buf) as usize];
        if read_half.read_exact(&mut frame).await.is_err() {
            break;
        }

        let (nonce, next) = seq.advance().unwrap();
        seq = next;
        let plaintext = box_open(&frame, &nonce, &client_spk, &session_keys.secret_key)
            .expect("client frame must open on the expected counter");

        match Packet::parse(&plaintext).expect("client sent an unparseable packet") {
            Packet::SendingMsg(mp) => {
                inner.sent.lock().unwrap().push(mp.clone());
                let _ = to_client_tx.send(Packet::ServerAck {
                    sender: mp.sender,
                    msg_id: mp.msg_id,
                });
                // Relay to the recipient if it is connected.
                let conn = inner.conns.lock().unwrap().get(&mp.recipient).cloned();
                if let Some(conn) = conn {
                    let _ = conn.send(Packet::DeliveringMsg(mp));
                }
            }
            Packet::ClientAck { sender, msg_id } => {
                inner.acks.lock().unwrap().push((sender, msg_id));
            }
            Packet::Echo { counter } => {
                let _ = inner.echo_tx.send(counter);
            }
            other => panic!("unexpected packet from client: {other:?}"),
        }
    }

    inner.conns.lock().unwrap().remove(&username);
    Some(())
}

// ============================================================================
// Harness helpers
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn id(s: &str) -> PeerId {
    PeerId::new(s).unwrap()
}

async fn connect(
    server: &MockServer,
    name: &str,
    keys: &KeyPair,
    book: Arc<AddressBook>,
    directory: Arc<dyn Directory>,
) -> SessionHandle {
    let peer = id(name);
    server.register_client(peer, keys.public_key);
    let identity = Identity::new(peer, keys.secret_key);
    Session::open(identity, book, directory, server.config())
        .await
        .expect("session should open")
}

fn seed_book(entries: &[(&str, [u8; 32])]) -> Arc<AddressBook> {
    let book = AddressBook::new();
    for (name, key) in entries {
        book.add(Contact::new(id(name), *key));
    }
    Arc::new(book)
}

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_alice_bob_text_exchange() {
    init_logging();
    let server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let bob_keys = generate_keypair();

    let alice_book = seed_book(&[("BBBBBBBB", bob_keys.public_key)]);
    let bob_book = seed_book(&[("AAAAAAAA", alice_keys.public_key)]);

    let mut alice = connect(
        &server,
        "AAAAAAAA",
        &alice_keys,
        alice_book,
        StaticDirectory::empty(),
    )
    .await;
    let mut bob = connect(
        &server,
        "BBBBBBBB",
        &bob_keys,
        bob_book,
        StaticDirectory::empty(),
    )
    .await;

    // Alice to Bob.
    let hello = OutgoingMessage::text(id("BBBBBBBB"), "hello");
    let hello_id = hello.msg_id;
    alice.send(hello).await.unwrap();

    let received = timeout(RECV_TIMEOUT, bob.inbound.recv())
        .await
        .expect("bob should receive within the timeout")
        .expect("bob's receive channel should stay open")
        .expect("the message slot should be valid");

    assert_eq!(received.sender, id("AAAAAAAA"));
    assert_eq!(received.msg_id, hello_id);
    assert_eq!(
        received.body,
        MessageBody::Text {
            text: "hello".into()
        }
    );

    // Bob acked before the message was surfaced, so by now (plus socket
    // latency) the server must observe the ack.
    let mut acked = false;
    for _ in 0..50 {
        if server.acks().contains(&(id("AAAAAAAA"), hello_id)) {
            acked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(acked, "delivered message must be acknowledged");

    // Bob back to Alice.
    bob.send(OutgoingMessage::text(id("AAAAAAAA"), "hi"))
        .await
        .unwrap();

    let reply = timeout(RECV_TIMEOUT, alice.inbound.recv())
        .await
        .expect("alice should receive within the timeout")
        .unwrap()
        .unwrap();
    assert_eq!(reply.sender, id("BBBBBBBB"));
    assert_eq!(reply.body, MessageBody::Text { text: "hi".into() });
}

#[tokio::test]
async fn test_unknown_sender_is_resolved_and_cached() {
    init_logging();
    let server = MockServer::spawn().await;

    let bob_keys = generate_keypair();
    let charlie_keys = generate_keypair();

    // Bob has never heard of Charlie; only the directory knows the key.
    let bob_book = seed_book(&[]);
    let bob_directory = StaticDirectory::with(&[(id("CCCCCCCC"), charlie_keys.public_key)]);

    // Charlie knows Bob and sends first.
    let charlie_book = seed_book(&[("BBBBBBBB", bob_keys.public_key)]);

    let mut bob = connect(
        &server,
        "BBBBBBBB",
        &bob_keys,
        bob_book.clone(),
        bob_directory,
    )
    .await;
    let charlie = connect(
        &server,
        "CCCCCCCC",
        &charlie_keys,
        charlie_book,
        StaticDirectory::empty(),
    )
    .await;

    charlie
        .send(OutgoingMessage::text(id("BBBBBBBB"), "hoi"))
        .await
        .unwrap();

    let received = timeout(RECV_TIMEOUT, bob.inbound.recv())
        .await
        .expect("bob should receive within the timeout")
        .unwrap()
        .expect("message from a directory-resolved sender should decrypt");
    assert_eq!(received.sender, id("CCCCCCCC"));
    assert_eq!(received.body, MessageBody::Text { text: "hoi".into() });

    // The resolved key ended up in the address book.
    let cached = bob_book
        .get(&id("CCCCCCCC"))
        .expect("sender must be cached after resolution");
    assert_eq!(cached.public_key, charlie_keys.public_key);
}

#[tokio::test]
async fn test_duplicate_connection_terminates_session() {
    init_logging();
    let server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let mut alice = connect(
        &server,
        "AAAAAAAA",
        &alice_keys,
        seed_book(&[]),
        StaticDirectory::empty(),
    )
    .await;

    server.inject(&id("AAAAAAAA"), Packet::DuplicateConnection);

    let error = timeout(RECV_TIMEOUT, alice.errors.recv())
        .await
        .expect("a terminal error should arrive")
        .expect("error channel should not close before reporting");
    assert!(
        matches!(error, SessionError::DuplicateConnection),
        "expected the duplicate connection error, got {error:?}"
    );

    // The receive channel closes once the session is torn down.
    let closed = timeout(RECV_TIMEOUT, async {
        loop {
            if alice.inbound.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "receive channel must close");
}

#[tokio::test(start_paused = true)]
async fn test_echo_keepalive_cadence() {
    init_logging();
    let mut server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let _alice = connect(
        &server,
        "AAAAAAAA",
        &alice_keys,
        seed_book(&[]),
        StaticDirectory::empty(),
    )
    .await;

    // Three minutes pass: exactly one echo, counting up from zero.
    tokio::time::advance(Duration::from_secs(180)).await;
    assert_eq!(server.next_echo().await, 1);

    // The server reflects the counter; the next echo builds on it. The
    // short paused-clock sleep lets the reflection drain through the
    // loopback before the next tick fires.
    server.inject(&id("AAAAAAAA"), Packet::Echo { counter: 1 });
    tokio::time::sleep(Duration::from_millis(10)).await;

    tokio::time::advance(Duration::from_secs(180)).await;
    assert_eq!(server.next_echo().await, 2);
}

#[tokio::test]
async fn test_group_create_fans_out() {
    init_logging();
    let server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let bob_keys = generate_keypair();
    let charlie_keys = generate_keypair();

    let alice_book = seed_book(&[
        ("AAAAAAAA", alice_keys.public_key),
        ("BBBBBBBB", bob_keys.public_key),
        ("CCCCCCCC", charlie_keys.public_key),
    ]);

    let alice = connect(
        &server,
        "AAAAAAAA",
        &alice_keys,
        alice_book,
        StaticDirectory::empty(),
    )
    .await;

    let group = Group::new(
        id("AAAAAAAA"),
        "g",
        vec![id("AAAAAAAA"), id("BBBBBBBB"), id("CCCCCCCC")],
    );
    alice.create_group(&group).await.unwrap();

    // Six transport messages: one set-members and one set-name per member.
    let packets = timeout(RECV_TIMEOUT, async {
        loop {
            let packets = server.sent();
            if packets.len() >= 6 {
                break packets;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("group fan-out should reach the server");
    assert_eq!(packets.len(), 6);

    let keys_by_id: HashMap<PeerId, [u8; 32]> = [
        (id("AAAAAAAA"), alice_keys.secret_key),
        (id("BBBBBBBB"), bob_keys.secret_key),
        (id("CCCCCCCC"), charlie_keys.secret_key),
    ]
    .into();

    let mut recipients_members = Vec::new();
    let mut recipients_names = Vec::new();
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.sender, id("AAAAAAAA"));
        assert!(packet.flags.group_message, "group flag must be set");

        // Decrypt as the recipient would.
        let recipient_sk = keys_by_id[&packet.recipient];
        let plaintext = box_open(
            &packet.ciphertext,
            &packet.nonce,
            &alice_keys.public_key,
            &recipient_sk,
        )
        .expect("fan-out message must decrypt for its recipient");
        let body = MessageBody::decode(&plaintext).unwrap();

        match body {
            MessageBody::GroupSetMembers { group_id, members } => {
                assert!(i < 3, "set-members messages come first");
                assert_eq!(group_id, group.group_id);
                assert_eq!(members.len(), 3);
                recipients_members.push(packet.recipient);
            }
            MessageBody::GroupSetName { group_id, name } => {
                assert!(i >= 3, "set-name messages come second");
                assert_eq!(group_id, group.group_id);
                assert_eq!(name, "g");
                recipients_names.push(packet.recipient);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    // Every member got both messages.
    for member in &group.members {
        assert!(recipients_members.contains(member));
        assert!(recipients_names.contains(member));
    }
}

#[tokio::test]
async fn test_close_tears_down_session() {
    init_logging();
    let server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let mut alice = connect(
        &server,
        "AAAAAAAA",
        &alice_keys,
        seed_book(&[]),
        StaticDirectory::empty(),
    )
    .await;

    alice.close();

    // The writer stops, the connection unwinds and the receive channel
    // closes without the application doing anything else.
    let closed = timeout(RECV_TIMEOUT, async {
        while alice.inbound.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "receive channel must close after close()");
}

#[tokio::test]
async fn test_handshake_rejects_wrong_server_key() {
    init_logging();
    let server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let peer = id("AAAAAAAA");
    server.register_client(peer, alice_keys.public_key);

    // Pin a key the server does not hold.
    let mut config = server.config();
    config.server_public_key = generate_keypair().public_key;

    let result = Session::open(
        Identity::new(peer, alice_keys.secret_key),
        seed_book(&[]),
        StaticDirectory::empty(),
        config,
    )
    .await;

    assert!(
        matches!(result, Err(SessionError::Handshake(_))),
        "a server hello under a foreign key must not be accepted"
    );
}

#[tokio::test]
async fn test_typing_and_receipt_roundtrip() {
    init_logging();
    let server = MockServer::spawn().await;

    let alice_keys = generate_keypair();
    let bob_keys = generate_keypair();
    let alice = connect(
        &server,
        "AAAAAAAA",
        &alice_keys,
        seed_book(&[("BBBBBBBB", bob_keys.public_key)]),
        StaticDirectory::empty(),
    )
    .await;
    let mut bob = connect(
        &server,
        "BBBBBBBB",
        &bob_keys,
        seed_book(&[("AAAAAAAA", alice_keys.public_key)]),
        StaticDirectory::empty(),
    )
    .await;

    alice
        .send(OutgoingMessage::typing(id("BBBBBBBB"), true))
        .await
        .unwrap();
    alice
        .send(OutgoingMessage::delivery_receipt(
            id("BBBBBBBB"),
            ozone::messages::DeliveryStatus::Read,
            0xABCD,
        ))
        .await
        .unwrap();

    let first = timeout(RECV_TIMEOUT, bob.inbound.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.body, MessageBody::TypingNotification { active: true });

    let second = timeout(RECV_TIMEOUT, bob.inbound.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        second.body,
        MessageBody::DeliveryReceipt {
            status: ozone::messages::DeliveryStatus::Read,
            msg_id: 0xABCD,
        }
    );
}
