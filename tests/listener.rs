use bytes::{Bytes, BytesMut};
use mcauthproxy::{
    AuthMethod, Config, IdentityRegistry, OnlineAuth, ProxyListener, chat, codec,
    crypto::{self, Decryptor, Encryptor},
    protocol::{self, Direction, EncryptionResponse, Handshake, Packet, Phase},
};
use parking_lot::RwLock;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};

const LIMIT: Duration = Duration::from_secs(10);
const TAG: &str = "trash-auth";

fn config(backend_port: u16) -> Config {
    Config::from_json(&format!(
        r#"{{
            "motd": "trash",
            "max_players": 10,
            "backend_port": {backend_port},
            "offline_port": 1,
            "online_port": 2,
            "version": "1.18.1",
            "whitelist": [{{ "name": "bob", "token": "tok123" }}, {{ "name": "alice" }}]
        }}"#
    ))
    .unwrap()
}

async fn start(mut listener: ProxyListener) -> SocketAddr {
    let addr = listener.bind().await.unwrap();
    tokio::spawn(async move { listener.run().await });
    addr
}

async fn start_offline(config: Config, registry: IdentityRegistry) -> SocketAddr {
    start(ProxyListener::new("127.0.0.1:0", AuthMethod::Offline, Arc::new(RwLock::new(config)), registry)).await
}

/// Peer is the far end of one proxy connection: a player or the backend
struct Peer {
    stream: TcpStream,
    buf: BytesMut,
    threshold: i32,
    cipher: Option<(Encryptor, Decryptor)>,
}

impl Peer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            threshold: -1,
            cipher: None,
        }
    }

    async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }

    async fn send(&mut self, packet: &Packet) {
        let mut wire = BytesMut::new();
        codec::encode_frame(&mut wire, &packet.encode(), self.threshold).unwrap();
        if let Some((encryptor, _)) = self.cipher.as_mut() {
            crypto::encrypt(encryptor, &mut wire);
        }
        self.stream.write_all(&wire).await.unwrap();
    }

    /// recv reads one packet; None once the other side has closed
    async fn recv(&mut self, direction: Direction, phase: Phase) -> Option<Packet> {
        loop {
            if let Some(body) = codec::try_decode_frame(&mut self.buf, self.threshold >= 0).unwrap() {
                return Some(Packet::decode(body, direction, phase).unwrap());
            }
            let start = self.buf.len();
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
            if let Some((_, decryptor)) = self.cipher.as_mut() {
                crypto::decrypt(decryptor, &mut self.buf[start..]);
            }
        }
    }

    /// login_reply reads login packets until the proxy lets the player in or
    /// refuses it, following any compression it announces on the way.
    /// Returns the announced threshold and the final packet.
    async fn login_reply(&mut self) -> (Option<i32>, Packet) {
        let mut announced = None;
        loop {
            match self.recv(Direction::Clientbound, Phase::Login).await.unwrap() {
                Packet::SetCompression { threshold } => {
                    assert_eq!(announced, None, "compression announced twice");
                    announced = Some(threshold);
                    self.threshold = threshold;
                }
                other => return (announced, other),
            }
        }
    }

    async fn play(&mut self) -> Option<Packet> {
        self.recv(Direction::Clientbound, Phase::Play).await
    }
}

fn handshake(port: u16, next: Phase) -> Packet {
    Handshake {
        protocol: protocol::DEFAULT_PROTOCOL,
        host: "localhost".into(),
        port,
        next,
    }
    .to_packet()
}

fn string_body(packet: Packet, expected_id: i32) -> String {
    match packet {
        Packet::Raw { id, mut body } if id == expected_id => codec::read_string(&mut body, codec::MAX_STRING_CHARS).unwrap(),
        other => panic!("expected packet {expected_id:#x}, got {other:?}"),
    }
}

fn notice(text: &str) -> Option<Packet> {
    Some(chat::system_packet(TAG, text))
}

fn chat_line(message: impl Into<String>) -> Packet {
    Packet::ClientChat { message: message.into() }
}

/// Backend plays an offline-mode server for one player
struct Backend {
    port: u16,
    task: JoinHandle<Vec<Packet>>,
}

impl Backend {
    /// start accepts one login for `name`, turning compression on at
    /// `threshold` unless it is negative. It sends `greeting`, collects
    /// `lines` Play packets and hangs up.
    async fn start(name: &'static str, threshold: i32, greeting: Packet, lines: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peer = Peer::new(stream);

            match peer.recv(Direction::Serverbound, Phase::Handshake).await.unwrap() {
                Packet::Raw { id: protocol::HANDSHAKE, body } => {
                    assert_eq!(Handshake::parse(body).unwrap().next, Phase::Login);
                }
                other => panic!("expected handshake, got {other:?}"),
            }
            let start = peer.recv(Direction::Serverbound, Phase::Login).await.unwrap();
            assert_eq!(start, protocol::login_start(name));

            if threshold >= 0 {
                peer.send(&Packet::SetCompression { threshold }).await;
                peer.threshold = threshold;
            }
            peer.send(&protocol::login_success(protocol::offline_uuid(name), name)).await;
            peer.send(&greeting).await;

            let mut received = Vec::new();
            while received.len() < lines {
                received.push(peer.recv(Direction::Serverbound, Phase::Play).await.unwrap());
            }
            peer.stream.shutdown().await.unwrap();
            received
        });

        Self { port, task }
    }

    async fn received(self) -> Vec<Packet> {
        self.task.await.unwrap()
    }
}

/// A packet large enough to be compressed at the thresholds used here
fn big_greeting() -> Packet {
    Packet::Raw {
        id: 0x26,
        body: Bytes::from(vec![7u8; 600]),
    }
}

#[tokio::test]
async fn status_ping() {
    let registry = IdentityRegistry::new();
    registry.insert("bob", AuthMethod::Offline).unwrap();
    let addr = start_offline(config(1), registry).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Status)).await;
        client.send(&Packet::Raw { id: protocol::STATUS_REQUEST, body: Bytes::new() }).await;

        let response = client.recv(Direction::Clientbound, Phase::Status).await.unwrap();
        let status: Value = serde_json::from_str(&string_body(response, protocol::STATUS_RESPONSE)).unwrap();
        assert_eq!(status["description"]["text"], "trash (offline auth)");
        assert_eq!(status["players"]["online"], 1);
        assert_eq!(status["players"]["max"], 10);
        assert_eq!(status["players"]["sample"][0]["name"], "bob");

        let ping = Packet::Raw {
            id: protocol::STATUS_PING,
            body: Bytes::copy_from_slice(&42i64.to_be_bytes()),
        };
        client.send(&ping).await;
        let pong = client.recv(Direction::Clientbound, Phase::Status).await.unwrap();
        assert_eq!(pong, protocol::status_pong(42));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unknown_token_is_disconnected() {
    let registry = IdentityRegistry::new();
    let addr = start_offline(config(1), registry.clone()).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("nobody")).await;

        let (announced, reply) = client.login_reply().await;
        assert_eq!(announced, None);
        assert_eq!(string_body(reply, protocol::LOGIN_DISCONNECT), chat::reason("auth failed"));
        assert!(client.recv(Direction::Clientbound, Phase::Login).await.is_none());
    })
    .await
    .unwrap();

    assert!(registry.is_empty());
}

#[tokio::test]
async fn online_login_without_auth_is_refused() {
    let listener = ProxyListener::new(
        "127.0.0.1:0",
        AuthMethod::Online,
        Arc::new(RwLock::new(config(1))),
        IdentityRegistry::new(),
    );
    let addr = start(listener).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("alice")).await;

        let (_, reply) = client.login_reply().await;
        let reason = string_body(reply, protocol::LOGIN_DISCONNECT);
        assert!(chat::plain_text(&reason).contains("use a token"));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn token_login_is_relayed_to_uncompressed_backend() {
    let backend = Backend::start("bob", -1, Packet::Raw { id: 0x26, body: Bytes::from_static(b"\x01\x02") }, 2).await;
    let registry = IdentityRegistry::new();
    let addr = start_offline(config(backend.port), registry.clone()).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("tok123")).await;

        let (announced, success) = client.login_reply().await;
        assert_eq!(announced, None);
        assert_eq!(success, protocol::login_success(protocol::offline_uuid("tok123"), "tok123"));

        assert_eq!(client.play().await, notice("offline auth successful"));
        assert_eq!(client.play().await, notice("you have been connected as \"bob\""));
        assert_eq!(
            client.play().await,
            Some(Packet::Raw { id: 0x26, body: Bytes::from_static(b"\x01\x02") })
        );

        client.send(&chat_line("@@info bob")).await;
        assert_eq!(client.play().await, notice("auth method: offline"));

        // a long line needs no compression on either leg
        client.send(&chat_line("y".repeat(256))).await;
        client.send(&chat_line("hello")).await;

        let disconnect = client.play().await.unwrap();
        assert_eq!(string_body(disconnect, protocol::PLAY_DISCONNECT), chat::reason("End"));
    })
    .await
    .unwrap();

    assert_eq!(backend.received().await, vec![chat_line("y".repeat(256)), chat_line("hello")]);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn both_legs_compressed() {
    let backend = Backend::start("bob", 256, big_greeting(), 2).await;
    let addr = start_offline(config(backend.port), IdentityRegistry::new()).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("tok123")).await;

        // The login success is already in the compressed format
        let (announced, success) = client.login_reply().await;
        assert_eq!(announced, Some(256));
        assert!(matches!(success, Packet::Raw { id: protocol::LOGIN_SUCCESS, .. }));

        assert_eq!(client.play().await, notice("offline auth successful"));
        assert_eq!(client.play().await, notice("you have been connected as \"bob\""));
        assert_eq!(client.play().await, Some(big_greeting()));

        client.send(&chat_line("z".repeat(256))).await;
        client.send(&chat_line("hello")).await;
        let disconnect = client.play().await.unwrap();
        assert_eq!(string_body(disconnect, protocol::PLAY_DISCONNECT), chat::reason("End"));
    })
    .await
    .unwrap();

    assert_eq!(backend.received().await, vec![chat_line("z".repeat(256)), chat_line("hello")]);
}

#[tokio::test]
async fn compressed_command_is_intercepted() {
    let backend = Backend::start("bob", 256, big_greeting(), 1).await;
    let addr = start_offline(config(backend.port), IdentityRegistry::new()).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("tok123")).await;
        assert_eq!(client.login_reply().await.0, Some(256));
        for _ in 0..3 {
            client.play().await.unwrap();
        }

        // 256 characters: the frame is deflated on the wire
        let command = format!("@@bogus {}", "x".repeat(248));
        assert_eq!(command.len(), 256);
        client.send(&chat_line(command)).await;
        assert_eq!(client.play().await, notice("unknown command"));

        client.send(&chat_line("hello")).await;
        client.play().await.unwrap();
    })
    .await
    .unwrap();

    assert_eq!(backend.received().await, vec![chat_line("hello")]);
}

#[tokio::test]
async fn client_follows_backend_threshold() {
    let backend = Backend::start("bob", 64, big_greeting(), 1).await;
    let addr = start_offline(config(backend.port), IdentityRegistry::new()).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("tok123")).await;
        assert_eq!(client.login_reply().await.0, Some(64));

        assert_eq!(client.play().await, notice("offline auth successful"));
        assert_eq!(client.play().await, notice("you have been connected as \"bob\""));
        assert_eq!(client.play().await, Some(big_greeting()));

        // above 64 but below the vanilla default
        client.send(&chat_line("w".repeat(100))).await;
        client.play().await.unwrap();
    })
    .await
    .unwrap();

    assert_eq!(backend.received().await, vec![chat_line("w".repeat(100))]);
}

/// session_server answers one hasJoined request with `response` and
/// returns the request it saw
async fn session_server(response: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|window| window == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "request cut short");
            request.extend_from_slice(&chunk[..n]);
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8(request).unwrap()
    });

    (url, task)
}

fn joined_response(name: &str) -> String {
    let body = format!(r#"{{"id":"069a79f444e94726a5befca90e38aaf5","name":"{name}","properties":[]}}"#);
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn start_online(session_url: String, config: Config, registry: IdentityRegistry) -> SocketAddr {
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let auth = Arc::new(OnlineAuth::with_http(session_url, http).unwrap());
    let listener = ProxyListener::new("127.0.0.1:0", AuthMethod::Online, Arc::new(RwLock::new(config)), registry)
        .with_online_auth(auth);
    start(listener).await
}

/// encrypt_login answers the proxy's encryption request the way a vanilla
/// client does and returns the server hash it would present
async fn encrypt_login(client: &mut Peer) -> String {
    let request = client.recv(Direction::Clientbound, Phase::Login).await.unwrap();
    let Packet::Raw { id: protocol::ENCRYPTION_REQUEST, mut body } = request else {
        panic!("expected encryption request, got {request:?}");
    };
    let server_id = codec::read_string(&mut body, 20).unwrap();
    let public_der = codec::read_bytes(&mut body, 1024).unwrap();
    let verify_token = codec::read_bytes(&mut body, 256).unwrap();
    assert_eq!(server_id, "");

    let key = RsaPublicKey::from_public_key_der(&public_der).unwrap();
    let secret = [0x42u8; crypto::SECRET_LEN];
    let mut rng = rand::thread_rng();
    let response = EncryptionResponse {
        shared_secret: key.encrypt(&mut rng, Pkcs1v15Encrypt, &secret).unwrap(),
        verify_token: key.encrypt(&mut rng, Pkcs1v15Encrypt, &verify_token).unwrap(),
    };
    client.send(&response.to_packet()).await;
    client.cipher = Some(crypto::ciphers(&secret).unwrap());

    crypto::server_hash(&server_id, &secret, &public_der)
}

#[tokio::test]
async fn online_login_is_verified_and_relayed() {
    let backend = Backend::start("alice", 256, big_greeting(), 1).await;
    let (session_url, session) = session_server(joined_response("alice")).await;
    let registry = IdentityRegistry::new();
    let addr = start_online(session_url, config(backend.port), registry.clone()).await;

    let hash = timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("alice")).await;
        let hash = encrypt_login(&mut client).await;

        let (announced, success) = client.login_reply().await;
        assert_eq!(announced, Some(256));
        let Packet::Raw { id: protocol::LOGIN_SUCCESS, mut body } = success else {
            panic!("expected login success, got {success:?}");
        };
        assert_eq!(
            codec::read_uuid(&mut body).unwrap().to_string(),
            "069a79f4-44e9-4726-a5be-fca90e38aaf5"
        );
        assert_eq!(codec::read_string(&mut body, 16).unwrap(), "alice");

        assert_eq!(client.play().await, notice("online auth successful"));
        assert_eq!(client.play().await, notice("you have been connected as \"alice\""));
        assert_eq!(client.play().await, Some(big_greeting()));

        client.send(&chat_line("@@info alice")).await;
        assert_eq!(client.play().await, notice("auth method: online"));
        client.send(&chat_line("hello")).await;
        client.play().await.unwrap();
        hash
    })
    .await
    .unwrap();

    let request = session.await.unwrap();
    assert!(request.starts_with("GET /session/minecraft/hasJoined?"));
    assert!(request.contains("username=alice"));
    assert!(request.contains(&format!("serverId={hash}")));

    assert_eq!(backend.received().await, vec![chat_line("hello")]);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn online_login_not_joined_is_refused() {
    let response = "HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n".to_string();
    let (session_url, session) = session_server(response).await;
    let registry = IdentityRegistry::new();
    let addr = start_online(session_url, config(1), registry.clone()).await;

    timeout(LIMIT, async {
        let mut client = Peer::connect(addr).await;
        client.send(&handshake(addr.port(), Phase::Login)).await;
        client.send(&protocol::login_start("alice")).await;
        encrypt_login(&mut client).await;

        // the refusal is already encrypted
        let (_, reply) = client.login_reply().await;
        assert_eq!(
            string_body(reply, protocol::LOGIN_DISCONNECT),
            chat::reason("failed to verify username")
        );
    })
    .await
    .unwrap();

    session.await.unwrap();
    assert!(registry.is_empty());
}
