//! A small protocol engine over TCP.
//!
//! It speaks enough of the protocol to log players in (encrypted or not), to
//! log in to an offline-mode backend, and to carry packets between the two.
//! Every frame is inflated on the way in and framed again under the
//! threshold of the leg it is written to, so the two legs never have to
//! agree on compression.
//!
//! A player's login is only completed once the backend accepted the
//! canonical name. Until then its leg holds back Play packets, which lets
//! the backend's compression threshold reach the player while it is still
//! in Login, the only phase where the protocol can announce it.

use crate::{
    chat,
    codec::{self, MAX_STRING_CHARS},
    crypto::{self, Decryptor, Encryptor},
    protocol::{self, Direction, Handshake, Packet, Phase, SharedPhase},
    session::{Connector, EndReason, EventSender, Leg, LegEvent, Side},
};
use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use std::sync::{
    Arc,
    atomic::{AtomicI32, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Longest name a client may log in with
const MAX_USERNAME_CHARS: usize = 16;

/// WriteCommand is queued to a leg's writer task. Commands run strictly in
/// queue order.
#[derive(Debug)]
enum WriteCommand {
    Packet(Packet),
    Threshold(i32),
    CompleteLogin,
    End(EndReason),
}

/// LoginProfile is who a player is told it logged in as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginProfile {
    pub uuid: Uuid,
    pub name: String,
}

impl LoginProfile {
    /// offline is the profile an offline-mode server would give `name`
    pub fn offline(name: &str) -> Self {
        Self {
            uuid: protocol::offline_uuid(name),
            name: name.to_string(),
        }
    }
}

/// TcpLeg is a leg backed by a TCP connection and two tasks: one reading
/// frames into events, one writing queued commands
#[derive(Debug)]
pub struct TcpLeg {
    phase: SharedPhase,
    commands: mpsc::UnboundedSender<WriteCommand>,
}

/// TcpLeg implementation block
impl TcpLeg {
    /// client wraps a player connection that sent its login start (and, on
    /// the online listener, finished encryption). The player is told it is
    /// logged in as `profile` once [`Leg::complete_login`] is called.
    pub fn client(login: LoginStream, profile: LoginProfile, events: EventSender) -> Self {
        let (task, leg, commands) = LegTask::new(Side::Client, Phase::Login, events);
        let LoginStream { stream, buf, cipher } = login;
        tokio::spawn(task.run(stream, buf, cipher, Some(profile), commands));
        leg
    }

    /// connect starts logging in to the backend as `username`. Returns at
    /// once; the outcome is reported on the session channel.
    pub fn connect(target: BackendTarget, username: &str, events: EventSender) -> Self {
        let (task, leg, commands) = LegTask::new(Side::Backend, Phase::Handshake, events);
        let username = username.to_string();

        tokio::spawn(async move {
            // Connect and start the login
            let stream = match task.open_backend(&target, &username).await {
                Ok(stream) => stream,
                Err(e) => {
                    task.report(LegEvent::Error(e));
                    return;
                }
            };

            // Pump until either side stops
            task.run(stream, BytesMut::new(), None, None, commands).await;
        });

        leg
    }
}

impl Leg for TcpLeg {
    fn phase(&self) -> Phase {
        self.phase.load()
    }

    fn send(&mut self, packet: Packet) -> Result<()> {
        self.commands
            .send(WriteCommand::Packet(packet))
            .map_err(|_| anyhow!("connection is closed"))
    }

    fn set_compression_threshold(&mut self, threshold: i32) {
        if self.commands.send(WriteCommand::Threshold(threshold)).is_err() {
            debug!(threshold, "connection is closed, threshold not applied");
        }
    }

    fn complete_login(&mut self) {
        // Everything queued from here on goes out after the login success
        self.phase.store(Phase::Play);
        if self.commands.send(WriteCommand::CompleteLogin).is_err() {
            debug!("connection is closed, login not completed");
        }
    }

    fn end(&mut self, reason: EndReason) {
        if self.commands.send(WriteCommand::End(reason)).is_err() {
            debug!("connection is already closed");
        }
    }
}

/// BackendTarget is where backend legs connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    pub protocol: i32,
}

impl BackendTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// BackendConnector opens TCP backend legs reporting to one session
pub struct BackendConnector {
    target: BackendTarget,
    events: EventSender,
}

impl BackendConnector {
    pub fn new(target: BackendTarget, events: EventSender) -> Self {
        Self { target, events }
    }
}

impl Connector<TcpLeg> for BackendConnector {
    fn open(&mut self, username: &str) -> TcpLeg {
        TcpLeg::connect(self.target.clone(), username, self.events.clone())
    }
}

/// LoginStep is what the backend's reader does with a login packet
enum LoginStep {
    Pass,
    Consumed,
    LoggedIn,
}

/// FrameWriter frames, compresses and encrypts outbound packets
struct FrameWriter {
    writer: OwnedWriteHalf,
    encryptor: Option<Encryptor>,
    threshold: i32,
    buf: BytesMut,
}

impl FrameWriter {
    async fn write(&mut self, packet: &Packet) -> Result<()> {
        self.buf.clear();
        codec::encode_frame(&mut self.buf, &packet.encode(), self.threshold)?;
        if let Some(encryptor) = self.encryptor.as_mut() {
            crypto::encrypt(encryptor, &mut self.buf);
        }
        self.writer.write_all(&self.buf).await?;
        Ok(())
    }
}

/// LegTask is the state shared by a leg's reader and writer
struct LegTask {
    side: Side,
    phase: SharedPhase,
    /// Threshold inbound frames are read under
    threshold: Arc<AtomicI32>,
    commands: mpsc::UnboundedSender<WriteCommand>,
    events: EventSender,
}

impl LegTask {
    fn new(
        side: Side,
        phase: Phase,
        events: EventSender,
    ) -> (Self, TcpLeg, mpsc::UnboundedReceiver<WriteCommand>) {
        let phase = SharedPhase::new(phase);
        let (tx, rx) = mpsc::unbounded_channel();
        let leg = TcpLeg {
            phase: phase.clone(),
            commands: tx.clone(),
        };
        let task = Self {
            side,
            phase,
            threshold: Arc::new(AtomicI32::new(-1)),
            commands: tx,
            events,
        };
        (task, leg, rx)
    }

    fn report(&self, event: LegEvent) {
        // A session that is gone no longer cares
        let _ = self.events.send((self.side, event));
    }

    /// open_backend connects and sends the handshake and login start
    async fn open_backend(&self, target: &BackendTarget, username: &str) -> Result<TcpStream> {
        let addr = target.addr();
        let mut stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to backend {addr}"))?;
        stream.set_nodelay(true)?;
        self.report(LegEvent::Connected);

        // Handshake, then log in under the canonical name
        let handshake = Handshake {
            protocol: target.protocol,
            host: target.host.clone(),
            port: target.port,
            next: Phase::Login,
        };
        write_packet(&mut stream, &handshake.to_packet()).await?;
        write_packet(&mut stream, &protocol::login_start(username)).await?;
        self.phase.store(Phase::Login);

        debug!(backend = %addr, user = %username, "backend login started");
        Ok(stream)
    }

    /// run pumps the connection until either direction stops, then reports
    /// exactly one End or Error
    async fn run(
        self,
        stream: TcpStream,
        buffered: BytesMut,
        cipher: Option<(Encryptor, Decryptor)>,
        profile: Option<LoginProfile>,
        commands: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        let (reader, writer) = stream.into_split();
        let (encryptor, decryptor) = cipher.unzip();
        let writer = FrameWriter {
            writer,
            encryptor,
            threshold: -1,
            buf: BytesMut::new(),
        };

        let outcome = select! {
            read = self.read_loop(reader, buffered, decryptor) => read,
            write = self.write_loop(writer, profile, commands) => write,
        };

        match outcome {
            Ok(()) => self.report(LegEvent::End),
            Err(e) => self.report(LegEvent::Error(e)),
        }
    }

    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        mut buf: BytesMut,
        mut decryptor: Option<Decryptor>,
    ) -> Result<()> {
        let direction = match self.side {
            Side::Client => Direction::Serverbound,
            Side::Backend => Direction::Clientbound,
        };

        loop {
            // Drain whole frames, each read under the threshold in force
            while let Some(body) = codec::try_decode_frame(&mut buf, self.threshold.load(Ordering::Acquire) >= 0)? {
                let phase = self.phase.load();
                let packet = Packet::decode(body, direction, phase)?;

                if self.side == Side::Backend && phase == Phase::Login {
                    match self.backend_login(&packet)? {
                        LoginStep::Pass => {}
                        LoginStep::Consumed => continue,
                        LoginStep::LoggedIn => {
                            if self.events.send((self.side, LegEvent::LoggedIn)).is_err() {
                                return Ok(());
                            }
                            continue;
                        }
                    }
                }

                if self.events.send((self.side, LegEvent::Packet { packet, phase })).is_err() {
                    return Ok(());
                }
            }

            // Read more, decrypting only what just arrived
            let start = buf.len();
            if reader.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
            if let Some(decryptor) = decryptor.as_mut() {
                crypto::decrypt(decryptor, &mut buf[start..]);
            }
        }
    }

    /// backend_login follows the backend through its login phase
    fn backend_login(&self, packet: &Packet) -> Result<LoginStep> {
        match packet {
            Packet::SetCompression { threshold } => {
                // Frames after this one are in the compressed format
                self.threshold.store(*threshold, Ordering::Release);
                if self.commands.send(WriteCommand::Threshold(*threshold)).is_err() {
                    debug!(threshold, "backend writer is gone");
                }
                Ok(LoginStep::Pass)
            }
            Packet::Raw {
                id: protocol::LOGIN_SUCCESS,
                ..
            } => {
                self.phase.store(Phase::Play);
                debug!("backend login complete");
                Ok(LoginStep::LoggedIn)
            }
            Packet::Raw {
                id: protocol::LOGIN_DISCONNECT,
                body,
            } => {
                let mut body = body.clone();
                let reason = codec::read_string(&mut body, MAX_STRING_CHARS)?;
                bail!("backend refused login: {}", chat::plain_text(&reason))
            }
            Packet::Raw {
                id: protocol::ENCRYPTION_REQUEST,
                ..
            } => bail!("backend requested encryption; it must run in offline mode"),
            Packet::Raw {
                id: protocol::LOGIN_PLUGIN_REQUEST,
                body,
            } => {
                let mut body = body.clone();
                let message_id = codec::read_varint(&mut body)?;
                let response = protocol::login_plugin_response(message_id);
                if self.commands.send(WriteCommand::Packet(response)).is_err() {
                    debug!(message_id, "backend writer is gone");
                }
                Ok(LoginStep::Consumed)
            }
            _ => Ok(LoginStep::Pass),
        }
    }

    async fn write_loop(
        &self,
        mut out: FrameWriter,
        profile: Option<LoginProfile>,
        mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    ) -> Result<()> {
        // A player hears nothing but login packets until it joined
        let mut joined = self.side == Side::Backend;
        let mut held = Vec::new();

        while let Some(command) = commands.recv().await {
            match command {
                WriteCommand::Packet(packet) if joined => out.write(&packet).await?,
                WriteCommand::Packet(packet) => held.push(packet),
                WriteCommand::Threshold(value) => match self.side {
                    Side::Backend => {
                        debug!(threshold = value, "backend compression threshold set");
                        out.threshold = value;
                    }
                    Side::Client if !joined => {
                        // Announce under the old framing, then switch both ways
                        out.write(&Packet::SetCompression { threshold: value }).await?;
                        out.threshold = value;
                        self.threshold.store(value, Ordering::Release);
                        debug!(threshold = value, "client compression threshold set");
                    }
                    Side::Client => {
                        debug!(threshold = value, kept = out.threshold, "client already joined, threshold kept");
                    }
                },
                WriteCommand::CompleteLogin => {
                    if joined {
                        continue;
                    }
                    if let Some(profile) = &profile {
                        out.write(&protocol::login_success(profile.uuid, &profile.name)).await?;
                        info!(user = %profile.name, "client login complete");
                    }
                    joined = true;

                    // Flush what the session queued meanwhile
                    for packet in held.drain(..) {
                        out.write(&packet).await?;
                    }
                }
                WriteCommand::End(reason) => {
                    if self.side == Side::Client {
                        let packet = disconnect_packet(joined, &reason);
                        // The peer may already be gone
                        let _ = out.write(&packet).await;
                    }
                    let _ = out.writer.shutdown().await;
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

fn disconnect_packet(joined: bool, reason: &EndReason) -> Packet {
    let reason = chat::reason(reason.message());
    if joined {
        protocol::play_disconnect(&reason)
    } else {
        protocol::login_disconnect(&reason)
    }
}

async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::new();
    codec::encode_frame(&mut buf, &packet.encode(), -1)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Incoming is what a new connection asked for in its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Status,
    Login { protocol: i32, username: String },
}

/// LoginStream is a player connection before it becomes a leg: handshake,
/// status, login start and the optional encryption exchange. Nothing is
/// compressed at this point.
pub struct LoginStream {
    stream: TcpStream,
    buf: BytesMut,
    cipher: Option<(Encryptor, Decryptor)>,
}

/// LoginStream implementation block
impl LoginStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            cipher: None,
        }
    }

    /// read reads one packet. Returns None if the peer closed cleanly
    /// between packets.
    pub async fn read(&mut self, phase: Phase) -> Result<Option<Packet>> {
        loop {
            if let Some(body) = codec::try_decode_frame(&mut self.buf, false)? {
                return Ok(Some(Packet::decode(body, Direction::Serverbound, phase)?));
            }

            let start = self.buf.len();
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid-packet during {phase:?}");
            }
            if let Some((_, decryptor)) = self.cipher.as_mut() {
                crypto::decrypt(decryptor, &mut self.buf[start..]);
            }
        }
    }

    pub async fn write(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = BytesMut::new();
        codec::encode_frame(&mut buf, &packet.encode(), -1)?;
        if let Some((encryptor, _)) = self.cipher.as_mut() {
            crypto::encrypt(encryptor, &mut buf);
        }
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// enable_encryption switches both directions to the shared secret
    pub fn enable_encryption(&mut self, secret: &[u8]) -> Result<()> {
        if self.cipher.is_some() {
            bail!("encryption is already enabled");
        }
        let (encryptor, mut decryptor) = crypto::ciphers(secret)?;

        // Bytes read past the response were sent encrypted
        crypto::decrypt(&mut decryptor, &mut self.buf[..]);
        self.cipher = Some((encryptor, decryptor));
        Ok(())
    }

    /// accept_handshake reads the handshake and, for logins, the login start
    pub async fn accept_handshake(&mut self) -> Result<Incoming> {
        let handshake = match self.read(Phase::Handshake).await? {
            Some(Packet::Raw {
                id: protocol::HANDSHAKE,
                body,
            }) => Handshake::parse(body)?,
            Some(other) => bail!("expected handshake, got {} packet", other.name()),
            None => bail!("connection closed before handshake"),
        };

        if handshake.next == Phase::Status {
            return Ok(Incoming::Status);
        }

        match self.read(Phase::Login).await? {
            Some(Packet::Raw {
                id: protocol::LOGIN_START,
                mut body,
            }) => Ok(Incoming::Login {
                protocol: handshake.protocol,
                username: codec::read_string(&mut body, MAX_USERNAME_CHARS)?,
            }),
            Some(other) => bail!("expected login start, got {} packet", other.name()),
            None => bail!("connection closed before login start"),
        }
    }

    /// serve_status answers a status request and the ping that may follow
    pub async fn serve_status(&mut self, response: &str) -> Result<()> {
        loop {
            match self.read(Phase::Status).await? {
                Some(Packet::Raw {
                    id: protocol::STATUS_REQUEST,
                    ..
                }) => {
                    self.write(&protocol::status_response(response)).await?;
                }
                Some(Packet::Raw {
                    id: protocol::STATUS_PING,
                    mut body,
                }) => {
                    let payload = codec::read_i64(&mut body)?;
                    self.write(&protocol::status_pong(payload)).await?;
                    return Ok(());
                }
                Some(other) => bail!("unexpected {} packet during status", other.name()),
                None => return Ok(()),
            }
        }
    }

    /// refuse disconnects a player that is still logging in
    pub async fn refuse(mut self, reason: &str) -> Result<()> {
        self.write(&protocol::login_disconnect(&chat::reason(reason))).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
