use crate::codec::{self, CodecError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use uuid::Uuid;

/// Protocol version the built-in engine speaks (1.18.1)
pub const DEFAULT_PROTOCOL: i32 = 757;

// Packet ids for protocol 757, grouped by phase and direction
pub const HANDSHAKE: i32 = 0x00;

pub const STATUS_REQUEST: i32 = 0x00;
pub const STATUS_PING: i32 = 0x01;
pub const STATUS_RESPONSE: i32 = 0x00;
pub const STATUS_PONG: i32 = 0x01;

pub const LOGIN_START: i32 = 0x00;
pub const LOGIN_PLUGIN_RESPONSE: i32 = 0x02;
pub const LOGIN_DISCONNECT: i32 = 0x00;
pub const ENCRYPTION_REQUEST: i32 = 0x01;
pub const ENCRYPTION_RESPONSE: i32 = 0x01;
pub const LOGIN_SUCCESS: i32 = 0x02;
pub const SET_COMPRESSION: i32 = 0x03;
pub const LOGIN_PLUGIN_REQUEST: i32 = 0x04;

pub const SERVERBOUND_CHAT: i32 = 0x03;
pub const CLIENTBOUND_CHAT: i32 = 0x0f;
pub const PLAY_DISCONNECT: i32 = 0x1a;

/// Phase represents the protocol state a connection is in
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake = 0,
    Status = 1,
    Login = 2,
    Play = 3,
}

/// Phase implementation block
impl Phase {
    /// from_byte converts a byte to its related phase
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Phase::Handshake),
            1 => Some(Phase::Status),
            2 => Some(Phase::Login),
            3 => Some(Phase::Play),
            _ => None,
        }
    }
}

/// SharedPhase lets a leg's reader task move the phase forward while the
/// session reads it from another task
#[derive(Debug, Clone)]
pub struct SharedPhase(Arc<AtomicU8>);

impl SharedPhase {
    pub fn new(phase: Phase) -> Self {
        Self(Arc::new(AtomicU8::new(phase as u8)))
    }

    pub fn load(&self) -> Phase {
        Phase::from_byte(self.0.load(Ordering::Acquire)).unwrap_or(Phase::Handshake)
    }

    pub fn store(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// Direction a packet travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Serverbound,
    Clientbound,
}

/// Packet is a decoded packet.
///
/// Only the packets the proxy acts on are decoded; everything else is kept as
/// raw bytes so it can be forwarded without loss. Frames are always inflated
/// before they get here.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Chat typed by the player
    ClientChat { message: String },
    /// Chat shown to the player; `message` is a JSON chat component
    ServerChat {
        message: String,
        position: u8,
        sender: Uuid,
    },
    SetCompression { threshold: i32 },
    Raw { id: i32, body: Bytes },
}

/// Packet implementation block
impl Packet {
    /// decode turns a frame body into a packet, given where it travels and
    /// the phase its leg was in when it arrived
    pub fn decode(mut body: Bytes, direction: Direction, phase: Phase) -> Result<Packet, CodecError> {
        let id = codec::read_varint(&mut body)?;
        let untouched = body.clone();

        let packet = match (direction, phase, id) {
            (Direction::Serverbound, Phase::Play, SERVERBOUND_CHAT) => Packet::ClientChat {
                message: codec::read_string(&mut body, 256)?,
            },
            (Direction::Clientbound, Phase::Play, CLIENTBOUND_CHAT) => Packet::ServerChat {
                message: codec::read_string(&mut body, codec::MAX_STRING_CHARS * 8)?,
                position: codec::read_u8(&mut body)?,
                sender: codec::read_uuid(&mut body)?,
            },
            (Direction::Clientbound, Phase::Login, SET_COMPRESSION) => Packet::SetCompression {
                threshold: codec::read_varint(&mut body)?,
            },
            _ => return Ok(Packet::Raw { id, body }),
        };

        // Anything we don't fully understand is forwarded untouched
        if body.has_remaining() {
            return Ok(Packet::Raw {
                id,
                body: untouched,
            });
        }
        Ok(packet)
    }

    /// encode turns the packet back into a frame body. ClientChat and
    /// ServerChat are only meaningful in Play, SetCompression only in Login.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Packet::ClientChat { message } => {
                codec::write_varint(&mut buf, SERVERBOUND_CHAT);
                codec::write_string(&mut buf, message);
            }
            Packet::ServerChat {
                message,
                position,
                sender,
            } => {
                codec::write_varint(&mut buf, CLIENTBOUND_CHAT);
                codec::write_string(&mut buf, message);
                buf.put_u8(*position);
                codec::write_uuid(&mut buf, *sender);
            }
            Packet::SetCompression { threshold } => {
                codec::write_varint(&mut buf, SET_COMPRESSION);
                codec::write_varint(&mut buf, *threshold);
            }
            Packet::Raw { id, body } => {
                codec::write_varint(&mut buf, *id);
                buf.put_slice(body);
            }
        }
        buf.freeze()
    }

    /// name is a short label used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ClientChat { .. } | Packet::ServerChat { .. } => "chat",
            Packet::SetCompression { .. } => "set_compression",
            Packet::Raw { .. } => "raw",
        }
    }
}

/// Handshake holds the fields of the first packet a client sends
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub protocol: i32,
    pub host: String,
    pub port: u16,
    pub next: Phase,
}

/// Handshake implementation block
impl Handshake {
    /// parse reads a handshake from a raw packet body
    pub fn parse(mut body: Bytes) -> Result<Self, CodecError> {
        let protocol = codec::read_varint(&mut body)?;
        let host = codec::read_string(&mut body, 255)?;
        let port = codec::read_u16(&mut body)?;
        let next = match codec::read_varint(&mut body)? {
            1 => Phase::Status,
            _ => Phase::Login,
        };
        Ok(Self {
            protocol,
            host,
            port,
            next,
        })
    }

    pub fn to_packet(&self) -> Packet {
        raw(HANDSHAKE, |buf| {
            codec::write_varint(buf, self.protocol);
            codec::write_string(buf, &self.host);
            buf.put_u16(self.port);
            codec::write_varint(buf, self.next as i32);
        })
    }
}

fn raw(id: i32, write: impl FnOnce(&mut BytesMut)) -> Packet {
    let mut body = BytesMut::new();
    write(&mut body);
    Packet::Raw {
        id,
        body: body.freeze(),
    }
}

pub fn login_start(username: &str) -> Packet {
    raw(LOGIN_START, |buf| codec::write_string(buf, username))
}

pub fn login_success(uuid: Uuid, username: &str) -> Packet {
    raw(LOGIN_SUCCESS, |buf| {
        codec::write_uuid(buf, uuid);
        codec::write_string(buf, username);
    })
}

/// login_plugin_response answers a login plugin request with "not understood"
/// encryption_request starts online-mode login: the server's public key in
/// DER form and a token the client must send back encrypted
pub fn encryption_request(server_id: &str, public_key: &[u8], verify_token: &[u8]) -> Packet {
    raw(ENCRYPTION_REQUEST, |buf| {
        codec::write_string(buf, server_id);
        codec::write_bytes(buf, public_key);
        codec::write_bytes(buf, verify_token);
    })
}

/// EncryptionResponse is the client's reply to an encryption request, both
/// fields encrypted with the server's public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionResponse {
    pub shared_secret: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl EncryptionResponse {
    pub fn parse(mut body: Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            shared_secret: codec::read_bytes(&mut body, 256)?,
            verify_token: codec::read_bytes(&mut body, 256)?,
        })
    }

    pub fn to_packet(&self) -> Packet {
        raw(ENCRYPTION_RESPONSE, |buf| {
            codec::write_bytes(buf, &self.shared_secret);
            codec::write_bytes(buf, &self.verify_token);
        })
    }
}

pub fn login_plugin_response(message_id: i32) -> Packet {
    raw(LOGIN_PLUGIN_RESPONSE, |buf| {
        codec::write_varint(buf, message_id);
        buf.put_u8(0);
    })
}

pub fn login_disconnect(reason_json: &str) -> Packet {
    raw(LOGIN_DISCONNECT, |buf| codec::write_string(buf, reason_json))
}

pub fn play_disconnect(reason_json: &str) -> Packet {
    raw(PLAY_DISCONNECT, |buf| codec::write_string(buf, reason_json))
}

pub fn status_response(json: &str) -> Packet {
    raw(STATUS_RESPONSE, |buf| codec::write_string(buf, json))
}

pub fn status_pong(payload: i64) -> Packet {
    raw(STATUS_PONG, |buf| buf.put_i64(payload))
}

/// offline_uuid derives the UUID a server in offline mode assigns to a name
pub fn offline_uuid(username: &str) -> Uuid {
    let digest: [u8; 16] = Md5::digest(format!("OfflinePlayer:{username}").as_bytes()).into();
    uuid::Builder::from_md5_bytes(digest).into_uuid()
}
