//! The per-connection proxy session.
//!
//! A session owns a client leg (the player) and a backend leg (the private
//! server). Both legs report what happens to them as [`LegEvent`]s on one
//! channel; the session consumes that channel in a single task, so every
//! decision about relaying or closing is made in one place, one event at a
//! time.
//!
//! ```text
//! Authenticating ──→ ConnectingBackend ──→ Relaying ──→ HalfClosed(side) ──→ Closed
//!       │
//!       └──→ Rejected
//! ```

use crate::{
    auth::{self, AuthMethod, WhitelistEntry},
    bridge, chat,
    commands::{CommandInterceptor, Interception},
    protocol::{Packet, Phase},
    registry::{IdentityRegistry, Registration, RegistryError},
};
use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Side names one leg of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

/// EndReason is passed to a leg when the proxy closes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The other leg ended normally
    End,
    /// The other leg failed
    Error,
    /// The player was not let in
    Refused(String),
}

impl EndReason {
    pub fn message(&self) -> &str {
        match self {
            EndReason::End => "End",
            EndReason::Error => "Error",
            EndReason::Refused(reason) => reason,
        }
    }
}

/// LegEvent is something a leg reports to its session
#[derive(Debug)]
pub enum LegEvent {
    /// The backend leg's connection is established
    Connected,
    /// The backend accepted the login and is now in Play
    LoggedIn,
    /// A packet arrived while the leg was in `phase`
    Packet { packet: Packet, phase: Phase },
    /// The leg closed normally
    End,
    /// The leg failed
    Error(anyhow::Error),
}

pub type EventSender = mpsc::UnboundedSender<(Side, LegEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(Side, LegEvent)>;

/// Leg is one connection as the protocol engine exposes it.
///
/// Every leg must eventually report exactly one `End` or `Error` on its
/// session's channel, including after [`Leg::end`] is called.
pub trait Leg: Send {
    /// Current phase; may change between two calls
    fn phase(&self) -> Phase;

    /// Queue a packet. Errors when the leg can no longer send.
    fn send(&mut self, packet: Packet) -> Result<()>;

    /// Change the compression threshold, ordered with sends
    fn set_compression_threshold(&mut self, threshold: i32);

    /// Finish a player's login. Packets sent before this reach the player
    /// after its login success.
    fn complete_login(&mut self);

    /// Ask the leg to close
    fn end(&mut self, reason: EndReason);
}

/// Connector opens backend legs
pub trait Connector<L: Leg> {
    /// Start connecting as `username`. The returned leg reports `Connected`
    /// (or `Error`) on the session channel once the attempt resolves.
    fn open(&mut self, username: &str) -> L;
}

/// SessionState is where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    ConnectingBackend,
    Relaying,
    /// One leg has closed and the other has been told to
    HalfClosed(Side),
    Closed,
    Rejected,
}

/// SessionState implementation block
impl SessionState {
    /// leg_closed is the transition taken when `side` reports that it
    /// closed. Returns the next state and the leg that must now be ended,
    /// if any. A side that already closed, or a finished session, is left
    /// as it is.
    pub fn leg_closed(self, side: Side, backend_started: bool) -> (SessionState, Option<Side>) {
        match self {
            SessionState::Authenticating
            | SessionState::ConnectingBackend
            | SessionState::Relaying => match side {
                Side::Client if backend_started => {
                    (SessionState::HalfClosed(Side::Client), Some(Side::Backend))
                }
                Side::Client => (SessionState::Closed, None),
                Side::Backend => (SessionState::HalfClosed(Side::Backend), Some(Side::Client)),
            },
            SessionState::HalfClosed(closed) if closed != side => (SessionState::Closed, None),
            state => (state, None),
        }
    }

    /// is_open reports whether `side` may still be written to
    pub fn is_open(self, side: Side) -> bool {
        match self {
            SessionState::HalfClosed(closed) => closed != side,
            SessionState::Closed | SessionState::Rejected => false,
            _ => true,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }
}

/// SessionSettings holds the per-session knobs taken from configuration
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub interceptor: CommandInterceptor,
    /// Tag shown in front of every message the proxy sends a player
    pub message_tag: String,
}

/// ProxySession pairs a client leg with a backend leg
pub struct ProxySession<L: Leg> {
    client: L,
    backend: Option<L>,
    state: SessionState,
    peer: String,
    channel: AuthMethod,
    username: Option<String>,
    registry: IdentityRegistry,
    registration: Option<Registration>,
    settings: SessionSettings,
}

/// ProxySession implementation block
impl<L: Leg> ProxySession<L> {
    /// new creates a session for a client that logged in on the listener
    /// for `channel`. `peer` is only used in logs.
    pub fn new(
        client: L,
        peer: impl Into<String>,
        channel: AuthMethod,
        registry: IdentityRegistry,
        settings: SessionSettings,
    ) -> Self {
        Self {
            client,
            backend: None,
            state: SessionState::Authenticating,
            peer: peer.into(),
            channel,
            username: None,
            registry,
            registration: None,
            settings,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// username is the canonical name, once authentication succeeded
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// run drives the session from authentication until both legs closed
    pub async fn run<C: Connector<L>>(
        mut self,
        identity: &str,
        whitelist: &[WhitelistEntry],
        mut connector: C,
        mut events: EventReceiver,
    ) -> Result<()> {
        // Resolve identity and claim the name
        if !self.authenticate(identity, whitelist) {
            return Ok(());
        }
        self.connect_backend(&mut connector);

        // Consume events from both legs until both closed
        while !self.state.is_finished() {
            let Some((side, event)) = events.recv().await else {
                break;
            };
            self.handle(side, event);
        }

        if !self.state.is_finished() {
            return Err(anyhow!("session for {} lost its event channel", self.peer));
        }
        Ok(())
    }

    /// authenticate resolves the presented identity and claims the
    /// canonical name. On failure the client is ended and the session is
    /// Rejected.
    pub fn authenticate(&mut self, identity: &str, whitelist: &[WhitelistEntry]) -> bool {
        if self.state != SessionState::Authenticating {
            return false;
        }
        info!(addr = %self.peer, via = %self.channel, "{} auth for {identity}", self.channel);

        // Look up whitelist
        let Some(resolution) = auth::resolve(identity, self.channel, whitelist) else {
            info!(addr = %self.peer, "auth failed for {identity}");
            self.reject("auth failed".to_string());
            return false;
        };

        // Canonical names are unique
        match self.registry.register(&resolution.username, resolution.method) {
            Ok(registration) => self.registration = Some(registration),
            Err(RegistryError::AlreadyActive(name)) => {
                info!(addr = %self.peer, "{name} is already connected");
                self.reject(format!("{name} is already connected"));
                return false;
            }
        }

        info!(addr = %self.peer, user = %resolution.username, "auth success ({})", resolution.method);
        self.notify(&format!("{} auth successful", resolution.method));
        self.username = Some(resolution.username);
        self.state = SessionState::ConnectingBackend;
        true
    }

    fn reject(&mut self, reason: String) {
        self.client.end(EndReason::Refused(reason));
        self.state = SessionState::Rejected;
    }

    /// connect_backend opens the backend leg under the canonical name
    pub fn connect_backend<C: Connector<L>>(&mut self, connector: &mut C) {
        if self.state != SessionState::ConnectingBackend || self.backend.is_some() {
            return;
        }
        let Some(username) = self.username.as_deref() else {
            return;
        };
        self.backend = Some(connector.open(username));
    }

    /// handle applies one event from either leg
    pub fn handle(&mut self, side: Side, event: LegEvent) {
        if self.state.is_finished() {
            return;
        }

        match (side, event) {
            (Side::Backend, LegEvent::Connected) => self.backend_connected(),
            (Side::Client, LegEvent::Connected) => {}
            (Side::Backend, LegEvent::LoggedIn) => self.backend_logged_in(),
            (Side::Client, LegEvent::LoggedIn) => {}
            (Side::Client, LegEvent::Packet { packet, phase }) => self.relay_from_client(packet, phase),
            (Side::Backend, LegEvent::Packet { packet, phase }) => self.relay_from_backend(packet, phase),
            (side, LegEvent::End) => self.close(side, EndReason::End),
            (side, LegEvent::Error(err)) => self.fail(side, err),
        }
    }

    fn backend_connected(&mut self) {
        if self.state != SessionState::ConnectingBackend {
            return;
        }
        let username = self.username.clone().unwrap_or_default();
        info!(addr = %self.peer, user = %username, "backend connected");
        self.notify(&format!("you have been connected as \"{username}\""));
        if self.state == SessionState::ConnectingBackend {
            self.state = SessionState::Relaying;
        }
    }

    /// backend_logged_in lets the player in now that the backend accepted
    /// the canonical name
    fn backend_logged_in(&mut self) {
        if !self.state.is_open(Side::Client) {
            return;
        }
        debug!(addr = %self.peer, "backend accepted login");
        self.client.complete_login();
    }

    fn relay_from_client(&mut self, packet: Packet, phase: Phase) {
        if !self.state.is_open(Side::Backend) {
            return;
        }
        let backend_phase = match &self.backend {
            Some(backend) => backend.phase(),
            None => return,
        };
        // Only Play traffic crosses over
        if phase != Phase::Play || backend_phase != Phase::Play {
            return;
        }

        // Commands stay on the proxy
        if let Packet::ClientChat { message } = &packet {
            match self.settings.interceptor.intercept(message, &self.registry) {
                Interception::Forward => {}
                Interception::Drop => return,
                Interception::Reply(reply) => {
                    debug!(addr = %self.peer, "command {message:?} answered locally");
                    self.notify(&reply);
                    return;
                }
            }
        }

        // Forward to backend
        let sent = match self.backend.as_mut() {
            Some(backend) => backend.send(packet),
            None => return,
        };
        if let Err(err) = sent {
            self.fail(Side::Backend, err);
        }
    }

    fn relay_from_backend(&mut self, packet: Packet, phase: Phase) {
        if !self.state.is_open(Side::Client) {
            return;
        }

        // The threshold is a connection parameter, honoured even while the
        // backend is still logging in
        if let Packet::SetCompression { threshold } = &packet {
            bridge::propagate_compression(&mut self.client, *threshold);
        }

        if phase != Phase::Play || self.client.phase() != Phase::Play {
            return;
        }

        // Log system messages
        if let Packet::ServerChat {
            message,
            position: chat::POSITION_SYSTEM,
            ..
        } = &packet
        {
            info!(addr = %self.peer, "{}", chat::plain_text(message));
        }

        // Forward to client
        if let Err(err) = self.client.send(packet) {
            self.fail(Side::Client, err);
        }
    }

    /// notify sends the player a message from the proxy itself
    fn notify(&mut self, text: &str) {
        if !self.state.is_open(Side::Client) {
            return;
        }
        let packet = chat::system_packet(&self.settings.message_tag, text);
        if let Err(err) = self.client.send(packet) {
            self.fail(Side::Client, err);
        }
    }

    fn fail(&mut self, side: Side, err: anyhow::Error) {
        if !self.state.is_open(side) {
            return;
        }
        match side {
            Side::Client => error!(addr = %self.peer, "connection error by client: {err:?}"),
            Side::Backend => error!(addr = %self.peer, "connection error by server: {err:?}"),
        }
        self.close(side, EndReason::Error);
    }

    /// close records that `side` closed and ends the other leg if it is
    /// still open. Runs its effects at most once per side.
    fn close(&mut self, side: Side, reason: EndReason) {
        let (next, signal) = self.state.leg_closed(side, self.backend.is_some());
        if next == self.state {
            return;
        }
        self.state = next;

        // Backend gone releases the name
        match side {
            Side::Client => info!(addr = %self.peer, "connection closed by client"),
            Side::Backend => {
                info!(addr = %self.peer, "connection closed by server");
                if let Some(registration) = self.registration.take() {
                    registration.release();
                }
            }
        }

        // Cascade to the other leg
        match signal {
            Some(Side::Client) => self.client.end(reason),
            Some(Side::Backend) => {
                if let Some(backend) = self.backend.as_mut() {
                    backend.end(reason);
                }
            }
            None => {}
        }
    }
}
