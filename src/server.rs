use crate::{
    auth::AuthMethod,
    config::SharedConfig,
    leg::{BackendConnector, Incoming, LoginProfile, LoginStream, TcpLeg},
    online::OnlineAuth,
    registry::IdentityRegistry,
    session::ProxySession,
    status,
};
use anyhow::{Result, bail};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, error, info};

/// ProxyListener represents one of the two player-facing listeners and
/// houses what its connections share
pub struct ProxyListener {
    pub listen_addr: String,
    pub method: AuthMethod,
    config: SharedConfig,
    registry: IdentityRegistry,
    online: Option<Arc<OnlineAuth>>,
    listener: Option<TcpListener>,
}

/// ProxyListener implementation block
impl ProxyListener {
    /// new is a constructor for the ProxyListener type
    pub fn new(
        listen_addr: impl Into<String>,
        method: AuthMethod,
        config: SharedConfig,
        registry: IdentityRegistry,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            method,
            config,
            registry,
            online: None,
            listener: None,
        }
    }

    /// with_online_auth lets the listener verify online accounts. Without
    /// it, online logins are refused.
    pub fn with_online_auth(mut self, online: Arc<OnlineAuth>) -> Self {
        self.online = Some(online);
        self
    }

    /// bind to the listen address; errors when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("{} listener is already bound", self.method);
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("{} server listening on {}", self.method, addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts players until the listener fails
    pub async fn run(&mut self) -> Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                match self.listener.take() {
                    Some(listener) => listener,
                    None => bail!("{} listener failed to bind", self.method),
                }
            }
        };

        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = listener.accept().await?;

            let method = self.method;
            let config = self.config.clone();
            let registry = self.registry.clone();
            let online = self.online.clone();

            tokio::spawn(async move {
                // DEBUG
                debug!("new connection from {}", peer_addr);

                if let Err(e) = handle_connection(inbound, peer_addr, method, config, registry, online).await {
                    error!(addr = %peer_addr, "connection error: {e:#}");
                }
            });
        }
    }
}

/// handle_connection takes a player from handshake to a running session
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    method: AuthMethod,
    config: SharedConfig,
    registry: IdentityRegistry,
    online: Option<Arc<OnlineAuth>>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut login = LoginStream::new(stream);

    // Read handshake; status pings end here
    let (protocol, username) = match login.accept_handshake().await? {
        Incoming::Status => {
            let response = status::status_response(&config.read(), &registry, method).to_string();
            return login.serve_status(&response).await;
        }
        Incoming::Login { protocol, username } => (protocol, username),
    };

    info!("incoming connection from {} via {} auth", peer_addr, method);

    // Sessions keep the settings they started with
    let config = config.read().clone();

    // Check client version
    if protocol != config.protocol {
        info!(addr = %peer_addr, protocol, "unsupported protocol version");
        let reason = format!("unsupported client, please use {}", config.version);
        return login.refuse(&reason).await;
    }

    // Online accounts are verified before the whitelist sees them
    let (identity, profile) = match method {
        AuthMethod::Offline => {
            let profile = LoginProfile::offline(&username);
            (username, profile)
        }
        AuthMethod::Online => {
            let Some(online) = online else {
                info!(addr = %peer_addr, "online login for {username} refused");
                return login.refuse("online login is not available, use a token").await;
            };
            match online.login(&mut login, &username).await? {
                Some(verified) => {
                    let profile = LoginProfile {
                        uuid: verified.uuid()?,
                        name: verified.name.clone(),
                    };
                    info!(addr = %peer_addr, user = %verified.name, "session server verified {username}");
                    (verified.name, profile)
                }
                None => {
                    info!(addr = %peer_addr, "session server did not verify {username}");
                    return login.refuse("failed to verify username").await;
                }
            }
        }
    };

    // Hand the player to a session
    let (events, receiver) = mpsc::unbounded_channel();
    let client = TcpLeg::client(login, profile, events.clone());
    let connector = BackendConnector::new(config.backend_target(), events);

    ProxySession::new(client, peer_addr.to_string(), method, registry, config.session_settings())
        .run(&identity, &config.whitelist, connector, receiver)
        .await
}

/// ListenerPair runs the offline and online listeners side by side
pub struct ListenerPair {
    pub offline: ProxyListener,
    pub online: ProxyListener,
}

/// ListenerPair implementation block
impl ListenerPair {
    /// new builds both listeners from the current config. The online
    /// listener gets a fresh login key pair.
    pub fn new(config: SharedConfig, registry: IdentityRegistry) -> Result<Self> {
        let (host, offline_port, online_port, session_server) = {
            let current = config.read();
            (
                current.listen_host.clone(),
                current.offline_port,
                current.online_port,
                current.session_server.clone(),
            )
        };
        let online = Arc::new(OnlineAuth::new(session_server)?);

        Ok(Self {
            offline: ProxyListener::new(
                format!("{host}:{offline_port}"),
                AuthMethod::Offline,
                config.clone(),
                registry.clone(),
            ),
            online: ProxyListener::new(format!("{host}:{online_port}"), AuthMethod::Online, config, registry)
                .with_online_auth(online),
        })
    }

    /// run serves both listeners; returns when either one fails
    pub async fn run(mut self) -> Result<()> {
        self.offline.bind().await?;
        self.online.bind().await?;
        tokio::try_join!(self.offline.run(), self.online.run())?;
        Ok(())
    }
}
