use crate::{
    auth::WhitelistEntry,
    commands::{CommandInterceptor, DEFAULT_PREFIX},
    leg::BackendTarget,
    online::DEFAULT_SESSION_SERVER,
    protocol::DEFAULT_PROTOCOL,
    session::SessionSettings,
};
use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::{error, info, warn};

/// How often the config file is checked for changes
const RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// SharedConfig is the live configuration the listeners read from
pub type SharedConfig = Arc<RwLock<Config>>;

/// Config is the proxy's JSON configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub motd: String,

    /// PNG shown in the server list; takes precedence over `favicon`
    #[serde(default)]
    pub favicon_path: Option<PathBuf>,

    /// Ready-made `data:image/png;base64,...` favicon
    #[serde(default)]
    pub favicon: Option<String>,

    /// Shown as the player limit; display only
    #[serde(default)]
    pub max_players: Option<i64>,

    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    pub backend_port: u16,
    pub offline_port: u16,
    pub online_port: u16,

    /// Version name shown in the server list
    pub version: String,

    #[serde(default = "default_protocol")]
    pub protocol: i32,

    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,

    #[serde(default = "default_prefix")]
    pub command_prefix: String,

    #[serde(default = "default_true")]
    pub info_command: bool,

    #[serde(default = "default_message_tag")]
    pub message_tag: String,

    /// Where online logins are verified; read once at startup
    #[serde(default = "default_session_server")]
    pub session_server: String,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_protocol() -> i32 {
    DEFAULT_PROTOCOL
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

fn default_message_tag() -> String {
    "trash-auth".to_string()
}

fn default_session_server() -> String {
    DEFAULT_SESSION_SERVER.to_string()
}

/// Config implementation block
impl Config {
    /// from_json parses and validates a config document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json).context("invalid config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.command_prefix.trim().is_empty() {
            bail!("command_prefix must not be empty");
        }
        if self.offline_port == self.online_port {
            bail!("offline_port and online_port must differ");
        }
        for entry in &self.whitelist {
            if entry.name.is_empty() {
                bail!("whitelist entries need a name");
            }
            if entry.token.as_deref() == Some("") {
                bail!("empty token for whitelist entry {}", entry.name);
            }
        }
        Ok(())
    }

    /// load reads the config file and its favicon
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::from_json(&json)?;
        config.load_favicon().await;
        Ok(config)
    }

    /// load_favicon reads `favicon_path` into a data URL. A missing or
    /// unreadable file leaves `favicon` as configured.
    pub async fn load_favicon(&mut self) {
        let Some(path) = &self.favicon_path else {
            return;
        };
        match tokio::fs::read(path).await {
            Ok(png) => self.favicon = Some(format!("data:image/png;base64,{}", STANDARD.encode(png))),
            Err(e) => warn!("favicon load failed: {}: {e}", path.display()),
        }
    }

    pub fn backend_target(&self) -> BackendTarget {
        BackendTarget {
            host: self.backend_host.clone(),
            port: self.backend_port,
            protocol: self.protocol,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            interceptor: CommandInterceptor::new(self.command_prefix.clone(), self.info_command),
            message_tag: self.message_tag.clone(),
        }
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok()
}

/// watch reloads the config whenever the file changes. An invalid file is
/// reported and the running config kept.
pub async fn watch(path: PathBuf, shared: SharedConfig) {
    let mut last = modified(&path).await;
    let mut ticker = tokio::time::interval(RELOAD_INTERVAL);

    loop {
        ticker.tick().await;
        let current = modified(&path).await;
        if current == last {
            continue;
        }
        last = current;

        match Config::load(&path).await {
            Ok(config) => {
                *shared.write() = config;
                info!("config reloaded");
            }
            Err(e) => error!("config reload failed: {e:#}"),
        }
    }
}
