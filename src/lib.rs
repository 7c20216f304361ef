//! A whitelisting Minecraft reverse proxy
//!
//! ## Overview
//!
//! - Two listeners, one per identity channel:
//!     - OFFLINE: the login name is a secret token looked up in the whitelist
//!     - ONLINE: the login name must be a whitelisted account name
//! - Accepted players are renamed to their canonical whitelist name and joined
//!   to a single offline-mode backend under that name
//! - At most one live session per canonical name
//! - Chat lines starting with the command prefix (`@@` by default) are answered
//!   by the proxy and never reach the backend
//! - The backend's compression threshold is carried over to the player;
//!   every frame is inflated and framed again for the leg it goes to
//! - ONLINE players go through the encryption exchange and are checked with
//!   the session server before the whitelist sees their name
//! - Async using tokio, with one coordinator task per session
//!
//! # Example
//! ```no_run
//! use mcauthproxy::{Config, IdentityRegistry, ListenerPair};
//! use parking_lot::RwLock;
//! use std::{path::Path, sync::Arc};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(RwLock::new(Config::load(Path::new("config.json")).await?));
//!     ListenerPair::new(config, IdentityRegistry::new())?.run().await
//! }
//! ```

pub mod auth;
pub mod bridge;
pub mod chat;
pub mod codec;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod leg;
pub mod online;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod status;

// Re-export main types at crate root for convenience
pub use auth::{AuthMethod, Resolution, WhitelistEntry};
pub use commands::{CommandInterceptor, Interception};
pub use config::{Config, SharedConfig};
pub use leg::{LoginProfile, LoginStream, TcpLeg};
pub use online::{OnlineAuth, Profile};
pub use registry::{IdentityRegistry, Registration, RegistryError};
pub use server::{ListenerPair, ProxyListener};
pub use session::{Connector, EndReason, Leg, LegEvent, ProxySession, SessionState, Side};
