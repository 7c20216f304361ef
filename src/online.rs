//! Online-mode login: the encryption exchange with the player and the
//! session server check that proves the player owns the account.

use crate::{
    crypto::{self, KeyPair, SECRET_LEN},
    leg::LoginStream,
    protocol::{self, EncryptionResponse, Packet, Phase},
};
use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_SESSION_SERVER: &str = "https://sessionserver.mojang.com";

const VERIFY_TOKEN_LEN: usize = 4;

/// Profile is the account the session server vouches for
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
}

impl Profile {
    pub fn uuid(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.id).with_context(|| format!("session server sent a bad id {:?}", self.id))
    }
}

/// OnlineAuth holds what the online listener needs to verify players
pub struct OnlineAuth {
    keys: KeyPair,
    http: reqwest::Client,
    session_server: String,
}

/// OnlineAuth implementation block
impl OnlineAuth {
    /// new generates the login key pair and checks players against
    /// `session_server`
    pub fn new(session_server: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build session server client")?;
        Self::with_http(session_server, http)
    }

    /// with_http is [`OnlineAuth::new`] with a caller-built HTTP client
    pub fn with_http(session_server: impl Into<String>, http: reqwest::Client) -> Result<Self> {
        Ok(Self {
            keys: KeyPair::generate()?,
            http,
            session_server: session_server.into(),
        })
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    /// shared_secret opens an encryption response, checking that the
    /// client echoed `verify_token`
    pub fn shared_secret(&self, response: &EncryptionResponse, verify_token: &[u8]) -> Result<Vec<u8>> {
        let echoed = self.keys.decrypt(&response.verify_token)?;
        if echoed != verify_token {
            bail!("verify token mismatch");
        }
        let secret = self.keys.decrypt(&response.shared_secret)?;
        if secret.len() != SECRET_LEN {
            bail!("shared secret is {} bytes, expected {SECRET_LEN}", secret.len());
        }
        Ok(secret)
    }

    /// has_joined asks the session server whether `username` joined with
    /// `server_hash`. None means it did not.
    pub async fn has_joined(&self, username: &str, server_hash: &str) -> Result<Option<Profile>> {
        let url = format!("{}/session/minecraft/hasJoined", self.session_server.trim_end_matches('/'));
        let resp = self
            .http
            .get(url)
            .query(&[("username", username), ("serverId", server_hash)])
            .send()
            .await
            .context("session server request")?;

        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await.context("session server profile")?)),
            StatusCode::NO_CONTENT => Ok(None),
            status => bail!("session server answered {status}"),
        }
    }

    /// login runs the encryption exchange on a player that sent its login
    /// start, then verifies it. The stream is encrypted afterwards whatever
    /// the verdict.
    pub async fn login(&self, stream: &mut LoginStream, username: &str) -> Result<Option<Profile>> {
        // Send encryption request
        let verify_token: [u8; VERIFY_TOKEN_LEN] = rand::random();
        let request = protocol::encryption_request("", self.keys.public_der(), &verify_token);
        stream.write(&request).await?;

        // Read encryption response
        let response = match stream.read(Phase::Login).await? {
            Some(Packet::Raw {
                id: protocol::ENCRYPTION_RESPONSE,
                body,
            }) => EncryptionResponse::parse(body)?,
            Some(other) => bail!("expected encryption response, got {} packet", other.name()),
            None => bail!("connection closed before encryption response"),
        };

        let secret = self.shared_secret(&response, &verify_token)?;
        stream.enable_encryption(&secret)?;

        // DEBUG
        debug!(user = %username, "encryption enabled, asking session server");

        let hash = crypto::server_hash("", &secret, self.keys.public_der());
        self.has_joined(username, &hash).await
    }
}
