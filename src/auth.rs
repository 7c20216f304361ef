use serde::{Deserialize, Serialize};
use std::fmt;

/// WhitelistEntry is one player allowed through the proxy.
///
/// `name` is the identity used on the backend; `token` is an alternate
/// credential a player can log in with instead of their name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// AuthMethod is the kind of identity a player was admitted with, and the
/// channel a listener accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Offline,
    Online,
}

/// AuthMethod implementation block
impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Offline => "offline",
            AuthMethod::Online => "online",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution is a successful whitelist match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Canonical name to log in to the backend with
    pub username: String,
    /// Token matches are always Offline, whichever listener carried them
    pub method: AuthMethod,
}

/// resolve maps a presented identity to its canonical backend name.
///
/// The whitelist is scanned in order and the first entry that matches wins:
/// a token match is accepted on either channel, a name match only on the
/// online channel where the platform has already verified the name.
pub fn resolve(identity: &str, channel: AuthMethod, whitelist: &[WhitelistEntry]) -> Option<Resolution> {
    for entry in whitelist {
        if entry.token.as_deref() == Some(identity) {
            return Some(Resolution {
                username: entry.name.clone(),
                method: AuthMethod::Offline,
            });
        }

        if channel == AuthMethod::Online && entry.name == identity {
            return Some(Resolution {
                username: entry.name.clone(),
                method: AuthMethod::Online,
            });
        }
    }

    None
}
