use crate::registry::IdentityRegistry;

/// Default prefix marking a chat line as a proxy command
pub const DEFAULT_PREFIX: &str = "@@";

/// Interception is what should happen to a chat line typed by a player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Not a command; relay it to the backend
    Forward,
    /// A command with nothing to say; swallow it
    Drop,
    /// A command; answer the player and swallow it
    Reply(String),
}

/// CommandInterceptor recognizes proxy commands in player chat
#[derive(Debug, Clone)]
pub struct CommandInterceptor {
    prefix: String,
    info_enabled: bool,
}

impl Default for CommandInterceptor {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, true)
    }
}

/// CommandInterceptor implementation block
impl CommandInterceptor {
    pub fn new(prefix: impl Into<String>, info_enabled: bool) -> Self {
        Self {
            prefix: prefix.into(),
            info_enabled,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// intercept decides the fate of one chat line.
    ///
    /// The command is everything between the prefix and the first
    /// whitespace; a line with nothing there ("@@" or "@@ info") is dropped.
    pub fn intercept(&self, message: &str, registry: &IdentityRegistry) -> Interception {
        let Some(rest) = message.strip_prefix(self.prefix.as_str()) else {
            return Interception::Forward;
        };

        let mut parts = rest.split(char::is_whitespace);
        let command = parts.next().unwrap_or_default();
        if command.is_empty() {
            return Interception::Drop;
        }
        let mut args = parts.filter(|arg| !arg.is_empty());

        match command {
            "info" if self.info_enabled => {
                let reply = args
                    .next()
                    .and_then(|name| registry.lookup(name))
                    .map(|method| format!("auth method: {method}"))
                    .unwrap_or_else(|| "unknown".to_string());
                Interception::Reply(reply)
            }
            _ => Interception::Reply("unknown command".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;

    fn registry() -> IdentityRegistry {
        let registry = IdentityRegistry::new();
        registry.insert("alice", AuthMethod::Online).unwrap();
        registry.insert("bob", AuthMethod::Offline).unwrap();
        registry
    }

    #[test]
    fn plain_chat_is_forwarded() {
        let interceptor = CommandInterceptor::default();
        assert_eq!(interceptor.intercept("hello", &registry()), Interception::Forward);
        assert_eq!(interceptor.intercept("@ info alice", &registry()), Interception::Forward);
        assert_eq!(interceptor.intercept(" @@info alice", &registry()), Interception::Forward);
    }

    #[test]
    fn info_reports_auth_method() {
        let interceptor = CommandInterceptor::default();
        assert_eq!(
            interceptor.intercept("@@info alice", &registry()),
            Interception::Reply("auth method: online".into())
        );
        assert_eq!(
            interceptor.intercept("@@info   bob  ", &registry()),
            Interception::Reply("auth method: offline".into())
        );
        assert_eq!(
            interceptor.intercept("@@info carol", &registry()),
            Interception::Reply("unknown".into())
        );
        assert_eq!(
            interceptor.intercept("@@info", &registry()),
            Interception::Reply("unknown".into())
        );
    }

    #[test]
    fn unknown_command() {
        let interceptor = CommandInterceptor::default();
        assert_eq!(
            interceptor.intercept("@@bogus", &registry()),
            Interception::Reply("unknown command".into())
        );
        assert_eq!(
            interceptor.intercept("@@INFO alice", &registry()),
            Interception::Reply("unknown command".into())
        );
    }

    #[test]
    fn empty_command_is_dropped() {
        let interceptor = CommandInterceptor::default();
        assert_eq!(interceptor.intercept("@@", &registry()), Interception::Drop);
        assert_eq!(interceptor.intercept("@@ info alice", &registry()), Interception::Drop);
    }

    #[test]
    fn prefix_and_commands_are_configurable() {
        let interceptor = CommandInterceptor::new("@", false);
        assert_eq!(interceptor.prefix(), "@");
        assert_eq!(
            interceptor.intercept("@info alice", &registry()),
            Interception::Reply("unknown command".into())
        );
        assert_eq!(
            interceptor.intercept("@@info alice", &registry()),
            Interception::Reply("unknown command".into())
        );
    }
}
