use crate::auth::AuthMethod;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Only one session per canonical name may exist at a time
    #[error("{0} already has an active session")]
    AlreadyActive(String),
}

#[derive(Debug, Default)]
struct Entries {
    by_name: HashMap<String, (u64, AuthMethod)>,
    next_seq: u64,
}

/// IdentityRegistry tracks the canonical names with a live session.
///
/// Cheap to clone; clones share the same table. The lock is only held for a
/// single map operation and never across an await.
#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    inner: Arc<Mutex<Entries>>,
}

/// IdentityRegistry implementation block
impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert adds a name, failing if it is already present
    pub fn insert(&self, username: &str, method: AuthMethod) -> Result<(), RegistryError> {
        let mut entries = self.inner.lock();
        if entries.by_name.contains_key(username) {
            return Err(RegistryError::AlreadyActive(username.to_string()));
        }
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.by_name.insert(username.to_string(), (seq, method));
        Ok(())
    }

    /// remove drops a name; removing an absent name does nothing
    pub fn remove(&self, username: &str) {
        self.inner.lock().by_name.remove(username);
    }

    pub fn lookup(&self, username: &str) -> Option<AuthMethod> {
        self.inner.lock().by_name.get(username).map(|(_, method)| *method)
    }

    /// snapshot lists active names in the order they were registered
    pub fn snapshot(&self) -> Vec<String> {
        let entries = self.inner.lock();
        let mut names: Vec<_> = entries
            .by_name
            .iter()
            .map(|(name, (seq, _))| (*seq, name.clone()))
            .collect();
        names.sort_unstable_by_key(|(seq, _)| *seq);
        names.into_iter().map(|(_, name)| name).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// register inserts a name and returns a guard that removes it again,
    /// either through [`Registration::release`] or when dropped
    pub fn register(&self, username: &str, method: AuthMethod) -> Result<Registration, RegistryError> {
        self.insert(username, method)?;
        Ok(Registration {
            registry: self.clone(),
            username: Some(username.to_string()),
        })
    }
}

/// Registration is a session's claim on a registry entry. The entry is
/// removed exactly once, by `release` or on drop.
#[derive(Debug)]
pub struct Registration {
    registry: IdentityRegistry,
    /// None once released
    username: Option<String>,
}

impl Registration {
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }

    /// release removes the entry now
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(username) = self.username.take() {
            self.registry.remove(&username);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.remove();
    }
}
