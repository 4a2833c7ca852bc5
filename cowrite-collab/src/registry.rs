//! Identity → session registry with cursor presence.
//!
//! Owned by the command processor and mutated only from its task, so it needs
//! no locking. Identities are kept in a `BTreeMap`, which makes every listing
//! ordered by name.

use std::collections::BTreeMap;

use cowrite_core::Document;

use crate::session::{SessionHandle, SessionId};

/// A registered client.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub identity: String,
    pub session: SessionHandle,
    /// Last reported cursor offset.
    pub cursor: Option<i64>,
    /// 0-based line of `cursor`, unknown when the offset was out of range.
    pub line: Option<usize>,
}

/// Read-only view of one client, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub identity: String,
    pub cursor: Option<i64>,
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no client registered as {0:?}")]
    UnknownClient(String),
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<String, ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` on `session`, returning the entry it displaced.
    pub fn register(&mut self, identity: impl Into<String>, session: SessionHandle) -> Option<ClientEntry> {
        let identity = identity.into();
        let entry = ClientEntry {
            identity: identity.clone(),
            session,
            cursor: None,
            line: None,
        };
        self.clients.insert(identity, entry)
    }

    pub fn unregister(&mut self, identity: &str) -> Option<ClientEntry> {
        self.clients.remove(identity)
    }

    /// Unregister `identity` only if `session` still owns it.
    pub fn unregister_session(&mut self, identity: &str, session: SessionId) -> Option<ClientEntry> {
        match self.clients.get(identity) {
            Some(entry) if entry.session.id() == session => self.clients.remove(identity),
            _ => None,
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<&SessionHandle> {
        self.clients.get(identity).map(|entry| &entry.session)
    }

    pub fn get(&self, identity: &str) -> Option<&ClientEntry> {
        self.clients.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.clients.contains_key(identity)
    }

    /// Identities registered on `session`.
    pub fn identities_of(&self, session: SessionId) -> Vec<String> {
        self.clients
            .values()
            .filter(|entry| entry.session.id() == session)
            .map(|entry| entry.identity.clone())
            .collect()
    }

    /// All identities in order, optionally leaving one out.
    pub fn list_identities(&self, excluding: Option<&str>) -> Vec<String> {
        self.clients
            .keys()
            .filter(|identity| Some(identity.as_str()) != excluding)
            .cloned()
            .collect()
    }

    /// Record a cursor move, deriving the line from the current content.
    pub fn update_cursor(&mut self, identity: &str, position: i64, document: &Document) -> Result<(), RegistryError> {
        let entry = self
            .clients
            .get_mut(identity)
            .ok_or_else(|| RegistryError::UnknownClient(identity.to_string()))?;
        entry.cursor = Some(position);
        entry.line = document.line_of(position);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientEntry> {
        self.clients.values()
    }

    /// Remove every client and close its session.
    pub fn close_all(&mut self) -> Vec<ClientEntry> {
        let entries: Vec<ClientEntry> = std::mem::take(&mut self.clients).into_values().collect();
        for entry in &entries {
            entry.session.close();
        }
        entries
    }

    pub fn summaries(&self) -> Vec<ClientSummary> {
        self.clients
            .values()
            .map(|entry| ClientSummary {
                identity: entry.identity.clone(),
                cursor: entry.cursor,
                line: entry.line,
            })
            .collect()
    }
}
