//! Registry of live sessions
//!
//! Insertion-ordered and unique by socket descriptor. Order only affects
//! `/who` output.

use crate::session::Session;
use crate::types::{Generation, SessionKey};

/// The server's current set of sessions
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Vec<Session>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session
    ///
    /// Returns the session back if its descriptor is already registered.
    pub fn insert(&mut self, session: Session) -> Result<(), Session> {
        if self.contains(session.key()) {
            return Err(session);
        }
        self.sessions.push(session);
        Ok(())
    }

    /// Remove the session with this descriptor, if present
    pub fn remove(&mut self, key: SessionKey) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.key() == key)?;
        Some(self.sessions.remove(index))
    }

    pub fn contains(&self, key: SessionKey) -> bool {
        self.sessions.iter().any(|s| s.key() == key)
    }

    /// Whether `key` is registered and was accepted as `generation`
    pub fn is_current(&self, key: SessionKey, generation: Generation) -> bool {
        self.get(key).is_some_and(|s| s.generation() == generation)
    }

    pub fn get(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.iter().find(|s| s.key() == key)
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.key() == key)
    }

    /// Stable copy of the current membership, in insertion order
    ///
    /// Walk this instead of the registry when the walk may disconnect sessions.
    pub fn snapshot(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(Session::key).collect()
    }

    /// `/who` listing: full descriptions joined with ", "
    pub fn describe(&self) -> String {
        self.sessions
            .iter()
            .map(Session::full_description)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
