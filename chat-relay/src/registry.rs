//! Session Registry: every live server-side connection plus the login bound to it.
//!
//! One mutex guards the whole map. Callers that must mutate and broadcast as a
//! single step (disconnect cleanup) take the guard with [`SessionRegistry::lock`]
//! and work on [`Sessions`] directly; everything else uses the one-shot helpers.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    message::ServerToClient,
    transport::{ConnectionId, ServerConnection},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("You are already logged in under the name {0}.")]
    AlreadyBound(String),
    #[error("The login ID {0} is already in use.")]
    Taken(String),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

pub struct Session {
    connection: ServerConnection,
    login: Option<String>,
}

impl Session {
    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }
}

#[derive(Default)]
pub struct Sessions {
    // BTreeMap keeps broadcast order stable (oldest connection first).
    entries: BTreeMap<ConnectionId, Session>,
}

impl Sessions {
    pub fn insert(&mut self, connection: ServerConnection) {
        self.entries.insert(
            connection.id(),
            Session {
                connection,
                login: None,
            },
        );
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Session> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds `login` to `id`. A binding is set once and never replaced.
    pub fn bind(&mut self, id: ConnectionId, login: &str, unique: bool) -> Result<(), LoginError> {
        if let Some(existing) = self.get(id).and_then(Session::login) {
            return Err(LoginError::AlreadyBound(existing.to_string()));
        }
        if unique && self.entries.values().any(|s| s.login() == Some(login)) {
            return Err(LoginError::Taken(login.to_string()));
        }

        let session = self
            .entries
            .get_mut(&id)
            .ok_or(LoginError::UnknownConnection(id))?;
        session.login = Some(login.to_string());
        Ok(())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Session> {
        self.entries.remove(&id)
    }

    /// Sends `message` to every session. A failed send is skipped; returns
    /// how many sends succeeded.
    pub fn broadcast(&self, message: &ServerToClient) -> usize {
        let mut delivered = 0;
        for (id, session) in &self.entries {
            match session.connection.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => debug!(connection = %id, %error, "skipping broadcast target"),
            }
        }
        delivered
    }

    pub fn drain(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, connection: ServerConnection) {
        self.lock().insert(connection);
    }

    pub fn login_of(&self, id: ConnectionId) -> Option<String> {
        self.lock().get(id).and_then(Session::login).map(str::to_string)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn broadcast(&self, message: &ServerToClient) -> usize {
        self.lock().broadcast(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type FakeConnection = crate::transport::fake::FakeConnection<ServerToClient>;

    fn notice(text: &str) -> ServerToClient {
        ServerToClient::notice(text)
    }

    #[test]
    fn broadcast_reaches_every_registered_connection() {
        let registry = SessionRegistry::new();
        let connections: Vec<_> = (1..=4).map(FakeConnection::new).collect();
        for connection in &connections {
            registry.register(connection.clone());
        }

        assert_eq!(registry.broadcast(&notice("hello")), 4);
        for connection in &connections {
            assert_eq!(connection.sent(), vec![notice("hello")]);
        }
    }

    #[test]
    fn broadcast_skips_a_connection_that_dropped() {
        let registry = SessionRegistry::new();
        let connections: Vec<_> = (1..=3).map(FakeConnection::new).collect();
        for connection in &connections {
            registry.register(connection.clone());
        }
        connections[1].drop_link();

        assert_eq!(registry.broadcast(&notice("still here")), 2);
        assert_eq!(connections[0].sent(), vec![notice("still here")]);
        assert!(connections[1].sent().is_empty());
        assert_eq!(connections[2].sent(), vec![notice("still here")]);
    }

    #[test]
    fn binding_is_set_once() {
        let registry = SessionRegistry::new();
        registry.register(FakeConnection::new(1));
        let id = ConnectionId(1);

        registry.lock().bind(id, "alice", false).expect("first bind");
        let second = registry.lock().bind(id, "bob", false);

        assert_eq!(second, Err(LoginError::AlreadyBound("alice".into())));
        assert_eq!(registry.login_of(id).as_deref(), Some("alice"));
    }

    #[test]
    fn duplicate_logins_allowed_unless_unique() {
        let registry = SessionRegistry::new();
        registry.register(FakeConnection::new(1));
        registry.register(FakeConnection::new(2));
        registry.register(FakeConnection::new(3));

        registry.lock().bind(ConnectionId(1), "alice", false).expect("bind 1");
        registry
            .lock()
            .bind(ConnectionId(2), "alice", false)
            .expect("permissive duplicate");
        assert_eq!(
            registry.lock().bind(ConnectionId(3), "alice", true),
            Err(LoginError::Taken("alice".into()))
        );
    }

    #[test]
    fn bind_requires_registration() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.lock().bind(ConnectionId(9), "ghost", false),
            Err(LoginError::UnknownConnection(ConnectionId(9)))
        );
    }

    #[test]
    fn remove_returns_the_session_only_once() {
        let registry = SessionRegistry::new();
        registry.register(FakeConnection::new(1));
        registry.lock().bind(ConnectionId(1), "alice", false).expect("bind");

        let removed = registry.lock().remove(ConnectionId(1)).expect("present");
        assert_eq!(removed.login(), Some("alice"));
        assert!(registry.lock().remove(ConnectionId(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = SessionRegistry::new();
        registry.register(FakeConnection::new(1));
        registry.register(FakeConnection::new(2));

        let drained = registry.lock().drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
