//! The connection registry: every socket the server currently holds.
//!
//! Like the rest of the session layer this is a plain `HashMap`. The
//! server wraps it in a mutex and never holds the lock across an await.

use std::collections::HashMap;

use roomsync_protocol::{ConnectionId, NamespaceId};
use roomsync_transport::PeerSender;

use crate::{ClientConnection, ConnectionState, SessionError};

/// Every tracked connection, keyed by id. `S` is the per-connection
/// session data.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    connections: HashMap<ConnectionId, ClientConnection<S>>,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }
}

impl<S> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking an authenticated connection in `Connecting`.
    ///
    /// # Errors
    /// [`SessionError::AlreadyRegistered`] if the id is taken.
    pub fn register(
        &mut self,
        id: ConnectionId,
        caller_id: String,
        session: S,
        sender: PeerSender,
    ) -> Result<&ClientConnection<S>, SessionError> {
        if self.connections.contains_key(&id) {
            return Err(SessionError::AlreadyRegistered(id));
        }
        tracing::debug!(connection = %id, %caller_id, "connection registered");
        Ok(self
            .connections
            .entry(id)
            .or_insert_with(|| ClientConnection::new(id, caller_id, session, sender)))
    }

    /// Moves a connection from `Connecting` to `Joined(namespace_id)`.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] for an unknown id
    /// - [`SessionError::InvalidTransition`] if it already joined or
    ///   disconnected
    pub fn join(&mut self, id: ConnectionId, namespace_id: NamespaceId) -> Result<(), SessionError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;
        let reason = match conn.state {
            ConnectionState::Connecting => None,
            ConnectionState::Joined(_) => Some("already joined a namespace"),
            ConnectionState::Disconnected => Some("connection is closed"),
        };
        if let Some(reason) = reason {
            return Err(SessionError::InvalidTransition {
                connection: id,
                namespace_id,
                reason,
            });
        }
        tracing::debug!(connection = %id, namespace = %namespace_id, "connection joined");
        conn.state = ConnectionState::Joined(namespace_id);
        Ok(())
    }

    /// Stops tracking a connection and returns its final record, with
    /// the state set to `Disconnected`.
    pub fn disconnect(&mut self, id: ConnectionId) -> Option<ClientConnection<S>> {
        let mut conn = self.connections.remove(&id)?;
        tracing::debug!(connection = %id, caller_id = %conn.caller_id, "connection dropped");
        conn.state = ConnectionState::Disconnected;
        Some(conn)
    }

    /// Queues a frame for one connection. Returns `false` if the
    /// connection is unknown or its writer is gone; the failure is
    /// otherwise ignored.
    pub fn send(&self, id: ConnectionId, frame: Vec<u8>) -> bool {
        match self.connections.get(&id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Ids of every connection joined to `namespace_id`, sorted.
    pub fn connections_in(&self, namespace_id: &NamespaceId) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|conn| conn.namespace() == Some(namespace_id))
            .map(|conn| conn.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ClientConnection<S>> {
        self.connections.get(&id)
    }

    /// The session data the authenticator produced for a connection.
    pub fn session(&self, id: ConnectionId) -> Option<&S> {
        self.connections.get(&id).map(|conn| &conn.session)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
