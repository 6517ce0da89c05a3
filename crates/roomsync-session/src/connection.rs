//! Per-connection records.

use std::fmt;

use rand::Rng;
use roomsync_protocol::{ConnectionId, NamespaceId};
use roomsync_transport::PeerSender;
use tokio::time::Instant;

/// Where a connection is in its life.
///
/// ```text
///   Connecting ──(join)──→ Joined(ns) ──(disconnect)──→ Disconnected
///       │                                                   ↑
///       └───────────────────(disconnect)────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake accepted, namespace not joined yet.
    Connecting,
    /// Member of a namespace and receiving its frames.
    Joined(NamespaceId),
    /// Gone. Kept only until the registry drops it.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Joined(ns) => write!(f, "joined({ns})"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// The server's record of one open socket.
///
/// `S` is whatever the server's [`Authenticator`](crate::Authenticator)
/// returned for the handshake.
#[derive(Debug, Clone)]
pub struct ClientConnection<S> {
    pub id: ConnectionId,
    /// Identity the client sent in its handshake.
    pub caller_id: String,
    pub session: S,
    pub state: ConnectionState,
    /// Outbound frame queue drained by the socket's writer task.
    pub sender: PeerSender,
    pub connected_at: Instant,
}

impl<S> ClientConnection<S> {
    pub fn new(id: ConnectionId, caller_id: String, session: S, sender: PeerSender) -> Self {
        Self {
            id,
            caller_id,
            session,
            state: ConnectionState::Connecting,
            sender,
            connected_at: Instant::now(),
        }
    }

    /// The namespace this connection joined, if any.
    pub fn namespace(&self) -> Option<&NamespaceId> {
        match &self.state {
            ConnectionState::Joined(ns) => Some(ns),
            _ => None,
        }
    }
}

/// Generates a random caller id, `client-` plus 8 lowercase hex
/// characters (32 bits).
///
/// Clients that don't pick an identity use this.
pub fn generate_caller_id() -> String {
    let suffix: u32 = rand::rng().random();
    format!("client-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use roomsync_transport::outbound_queue;

    use super::*;

    #[test]
    fn test_new_connection_starts_connecting() {
        let (tx, _rx) = outbound_queue();
        let conn = ClientConnection::new(ConnectionId::new(1), "alice".into(), 7u32, tx);
        assert_eq!(conn.state, ConnectionState::Connecting);
        assert_eq!(conn.namespace(), None);
        assert_eq!(conn.session, 7);
    }

    #[test]
    fn test_generate_caller_id_has_client_prefix_and_hex_suffix() {
        let a = generate_caller_id();
        let b = generate_caller_id();
        let suffix = a.strip_prefix("client-").expect("client- prefix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            ConnectionState::Joined("lobby".into()).to_string(),
            "joined(lobby)"
        );
    }
}
