//! Error types for the session layer.

use roomsync_protocol::{ConnectionId, NamespaceId};

/// Errors that can occur while admitting or tracking connections.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The [`Authenticator`](crate::Authenticator) rejected the handshake.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A connection with this id is already tracked.
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    /// No connection with this id is tracked.
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    /// The connection isn't in a state that allows joining.
    #[error("connection {connection} cannot join {namespace_id}: {reason}")]
    InvalidTransition {
        connection: ConnectionId,
        namespace_id: NamespaceId,
        reason: &'static str,
    },
}
