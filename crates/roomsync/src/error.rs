//! Unified error type for Roomsync.

use roomsync_collection::CollectionError;
use roomsync_namespace::NamespaceError;
use roomsync_protocol::ProtocolError;
use roomsync_session::SessionError;
use roomsync_transport::TransportError;

use crate::ClientError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum RoomsyncError {
    /// Socket-level failure (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame encode/decode failure or an unexpected frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Authentication or connection-table failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A rejected collection operation or registration.
    #[error(transparent)]
    Collection(#[from] CollectionError),

    /// Namespace construction, typed access, or a stopped actor.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    /// Client connection failure.
    #[error(transparent)]
    Client(#[from] ClientError),
}
