//! Error types for the namespace layer.

use roomsync_collection::CollectionError;
use roomsync_protocol::{CollectionTypeId, NamespaceId, ProtocolError};

/// Errors that can occur while building, addressing, or talking to a
/// namespace.
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    /// The type id isn't in the registry, or isn't part of this namespace.
    #[error("unknown collection type {0}")]
    UnknownCollectionType(CollectionTypeId),

    /// Typed access asked for a record type other than the registered one.
    #[error("collection {type_id} does not hold {requested}")]
    TypeMismatch {
        type_id: CollectionTypeId,
        requested: &'static str,
    },

    /// The namespace actor has stopped (shut down or reaped).
    #[error("namespace {0} is unavailable")]
    Unavailable(NamespaceId),

    /// Membership commands only make sense for server-side namespaces.
    #[error("namespace {0} is client-side and has no members")]
    NotServerRole(NamespaceId),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
