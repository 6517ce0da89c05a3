//! Error types for the collection layer.

use roomsync_protocol::{CollectionTypeId, ProtocolError};

/// Errors that can occur while mutating or replicating a collection.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    /// `add_item` was called with an id that already exists. This is a
    /// caller bug (id generation collided), so it is never swallowed.
    #[error("item {id} already exists in collection {collection}")]
    DuplicateId {
        collection: CollectionTypeId,
        id: String,
    },

    /// The operation targets a record that isn't there.
    #[error("item {id} not found in collection {collection}")]
    NotFound {
        collection: CollectionTypeId,
        id: String,
    },

    /// `import` got id and payload arrays of different lengths. Nothing
    /// was imported.
    #[error("import arity mismatch: {ids} ids but {payloads} payloads")]
    ArityMismatch { ids: usize, payloads: usize },

    /// Record bytes couldn't be decoded with the registered codec.
    #[error("failed to decode {collection} record: {source}")]
    Decode {
        collection: CollectionTypeId,
        #[source]
        source: ProtocolError,
    },

    /// A record couldn't be encoded with the registered codec.
    #[error("failed to encode {collection} record: {source}")]
    Encode {
        collection: CollectionTypeId,
        #[source]
        source: ProtocolError,
    },

    /// A partial update wasn't a JSON object, or merging it produced a
    /// value that doesn't fit the record type.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// The type id was already registered.
    #[error("collection type {0} is already registered")]
    DuplicateType(CollectionTypeId),
}
