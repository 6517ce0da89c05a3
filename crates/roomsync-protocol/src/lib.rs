//! Wire protocol for Roomsync.
//!
//! This crate defines the frames that clients and servers exchange:
//!
//! - **Types** ([`Envelope`], [`CollectionMutation`], [`FullExport`],
//!   [`Handshake`], ...): the structures that travel on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`], [`BincodeCodec`]): how
//!   those structures become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer doesn't know about sockets or collections; it only
//! knows how to frame and unframe messages.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Namespace (collections)
//! ```

mod codec;
mod error;
mod types;

#[cfg(feature = "binary")]
pub use codec::BincodeCodec;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use roomsync_transport::ConnectionId;
pub use types::{
    now_millis, timestamp_now, CollectionEvent, CollectionMutation,
    CollectionTypeId, Envelope, ErrorMessage, FullExport, Handshake, Joined,
    MessageType, NamespaceId, PROTOCOL_VERSION,
};
