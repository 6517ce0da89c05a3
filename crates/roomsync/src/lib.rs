//! # Roomsync
//!
//! Replicated record collections kept in sync between one authoritative
//! server and many WebSocket clients.
//!
//! Consumers register record types once in a [`CollectionRegistry`], run a
//! [`RoomsyncServer`], and connect [`RoomsyncClient`]s to a namespace. Every
//! local `add_item`/`update_item`/`remove_item` is applied locally, sent over
//! the wire, and fanned out to subscribers on every other peer in the same
//! namespace. Late joiners receive a snapshot of each collection first.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roomsync::prelude::*;
//!
//! #[derive(Clone, PartialEq, Serialize, Deserialize)]
//! struct Score {
//!     points: u32,
//! }
//!
//! # async fn run() -> Result<(), RoomsyncError> {
//! let mut registry = CollectionRegistry::new();
//! registry.register::<Score>("score", CollectionConfig::default())?;
//!
//! let server = RoomsyncServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .build(registry, AllowAll)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod client;
mod error;
mod handler;
mod server;

pub use client::{ClientConfig, ClientError, RoomsyncClient};
pub use error::RoomsyncError;
pub use server::{RoomsyncServer, RoomsyncServerBuilder, RoomsyncServerHandle, ServerConfig};

/// Everything a typical server or client needs.
pub mod prelude {
    pub use roomsync_collection::{
        Change, CollectionConfig, CollectionError, CollectionRegistry, Notification, Origin,
        SubscriptionId,
    };
    pub use roomsync_namespace::{CollectionHandle, NamespaceError, NamespaceHandle};
    pub use roomsync_protocol::{
        BincodeCodec, Codec, CollectionEvent, CollectionTypeId, ConnectionId, Handshake,
        JsonCodec, NamespaceId, ProtocolError,
    };
    pub use roomsync_session::{AllowAll, Authenticator, SessionError};
    pub use roomsync_transport::TransportError;
    pub use serde::{Deserialize, Serialize};

    pub use crate::{
        ClientConfig, ClientError, RoomsyncClient, RoomsyncError, RoomsyncServer,
        RoomsyncServerBuilder, RoomsyncServerHandle, ServerConfig,
    };
}
