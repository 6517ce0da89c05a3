//! Connection sessions for Roomsync.
//!
//! This crate handles the part of a connection's life that happens around
//! the namespace rather than inside it:
//!
//! 1. **Authentication**: deciding whether a handshake is allowed in
//!    ([`Authenticator`] trait, [`AllowAll`] default).
//! 2. **Connection tracking**: knowing which sockets are open, which
//!    namespace each one joined, and how to reach it
//!    ([`ConnectionRegistry`]).
//!
//! ```text
//! Namespace Layer (above)  ← asks which connections are in a namespace
//!     ↕
//! Session Layer (this crate)
//!     ↕
//! Protocol / Transport (below)  ← Handshake, ConnectionId, PeerSender
//! ```

mod auth;
mod connection;
mod error;
mod registry;

pub use auth::{AllowAll, Authenticator};
pub use connection::{generate_caller_id, ClientConnection, ConnectionState};
pub use error::SessionError;
pub use registry::ConnectionRegistry;
