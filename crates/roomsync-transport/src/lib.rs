//! Transport abstraction layer for Roomsync.
//!
//! Provides the [`Transport`] and [`Connection`] traits that abstract over
//! the message-oriented socket carrying Roomsync frames, plus the
//! per-connection outbound queue ([`PeerSender`]) that higher layers push
//! frames into.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{PendingUpgrade, WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one socket.
///
/// Also the `connection_id` carried in the `Joined` ack, so clients see
/// the same number the server logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw id, e.g. one read back from a `Joined` frame.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next unused id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a connection's outbound frame queue.
///
/// Namespaces and the server never write to sockets directly; they push
/// encoded frames here and a writer task drains the queue into the socket.
/// Pushing never blocks, and a closed queue means the peer is gone.
pub type PeerSender = mpsc::UnboundedSender<Vec<u8>>;

/// Receiving half of a connection's outbound frame queue.
pub type PeerReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Creates a fresh outbound frame queue for one connection.
pub fn outbound_queue() -> (PeerSender, PeerReceiver) {
    mpsc::unbounded_channel()
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;
}

/// A single connection that can send and receive frames.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends one frame to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next frame from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns `true` while the underlying socket is open.
    ///
    /// Flips to `false` once either side closes or an I/O error is seen.
    fn is_open(&self) -> bool;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_round_trips_raw_value() {
        assert_eq!(ConnectionId::new(42).into_inner(), 42);
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn test_next_connection_ids_are_unique_and_increasing() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_outbound_queue_delivers_in_order() {
        let (tx, mut rx) = outbound_queue();
        tx.send(vec![1]).unwrap();
        tx.send(vec![2]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
    }

    #[test]
    fn test_outbound_queue_send_fails_after_receiver_dropped() {
        let (tx, rx) = outbound_queue();
        drop(rx);
        assert!(tx.send(vec![1]).is_err());
    }
}
