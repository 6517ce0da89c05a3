//! Client side: one namespace mirrored over one WebSocket.
//!
//! A [`RoomsyncClient`] owns a client-role namespace from the moment it is
//! created, so collections can be read, written, and subscribed to before
//! the socket is up. Local writes made while disconnected are applied
//! locally and dropped from the wire. On every connect the server's
//! snapshots replace the mirror before `connect` resolves, so records the
//! server lacks are removed, offline writes included.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roomsync_collection::{CollectionItem, CollectionRegistry};
use roomsync_namespace::{spawn_namespace, CollectionHandle, NamespaceHandle, Role};
use roomsync_protocol::{
    now_millis, Codec, CollectionTypeId, ConnectionId, Envelope, ErrorMessage, Handshake,
    JsonCodec, Joined, MessageType, NamespaceId, PROTOCOL_VERSION,
};
use roomsync_session::generate_caller_id;
use roomsync_transport::{outbound_queue, Connection, PeerReceiver, WebSocketConnection};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::RoomsyncError;

/// Sentinel for "no round trip measured yet".
const NO_RTT: u64 = u64::MAX;

/// Errors from connecting a client.
///
/// `Clone` because every caller waiting on a shared connect attempt gets
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The socket couldn't be opened or died during the handshake.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The server answered the handshake with an error frame.
    #[error("handshake rejected ({code}): {message}")]
    HandshakeRejected { code: u16, message: String },

    /// The client was disconnected, locally or by the server.
    #[error("disconnected")]
    Disconnected,

    /// No `Joined` arrived within the connect timeout.
    #[error("connect timed out")]
    Timeout,
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    pub namespace_id: NamespaceId,
    /// Sent in the handshake. Random unless set.
    pub caller_id: String,
    /// Handed to the server's authenticator.
    pub token: Option<String>,
    /// Collection types of the local namespace. Empty means every
    /// registered type.
    pub collection_types: Vec<CollectionTypeId>,
    /// Upper bound on socket open plus handshake.
    pub connect_timeout: Duration,
    /// Keepalive ping period while connected. `Duration::ZERO` disables it.
    pub ping_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, namespace_id: impl Into<NamespaceId>) -> Self {
        Self {
            url: url.into(),
            namespace_id: namespace_id.into(),
            caller_id: generate_caller_id(),
            token: None,
            collection_types: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
        }
    }

    pub fn caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn collection_types<I, T>(mut self, type_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CollectionTypeId>,
    {
        self.collection_types = type_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

type Waiter = oneshot::Sender<Result<(), ClientError>>;

/// Connection lifecycle.
///
/// `attempt` tags each connect so a stale attempt finishing after a
/// `disconnect()` can't touch a newer state.
enum ClientState {
    Idle,
    Connecting {
        attempt: u64,
        waiters: Vec<Waiter>,
    },
    Open {
        attempt: u64,
        socket: Arc<WebSocketConnection>,
        connection_id: ConnectionId,
        reader: JoinHandle<()>,
    },
    Closed,
}

/// State shared with the background tasks. Holds no namespace handle, so
/// dropping the client lets the namespace actor stop.
struct Shared {
    state: Mutex<ClientState>,
    next_attempt: AtomicU64,
    last_rtt_ms: AtomicU64,
}

impl Shared {
    async fn open_socket(&self) -> Option<Arc<WebSocketConnection>> {
        match &*self.state.lock().await {
            ClientState::Open { socket, .. } => Some(Arc::clone(socket)),
            _ => None,
        }
    }

    /// Moves `Open(attempt)` to `Closed`. Returns whether it did.
    async fn close_attempt(&self, attempt: u64) -> bool {
        let mut state = self.state.lock().await;
        match &*state {
            ClientState::Open { attempt: current, .. } if *current == attempt => {
                *state = ClientState::Closed;
                true
            }
            _ => false,
        }
    }
}

/// A client connected (or connectable) to one namespace on a server.
///
/// # Example
///
/// ```rust,ignore
/// let client = RoomsyncClient::new(
///     ClientConfig::new("ws://127.0.0.1:8080", "lobby"),
///     registry,
///     JsonCodec,
/// )?;
/// client.connect().await?;
/// client.collection::<Score>("score").add_item("me", Score { points: 0 }).await?;
/// ```
pub struct RoomsyncClient<C: Codec + Clone = JsonCodec> {
    config: Arc<ClientConfig>,
    codec: C,
    namespace: NamespaceHandle,
    shared: Arc<Shared>,
}

impl<C: Codec + Clone> RoomsyncClient<C> {
    /// Creates the client and its namespace. Doesn't connect.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// [`NamespaceError::UnknownCollectionType`](roomsync_namespace::NamespaceError)
    /// if a configured type isn't registered.
    pub fn new(
        config: ClientConfig,
        registry: impl Into<Arc<CollectionRegistry>>,
        codec: C,
    ) -> Result<Self, RoomsyncError> {
        let registry = registry.into();
        let type_ids = if config.collection_types.is_empty() {
            registry.type_ids()
        } else {
            config.collection_types.clone()
        };

        let (server, queue) = outbound_queue();
        let namespace = spawn_namespace(
            config.namespace_id.clone(),
            type_ids,
            &registry,
            Role::Client { server },
            codec.clone(),
        )?;

        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState::Idle),
            next_attempt: AtomicU64::new(1),
            last_rtt_ms: AtomicU64::new(NO_RTT),
        });
        tokio::spawn(forward_outbound(Arc::clone(&shared), queue));

        Ok(Self {
            config: Arc::new(config),
            codec,
            namespace,
            shared,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The local namespace.
    pub fn namespace(&self) -> &NamespaceHandle {
        &self.namespace
    }

    /// Typed access to one collection of the local namespace.
    pub fn collection<T: CollectionItem>(
        &self,
        type_id: impl Into<CollectionTypeId>,
    ) -> CollectionHandle<T> {
        self.namespace.collection(type_id)
    }

    /// Opens the socket and completes the handshake.
    ///
    /// Returns immediately when already open. Concurrent calls share one
    /// attempt and all resolve with its outcome. Reconnecting after a
    /// close is allowed.
    ///
    /// # Errors
    /// - [`ClientError::ConnectFailed`] if the socket can't be opened
    /// - [`ClientError::HandshakeRejected`] if the server refused us
    /// - [`ClientError::Timeout`] past the connect timeout
    /// - [`ClientError::Disconnected`] if `disconnect()` ran first
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().await;
            match &mut *state {
                ClientState::Open { .. } => return Ok(()),
                ClientState::Connecting { waiters, .. } => waiters.push(tx),
                ClientState::Idle | ClientState::Closed => {
                    let attempt = self.shared.next_attempt.fetch_add(1, Ordering::Relaxed);
                    *state = ClientState::Connecting {
                        attempt,
                        waiters: vec![tx],
                    };
                    tokio::spawn(establish(
                        Arc::clone(&self.shared),
                        Arc::clone(&self.config),
                        self.codec.clone(),
                        self.namespace.clone(),
                        attempt,
                    ));
                }
            }
        }
        rx.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// Closes the socket. An in-flight connect is rejected with
    /// [`ClientError::Disconnected`].
    pub async fn disconnect(&self) {
        let previous = {
            let mut state = self.shared.state.lock().await;
            std::mem::replace(&mut *state, ClientState::Closed)
        };
        match previous {
            ClientState::Connecting { waiters, .. } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(ClientError::Disconnected));
                }
                tracing::debug!(namespace = %self.config.namespace_id, "connect aborted");
            }
            ClientState::Open { socket, reader, .. } => {
                reader.abort();
                let _ = socket.close().await;
                tracing::info!(namespace = %self.config.namespace_id, "disconnected");
            }
            ClientState::Idle | ClientState::Closed => {}
        }
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.shared.state.lock().await, ClientState::Open { .. })
    }

    /// The id the server assigned in its `Joined` ack, while open.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        match &*self.shared.state.lock().await {
            ClientState::Open { connection_id, .. } => Some(*connection_id),
            _ => None,
        }
    }

    /// Sends a `Ping` stamped with the current time. The server echoes it
    /// and the reader records the round trip; see [`last_rtt`](Self::last_rtt).
    ///
    /// # Errors
    /// [`ClientError::Disconnected`] when not open.
    pub async fn ping(&self) -> Result<(), RoomsyncError> {
        let socket = self
            .shared
            .open_socket()
            .await
            .ok_or(ClientError::Disconnected)?;
        send_ping(&socket, &self.codec).await
    }

    /// The most recent ping round trip, if any has completed.
    pub fn last_rtt(&self) -> Option<Duration> {
        match self.shared.last_rtt_ms.load(Ordering::Relaxed) {
            NO_RTT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl<C: Codec + Clone> Drop for RoomsyncClient<C> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            if let ClientState::Open { reader, .. } = &*state {
                reader.abort();
            }
            *state = ClientState::Closed;
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Drains the namespace's outbound frames into the socket, but only while
/// it is open.
async fn forward_outbound(shared: Arc<Shared>, mut queue: PeerReceiver) {
    while let Some(frame) = queue.recv().await {
        match shared.open_socket().await {
            Some(socket) if socket.is_open() => {
                if let Err(e) = socket.send(&frame).await {
                    tracing::debug!(error = %e, "frame write failed");
                }
            }
            _ => tracing::debug!("not connected, dropping outbound frame"),
        }
    }
}

/// Runs one connect attempt and settles its waiters.
async fn establish<C: Codec + Clone>(
    shared: Arc<Shared>,
    config: Arc<ClientConfig>,
    codec: C,
    namespace: NamespaceHandle,
    attempt: u64,
) {
    let joining = open_and_join(&config, &codec, &namespace);
    let outcome = match timeout(config.connect_timeout, joining).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ClientError::Timeout),
    };

    let mut state = shared.state.lock().await;
    let waiters = match &mut *state {
        ClientState::Connecting {
            attempt: current,
            waiters,
        } if *current == attempt => Some(std::mem::take(waiters)),
        _ => None,
    };
    let Some(waiters) = waiters else {
        // disconnect() got here first.
        drop(state);
        if let Ok((socket, _)) = outcome {
            let _ = socket.close().await;
        }
        return;
    };

    let result = match outcome {
        Ok((socket, joined)) => {
            let connection_id = ConnectionId::new(joined.connection_id);
            tracing::info!(
                namespace = %joined.namespace_id,
                connection = %connection_id,
                "connected"
            );
            let reader = tokio::spawn(read_loop(
                Arc::clone(&shared),
                Arc::clone(&socket),
                codec,
                namespace,
                config.ping_interval,
                attempt,
            ));
            *state = ClientState::Open {
                attempt,
                socket,
                connection_id,
                reader,
            };
            Ok(())
        }
        Err(e) => {
            tracing::warn!(url = %config.url, error = %e, "connect failed");
            *state = ClientState::Closed;
            Err(e)
        }
    };
    drop(state);

    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

/// Opens the socket, sends the handshake, waits for `Joined`, and applies
/// the snapshots that follow it.
///
/// The snapshots are queued into the namespace before `connect()`
/// resolves, so a write made right after connecting can't be wiped by a
/// snapshot still in flight.
async fn open_and_join<C: Codec>(
    config: &ClientConfig,
    codec: &C,
    namespace: &NamespaceHandle,
) -> Result<(Arc<WebSocketConnection>, Joined), ClientError> {
    let socket = WebSocketConnection::connect(&config.url)
        .await
        .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

    let handshake = Handshake {
        version: PROTOCOL_VERSION,
        namespace_id: config.namespace_id.clone(),
        caller_id: config.caller_id.clone(),
        token: config.token.clone(),
    };
    let frame = Envelope::frame(codec, MessageType::Handshake, &handshake)
        .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
    socket
        .send(&frame)
        .await
        .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

    let envelope = next_envelope(&socket, codec).await?;
    match envelope.kind {
        MessageType::Joined => {
            let joined: Joined = envelope
                .open(codec)
                .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
            for _ in 0..joined.snapshots {
                let snapshot = next_envelope(&socket, codec).await?;
                if snapshot.kind != MessageType::FullExport {
                    return Err(ClientError::ConnectFailed(format!(
                        "expected FullExport, got {}",
                        snapshot.kind
                    )));
                }
                namespace
                    .import(snapshot.payload)
                    .await
                    .map_err(|_| ClientError::Disconnected)?;
            }
            Ok((Arc::new(socket), joined))
        }
        MessageType::Error => {
            let error: ErrorMessage = envelope
                .open(codec)
                .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
            Err(ClientError::HandshakeRejected {
                code: error.code,
                message: error.message,
            })
        }
        other => Err(ClientError::ConnectFailed(format!(
            "expected Joined, got {other}"
        ))),
    }
}

async fn next_envelope<C: Codec>(
    socket: &WebSocketConnection,
    codec: &C,
) -> Result<Envelope, ClientError> {
    let data = match socket.recv().await {
        Ok(Some(data)) => data,
        Ok(None) => return Err(ClientError::Disconnected),
        Err(e) => return Err(ClientError::ConnectFailed(e.to_string())),
    };
    codec
        .decode(&data)
        .map_err(|e| ClientError::ConnectFailed(e.to_string()))
}

/// Reads frames until the socket closes, feeding the namespace and
/// sending keepalive pings.
async fn read_loop<C: Codec>(
    shared: Arc<Shared>,
    socket: Arc<WebSocketConnection>,
    codec: C,
    namespace: NamespaceHandle,
    ping_interval: Duration,
    attempt: u64,
) {
    let mut keepalive = (!ping_interval.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_interval,
            ping_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let data = tokio::select! {
            received = socket.recv() => match received {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "recv error");
                    break;
                }
            },
            () = tick(&mut keepalive) => {
                if let Err(e) = send_ping(&socket, &codec).await {
                    tracing::debug!(error = %e, "keepalive ping failed");
                }
                continue;
            }
        };

        let envelope: Envelope = match codec.decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "failed to decode envelope");
                continue;
            }
        };

        let delivered = match envelope.kind {
            MessageType::CollectionMutation => {
                namespace.inbound(None, envelope.payload, false).await
            }
            MessageType::FullExport => namespace.import(envelope.payload).await,
            MessageType::Ping => {
                if let Some(sent) = envelope.timestamp_millis() {
                    let rtt = now_millis().saturating_sub(sent);
                    shared.last_rtt_ms.store(rtt, Ordering::Relaxed);
                    tracing::trace!(rtt_ms = rtt, "pong");
                }
                Ok(())
            }
            MessageType::Error => {
                match envelope.open::<C, ErrorMessage>(&codec) {
                    Ok(error) => tracing::warn!(
                        code = error.code,
                        message = %error.message,
                        "server error"
                    ),
                    Err(e) => tracing::debug!(error = %e, "malformed error frame"),
                }
                Ok(())
            }
            other => {
                tracing::debug!(kind = %other, "ignoring unexpected frame");
                Ok(())
            }
        };
        if let Err(e) = delivered {
            tracing::debug!(error = %e, "namespace stopped, closing");
            let _ = socket.close().await;
            break;
        }
    }

    if shared.close_attempt(attempt).await {
        tracing::info!(namespace = %namespace.id(), "connection closed by server");
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_ping(socket: &WebSocketConnection, codec: &impl Codec) -> Result<(), RoomsyncError> {
    let frame = codec.encode(&Envelope::new(MessageType::Ping, Vec::new()))?;
    socket.send(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("ws://127.0.0.1:1", "lobby");
        assert_eq!(config.namespace_id, NamespaceId::from("lobby"));
        assert!(config.caller_id.starts_with("client-"));
        assert_eq!(config.token, None);
        assert!(config.collection_types.is_empty());
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_client_config_setters() {
        let config = ClientConfig::new("ws://127.0.0.1:1", "lobby")
            .caller_id("alice")
            .token("secret")
            .collection_types(["score"])
            .ping_interval(Duration::ZERO);
        assert_eq!(config.caller_id, "alice");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.collection_types, vec![CollectionTypeId::from("score")]);
        assert!(config.ping_interval.is_zero());
    }

    #[test]
    fn test_client_error_is_cloneable_for_shared_waiters() {
        let err = ClientError::HandshakeRejected {
            code: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(err.clone(), err);
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_new_without_server_starts_idle() {
        let mut registry = CollectionRegistry::new();
        registry
            .register::<i64>("score", roomsync_collection::CollectionConfig::default())
            .unwrap();
        let client =
            RoomsyncClient::new(ClientConfig::new("ws://127.0.0.1:1", "lobby"), registry, JsonCodec)
                .unwrap();

        assert!(!client.is_open().await);
        assert!(client.last_rtt().is_none());
        assert!(matches!(
            client.ping().await,
            Err(RoomsyncError::Client(ClientError::Disconnected))
        ));

        // Local writes work offline.
        client.collection::<i64>("score").add_item("me", 1).await.unwrap();
        assert_eq!(client.collection::<i64>("score").get_item("me").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_unregistered_collection_type_fails_new() {
        let config = ClientConfig::new("ws://127.0.0.1:1", "lobby").collection_types(["score"]);
        let result = RoomsyncClient::new(config, CollectionRegistry::new(), JsonCodec);
        assert!(matches!(result, Err(RoomsyncError::Namespace(_))));
    }
}
