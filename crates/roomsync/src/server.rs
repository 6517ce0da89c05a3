//! `RoomsyncServer` builder, accept loop, and idle reaper.
//!
//! This is the entry point for running a Roomsync server. It ties together
//! all the layers: transport → protocol → session → namespace.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use roomsync_collection::CollectionRegistry;
use roomsync_namespace::{NamespaceError, NamespaceHandle, NamespaceManager};
use roomsync_protocol::{Codec, CollectionTypeId, ConnectionId, JsonCodec, NamespaceId};
use roomsync_session::{Authenticator, ConnectionRegistry};
use roomsync_transport::WebSocketTransport;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::handler::handle_connection;
use crate::RoomsyncError;

/// Timeouts and intervals for a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long an empty namespace may sit idle before it is reaped.
    pub namespace_timeout: Duration,
    /// How often the reaper looks for idle namespaces.
    pub reap_interval: Duration,
    /// How long a new socket has to finish the WebSocket upgrade, and
    /// then again to send its `Handshake`.
    pub handshake_timeout: Duration,
    /// A joined socket that sends nothing for this long is dropped.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared server state passed to each connection handler task.
///
/// Neither lock is held across a socket write.
pub(crate) struct ServerState<A: Authenticator, C: Codec> {
    pub(crate) connections: Mutex<ConnectionRegistry<A::Session>>,
    pub(crate) namespaces: Mutex<NamespaceManager<C>>,
    pub(crate) auth: A,
    pub(crate) codec: C,
    pub(crate) config: ServerConfig,
}

/// Builder for configuring and starting a Roomsync server.
///
/// # Example
///
/// ```rust,ignore
/// use roomsync::prelude::*;
///
/// let server = RoomsyncServer::builder()
///     .bind("0.0.0.0:8080")
///     .collection_types(["score", "chat"])
///     .namespace_timeout(Duration::from_secs(120))
///     .build(registry, AllowAll)
///     .await?;
/// server.run().await
/// ```
pub struct RoomsyncServerBuilder<C = JsonCodec> {
    bind_addr: String,
    type_ids: Vec<CollectionTypeId>,
    config: ServerConfig,
    codec: C,
}

impl RoomsyncServerBuilder<JsonCodec> {
    /// Creates a new builder with default settings and the JSON codec.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            type_ids: Vec::new(),
            config: ServerConfig::default(),
            codec: JsonCodec,
        }
    }
}

impl Default for RoomsyncServerBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec + Clone> RoomsyncServerBuilder<C> {
    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Declares the collection types every namespace gets.
    ///
    /// When never called, every type in the registry is used.
    pub fn collection_types<I, T>(mut self, type_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CollectionTypeId>,
    {
        self.type_ids = type_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn namespace_timeout(mut self, timeout: Duration) -> Self {
        self.config.namespace_timeout = timeout;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Replaces every timeout and interval at once.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Switches the wire codec. Clients must use the same one.
    pub fn codec<C2: Codec + Clone>(self, codec: C2) -> RoomsyncServerBuilder<C2> {
        RoomsyncServerBuilder {
            bind_addr: self.bind_addr,
            type_ids: self.type_ids,
            config: self.config,
            codec,
        }
    }

    /// Binds the listener and builds the server.
    ///
    /// # Errors
    /// - [`NamespaceError::UnknownCollectionType`] if a declared type isn't
    ///   in the registry
    /// - a transport error if the address can't be bound
    pub async fn build<A: Authenticator>(
        self,
        registry: impl Into<Arc<CollectionRegistry>>,
        auth: A,
    ) -> Result<RoomsyncServer<A, C>, RoomsyncError> {
        let registry = registry.into();
        let type_ids = if self.type_ids.is_empty() {
            registry.type_ids()
        } else {
            self.type_ids
        };
        if let Some(missing) = type_ids.iter().find(|t| !registry.contains(t)) {
            return Err(NamespaceError::UnknownCollectionType(missing.clone()).into());
        }

        let transport = WebSocketTransport::bind(&self.bind_addr).await?;
        tracing::debug!(
            addr = %self.bind_addr,
            collections = type_ids.len(),
            "server bound"
        );

        let state = Arc::new(ServerState {
            connections: Mutex::new(ConnectionRegistry::new()),
            namespaces: Mutex::new(NamespaceManager::new(
                registry,
                type_ids,
                self.codec.clone(),
            )),
            auth,
            codec: self.codec,
            config: self.config,
        });

        Ok(RoomsyncServer { transport, state })
    }
}

/// A Roomsync server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct RoomsyncServer<A: Authenticator, C: Codec = JsonCodec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, C>>,
}

impl RoomsyncServer<roomsync_session::AllowAll, JsonCodec> {
    /// Creates a new builder.
    pub fn builder() -> RoomsyncServerBuilder {
        RoomsyncServerBuilder::new()
    }
}

impl<A, C> RoomsyncServer<A, C>
where
    A: Authenticator,
    C: Codec + Clone,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// A handle for reaching connections and namespaces while the server
    /// runs.
    pub fn handle(&self) -> RoomsyncServerHandle<A, C> {
        RoomsyncServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Runs the server accept loop.
    ///
    /// Starts the idle reaper, then accepts incoming connections and spawns
    /// a handler task for each. Runs until the process is terminated.
    pub async fn run(mut self) -> Result<(), RoomsyncError> {
        tracing::info!("Roomsync server running");
        tokio::spawn(reap_loop(Arc::clone(&self.state)));

        loop {
            match self.transport.accept_tcp().await {
                Ok(pending) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let addr = pending.peer_addr();
                        let upgrade = timeout(state.config.handshake_timeout, pending.upgrade());
                        let conn = match upgrade.await {
                            Ok(Ok(conn)) => conn,
                            Ok(Err(e)) => {
                                tracing::debug!(%addr, error = %e, "websocket upgrade failed");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(%addr, "websocket upgrade timed out");
                                return;
                            }
                        };
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Periodically destroys namespaces with no members that have been idle
/// for longer than the namespace timeout.
async fn reap_loop<A: Authenticator, C: Codec + Clone>(state: Arc<ServerState<A, C>>) {
    let mut interval = tokio::time::interval(state.config.reap_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let reaped = state
            .namespaces
            .lock()
            .await
            .reap_idle(Instant::now(), state.config.namespace_timeout)
            .await;
        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "reaper pass");
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable access to a running server's connections and namespaces.
pub struct RoomsyncServerHandle<A: Authenticator, C: Codec = JsonCodec> {
    state: Arc<ServerState<A, C>>,
}

impl<A: Authenticator, C: Codec> Clone for RoomsyncServerHandle<A, C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A: Authenticator, C: Codec> fmt::Debug for RoomsyncServerHandle<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomsyncServerHandle").finish_non_exhaustive()
    }
}

impl<A, C> RoomsyncServerHandle<A, C>
where
    A: Authenticator,
    C: Codec + Clone,
{
    /// Queues a raw frame for one connection.
    ///
    /// Returns `false` if the connection isn't registered. Frames queued
    /// for a socket that has since closed are dropped by its writer.
    pub async fn send(&self, connection_id: ConnectionId, frame: Vec<u8>) -> bool {
        self.state.connections.lock().await.send(connection_id, frame)
    }

    /// The live namespace with this id, if any.
    pub async fn namespace(&self, id: &NamespaceId) -> Option<NamespaceHandle> {
        self.state.namespaces.lock().await.get(id)
    }

    /// Returns the namespace, creating it (empty, no members) if needed.
    /// It is reaped like any other once idle.
    pub async fn get_or_create_namespace(
        &self,
        id: &NamespaceId,
    ) -> Result<NamespaceHandle, RoomsyncError> {
        Ok(self.state.namespaces.lock().await.get_or_create(id)?)
    }

    /// A copy of the session data the authenticator produced for a
    /// connection.
    pub async fn session(&self, connection_id: ConnectionId) -> Option<A::Session>
    where
        A::Session: Clone,
    {
        self.state.connections.lock().await.session(connection_id).cloned()
    }

    pub async fn namespace_count(&self) -> usize {
        self.state.namespaces.lock().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.connections.lock().await.len()
    }

    /// Ids of every connection joined to a namespace, sorted.
    pub async fn connections_in(&self, id: &NamespaceId) -> Vec<ConnectionId> {
        self.state.connections.lock().await.connections_in(id)
    }

    /// Runs one reaper pass now and returns the reaped ids.
    pub async fn reap_idle(&self) -> Vec<NamespaceId> {
        self.state
            .namespaces
            .lock()
            .await
            .reap_idle(Instant::now(), self.state.config.namespace_timeout)
            .await
    }
}
