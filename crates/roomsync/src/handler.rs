//! Per-connection handler: handshake, auth, and frame routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive Handshake → validate version
//!   2. Authenticate → get the session data
//!   3. Register, send Joined, join the namespace (which sends snapshots)
//!   4. Loop: receive envelopes → echo pings, route mutations

use std::sync::Arc;

use roomsync_namespace::NamespaceHandle;
use roomsync_protocol::{
    Codec, ConnectionId, Envelope, ErrorMessage, Handshake, Joined, MessageType, NamespaceId,
    ProtocolError, PROTOCOL_VERSION,
};
use roomsync_session::Authenticator;
use roomsync_transport::{outbound_queue, Connection, PeerSender, WebSocketConnection};
use tokio::time::timeout;

use crate::server::ServerState;
use crate::RoomsyncError;

/// Drop guard that removes a connection from the connection table and its
/// namespace when the handler exits.
///
/// This ensures cleanup happens even if the handler panics. Since `Drop`
/// is synchronous, we spawn a fire-and-forget task for the async locks.
struct ConnectionGuard<A: Authenticator, C: Codec + Clone> {
    connection_id: ConnectionId,
    namespace_id: NamespaceId,
    state: Arc<ServerState<A, C>>,
}

impl<A: Authenticator, C: Codec + Clone> Drop for ConnectionGuard<A, C> {
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        let namespace_id = self.namespace_id.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let record = state.connections.lock().await.disconnect(connection_id);
            let was_member = state
                .namespaces
                .lock()
                .await
                .leave(&namespace_id, connection_id)
                .await;
            tracing::info!(
                connection = %connection_id,
                namespace = %namespace_id,
                caller_id = record.as_ref().map_or("", |r| r.caller_id.as_str()),
                was_member,
                "connection left"
            );
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, C>>,
) -> Result<(), RoomsyncError>
where
    A: Authenticator,
    C: Codec + Clone,
{
    let conn = Arc::new(conn);
    let connection_id = conn.id();
    tracing::debug!(connection = %connection_id, "handling new connection");

    // --- Step 1: Handshake ---
    let (handshake, session) = perform_handshake(&conn, &state).await?;
    let Handshake {
        namespace_id,
        caller_id,
        ..
    } = handshake;

    // --- Step 2: Register; the guard is active as soon as the entry exists ---
    let (sender, queue) = outbound_queue();
    let writer = conn.spawn_writer(queue);
    state
        .connections
        .lock()
        .await
        .register(connection_id, caller_id.clone(), session, sender.clone())?;
    let _guard = ConnectionGuard {
        connection_id,
        namespace_id: namespace_id.clone(),
        state: Arc::clone(&state),
    };

    // --- Step 3: Ack, then join. Snapshots queue behind the ack. ---
    let snapshots = state.namespaces.lock().await.collection_types().len();
    let ack = Envelope::frame(
        &state.codec,
        MessageType::Joined,
        &Joined {
            connection_id: connection_id.into_inner(),
            namespace_id: namespace_id.clone(),
            snapshots: u32::try_from(snapshots).unwrap_or(u32::MAX),
        },
    )?;
    let _ = sender.send(ack);

    state
        .connections
        .lock()
        .await
        .join(connection_id, namespace_id.clone())?;
    let namespace = state
        .namespaces
        .lock()
        .await
        .join(&namespace_id, connection_id, sender.clone())
        .await?;
    tracing::info!(
        connection = %connection_id,
        namespace = %namespace_id,
        %caller_id,
        "connection joined"
    );

    // --- Step 4: Frame loop ---
    let result = message_loop(&conn, &state, &namespace, &sender).await;

    drop(sender);
    let _ = conn.close().await;
    writer.abort();
    // _guard drops here → connection table and namespace cleanup fires.
    result
}

async fn message_loop<A, C>(
    conn: &WebSocketConnection,
    state: &Arc<ServerState<A, C>>,
    namespace: &NamespaceHandle,
    sender: &PeerSender,
) -> Result<(), RoomsyncError>
where
    A: Authenticator,
    C: Codec + Clone,
{
    let connection_id = conn.id();

    loop {
        let data = match timeout(state.config.idle_timeout, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::debug!(connection = %connection_id, "connection closed cleanly");
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::debug!(connection = %connection_id, error = %e, "recv error");
                return Ok(());
            }
            Err(_) => {
                tracing::info!(connection = %connection_id, "connection timed out");
                return Ok(());
            }
        };

        let envelope: Envelope = match state.codec.decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(
                    connection = %connection_id,
                    error = %e,
                    "failed to decode envelope"
                );
                continue;
            }
        };

        match envelope.kind {
            MessageType::Ping => {
                // Echoed byte for byte so the client can read its own
                // timestamp back.
                let _ = sender.send(data);
            }
            MessageType::CollectionMutation => {
                // The actor timestamps it for the reaper.
                namespace
                    .inbound(Some(connection_id), envelope.payload, true)
                    .await?;
            }
            other => {
                tracing::debug!(
                    connection = %connection_id,
                    kind = %other,
                    "ignoring unexpected frame"
                );
            }
        }
    }
}

/// Receives the first frame, checks it is a `Handshake` for this protocol
/// version, and runs it past the authenticator.
async fn perform_handshake<A, C>(
    conn: &WebSocketConnection,
    state: &Arc<ServerState<A, C>>,
) -> Result<(Handshake, A::Session), RoomsyncError>
where
    A: Authenticator,
    C: Codec + Clone,
{
    let data = match timeout(state.config.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage(
                "connection closed before handshake".into(),
            )
            .into());
        }
        Ok(Err(e)) => return Err(RoomsyncError::Transport(e)),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let handshake = state
        .codec
        .decode::<Envelope>(&data)
        .ok()
        .filter(|envelope| envelope.kind == MessageType::Handshake)
        .and_then(|envelope| envelope.open::<C, Handshake>(&state.codec).ok());
    let Some(handshake) = handshake else {
        send_error(conn, &state.codec, 400, "expected Handshake").await?;
        return Err(ProtocolError::InvalidMessage("first message must be Handshake".into()).into());
    };

    if handshake.version != PROTOCOL_VERSION {
        send_error(
            conn,
            &state.codec,
            400,
            &format!(
                "version mismatch: expected {PROTOCOL_VERSION}, got {}",
                handshake.version
            ),
        )
        .await?;
        return Err(ProtocolError::InvalidMessage("protocol version mismatch".into()).into());
    }

    let session = match state.auth.authenticate(&handshake).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(
                connection = %conn.id(),
                namespace = %handshake.namespace_id,
                caller_id = %handshake.caller_id,
                error = %e,
                "handshake rejected"
            );
            send_error(conn, &state.codec, 401, "unauthorized").await?;
            return Err(RoomsyncError::Session(e));
        }
    };

    Ok((handshake, session))
}

/// Writes an `Error` envelope straight to the socket.
async fn send_error(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    code: u16,
    message: &str,
) -> Result<(), RoomsyncError> {
    let bytes = Envelope::frame(
        codec,
        MessageType::Error,
        &ErrorMessage {
            code,
            message: message.to_string(),
        },
    )?;
    conn.send(&bytes).await?;
    Ok(())
}
