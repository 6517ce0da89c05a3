//! Namespace actor: an isolated Tokio task that owns a [`Namespace`].
//!
//! Everything that touches the namespace arrives over one mpsc channel:
//! wire frames from connections, snapshot imports, membership changes,
//! and consumer closures. The same loop sleeps until the earliest throttle
//! deadline, so a timer flush can never interleave with a mutation.
//!
//! After every step the collection outbox is drained, each frame is
//! wrapped in an envelope with the wire codec, and the [`Role`] decides
//! who gets it.

use std::collections::HashMap;

use roomsync_collection::{outbox, CollectionRegistry, OutboxReceiver, RemoteOrigin};
use roomsync_protocol::{
    Codec, CollectionMutation, CollectionTypeId, ConnectionId, Envelope, FullExport,
    MessageType, NamespaceId,
};
use roomsync_transport::PeerSender;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::{Namespace, NamespaceError, NamespaceHandle};

/// Command channel size for namespace actors.
const CHANNEL_SIZE: usize = 256;

/// A closure run against the namespace inside its actor.
pub(crate) type NamespaceJob = Box<dyn FnOnce(&mut Namespace) + Send>;

/// Commands sent to a namespace actor.
pub(crate) enum NamespaceCommand {
    /// An encoded [`CollectionMutation`] body received from a peer.
    Inbound {
        sender: Option<ConnectionId>,
        payload: Vec<u8>,
        rebroadcast: bool,
    },

    /// An encoded [`FullExport`] body received from the server.
    Import { payload: Vec<u8> },

    /// Add a member (server role). Replies with the number of snapshot
    /// frames sent to it.
    Join {
        connection_id: ConnectionId,
        sender: PeerSender,
        reply: oneshot::Sender<Result<usize, NamespaceError>>,
    },

    /// Remove a member (server role). Replies whether it was a member.
    Leave {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },

    Run(NamespaceJob),

    Info {
        reply: oneshot::Sender<NamespaceInfo>,
    },

    Shutdown,
}

/// Who receives the frames a namespace emits.
pub enum Role {
    /// Client side: everything goes to the one server connection.
    Client { server: PeerSender },
    /// Server side: everything goes to every member, minus the excluded
    /// sender of a rebroadcast frame.
    Server {
        members: HashMap<ConnectionId, PeerSender>,
    },
}

impl Role {
    /// A server role with no members yet.
    pub fn server() -> Self {
        Self::Server {
            members: HashMap::new(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Client { .. } => "client",
            Self::Server { .. } => "server",
        }
    }

    fn member_count(&self) -> usize {
        match self {
            Self::Client { .. } => 0,
            Self::Server { members } => members.len(),
        }
    }

    /// Queues `frame` for every recipient except `exclude`. Dead queues
    /// are skipped silently; the connection's own cleanup removes them.
    fn broadcast(&self, frame: &[u8], exclude: Option<ConnectionId>) -> usize {
        match self {
            Self::Client { server } => usize::from(server.send(frame.to_vec()).is_ok()),
            Self::Server { members } => members
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .filter(|(_, sender)| sender.send(frame.to_vec()).is_ok())
                .count(),
        }
    }
}

/// A snapshot of namespace metadata.
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub id: NamespaceId,
    pub created_at: Instant,
    /// `"client"` or `"server"`.
    pub role: &'static str,
    pub members: usize,
    /// When the last inbound mutation arrived, or `created_at` if none has.
    pub last_activity: Instant,
    /// Record counts per collection, sorted by type id.
    pub collections: Vec<(CollectionTypeId, usize)>,
}

struct NamespaceActor<C: Codec> {
    namespace: Namespace,
    role: Role,
    codec: C,
    outbox: OutboxReceiver,
    receiver: mpsc::Receiver<NamespaceCommand>,
    last_activity: Instant,
}

impl<C: Codec> NamespaceActor<C> {
    async fn run(mut self) {
        let id = self.namespace.id().clone();
        tracing::info!(namespace = %id, role = self.role.name(), "namespace actor started");

        loop {
            let deadline = self.namespace.next_due();
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle(cmd) {
                        break;
                    }
                }
                () = sleep_until(deadline) => {
                    self.namespace.flush_due(Instant::now());
                }
            }
            self.route_outbox();
        }

        tracing::info!(namespace = %id, "namespace actor stopped");
    }

    /// Returns `false` on shutdown.
    fn handle(&mut self, cmd: NamespaceCommand) -> bool {
        match cmd {
            NamespaceCommand::Inbound {
                sender,
                payload,
                rebroadcast,
            } => {
                self.last_activity = Instant::now();
                self.handle_inbound(sender, &payload, rebroadcast);
            }
            NamespaceCommand::Import { payload } => self.handle_import(&payload),
            NamespaceCommand::Join {
                connection_id,
                sender,
                reply,
            } => {
                let result = self.handle_join(connection_id, sender);
                let _ = reply.send(result);
            }
            NamespaceCommand::Leave {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.handle_leave(connection_id));
            }
            NamespaceCommand::Run(job) => job(&mut self.namespace),
            NamespaceCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            NamespaceCommand::Shutdown => {
                tracing::info!(namespace = %self.namespace.id(), "namespace shutting down");
                return false;
            }
        }
        true
    }

    fn handle_inbound(&mut self, sender: Option<ConnectionId>, payload: &[u8], rebroadcast: bool) {
        let mutation: CollectionMutation = match self.codec.decode(payload) {
            Ok(mutation) => mutation,
            Err(e) => {
                tracing::debug!(
                    namespace = %self.namespace.id(),
                    error = %e,
                    "malformed collection mutation, dropping"
                );
                return;
            }
        };
        let origin = RemoteOrigin {
            sender,
            rebroadcast,
        };
        self.namespace.handle_message(&mutation, origin);
    }

    fn handle_import(&mut self, payload: &[u8]) {
        let export: FullExport = match self.codec.decode(payload) {
            Ok(export) => export,
            Err(e) => {
                tracing::debug!(namespace = %self.namespace.id(), error = %e, "malformed snapshot, dropping");
                return;
            }
        };
        let type_id = export.collection_type_id.clone();
        // A client's mirror follows the server's snapshot exactly.
        let result = match self.role {
            Role::Client { .. } => self.namespace.replace_collection(export),
            Role::Server { .. } => self.namespace.import_collection(export),
        };
        match result {
            Ok(count) => {
                tracing::debug!(namespace = %self.namespace.id(), collection = %type_id, count, "snapshot applied");
            }
            Err(NamespaceError::UnknownCollectionType(_)) => {
                tracing::warn!(namespace = %self.namespace.id(), collection = %type_id, "snapshot for unknown collection type, dropping");
            }
            Err(e) => {
                tracing::debug!(namespace = %self.namespace.id(), collection = %type_id, error = %e, "snapshot rejected");
            }
        }
    }

    /// Adds the member and sends it one snapshot frame per collection in
    /// the same step, so nothing emitted afterwards can overtake it.
    fn handle_join(&mut self, connection_id: ConnectionId, sender: PeerSender) -> Result<usize, NamespaceError> {
        let Role::Server { members } = &mut self.role else {
            return Err(NamespaceError::NotServerRole(self.namespace.id().clone()));
        };

        let mut sent = 0;
        for export in self.namespace.export_all()? {
            let frame = Envelope::frame(&self.codec, MessageType::FullExport, &export)?;
            if sender.send(frame).is_ok() {
                sent += 1;
            }
        }
        members.insert(connection_id, sender);
        tracing::info!(
            namespace = %self.namespace.id(),
            connection = %connection_id,
            members = members.len(),
            snapshots = sent,
            "member joined"
        );
        Ok(sent)
    }

    fn handle_leave(&mut self, connection_id: ConnectionId) -> bool {
        let Role::Server { members } = &mut self.role else {
            return false;
        };
        let removed = members.remove(&connection_id).is_some();
        if removed {
            tracing::info!(
                namespace = %self.namespace.id(),
                connection = %connection_id,
                members = members.len(),
                "member left"
            );
        }
        removed
    }

    fn route_outbox(&mut self) {
        while let Ok(outbound) = self.outbox.try_recv() {
            let frame = match Envelope::frame(
                &self.codec,
                MessageType::CollectionMutation,
                &outbound.mutation,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(namespace = %self.namespace.id(), error = %e, "failed to frame mutation");
                    continue;
                }
            };
            let delivered = self.role.broadcast(&frame, outbound.exclude);
            tracing::trace!(
                namespace = %self.namespace.id(),
                collection = %outbound.mutation.collection_type_id,
                event = %outbound.mutation.event,
                delivered,
                "mutation routed"
            );
        }
    }

    fn info(&self) -> NamespaceInfo {
        NamespaceInfo {
            id: self.namespace.id().clone(),
            created_at: self.namespace.created_at(),
            role: self.role.name(),
            members: self.role.member_count(),
            last_activity: self.last_activity,
            collections: self.namespace.sizes(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Builds a namespace from the registry and spawns its actor.
///
/// # Errors
/// [`NamespaceError::UnknownCollectionType`] if any type id isn't
/// registered.
pub fn spawn_namespace<C: Codec>(
    id: NamespaceId,
    type_ids: impl IntoIterator<Item = CollectionTypeId>,
    registry: &CollectionRegistry,
    role: Role,
    codec: C,
) -> Result<NamespaceHandle, NamespaceError> {
    let (outbox_tx, outbox_rx) = outbox();
    let namespace = Namespace::new(id.clone(), type_ids, registry, outbox_tx)?;
    let last_activity = namespace.created_at();
    let (tx, rx) = mpsc::channel(CHANNEL_SIZE);

    let actor = NamespaceActor {
        namespace,
        role,
        codec,
        outbox: outbox_rx,
        receiver: rx,
        last_activity,
    };
    tokio::spawn(actor.run());

    Ok(NamespaceHandle::new(id, tx))
}
