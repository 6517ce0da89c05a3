//! Handles for talking to a running namespace actor.

use std::fmt;
use std::marker::PhantomData;

use roomsync_collection::{Collection, CollectionItem, Notification, SubscriptionId};
use roomsync_protocol::{CollectionEvent, CollectionTypeId, ConnectionId, FullExport, NamespaceId};
use roomsync_transport::PeerSender;
use tokio::sync::{mpsc, oneshot};

use crate::actor::{NamespaceCommand, NamespaceJob};
use crate::{Namespace, NamespaceError, NamespaceInfo};

/// Handle to a running namespace actor.
///
/// Cheap to clone; every clone talks to the same task. Once the actor has
/// stopped, every call fails with [`NamespaceError::Unavailable`].
#[derive(Clone)]
pub struct NamespaceHandle {
    id: NamespaceId,
    sender: mpsc::Sender<NamespaceCommand>,
}

impl fmt::Debug for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("id", &self.id)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl NamespaceHandle {
    pub(crate) fn new(id: NamespaceId, sender: mpsc::Sender<NamespaceCommand>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> &NamespaceId {
        &self.id
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, cmd: NamespaceCommand) -> Result<(), NamespaceError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| NamespaceError::Unavailable(self.id.clone()))
    }

    /// Delivers an encoded `CollectionMutation` body (fire-and-forget).
    ///
    /// With `rebroadcast`, the applied mutation is relayed to every other
    /// member, never back to `sender`.
    pub async fn inbound(
        &self,
        sender: Option<ConnectionId>,
        payload: Vec<u8>,
        rebroadcast: bool,
    ) -> Result<(), NamespaceError> {
        self.send(NamespaceCommand::Inbound {
            sender,
            payload,
            rebroadcast,
        })
        .await
    }

    /// Delivers an encoded `FullExport` body (fire-and-forget).
    ///
    /// On a client namespace the snapshot replaces the collection's
    /// contents; on a server namespace it is merged in.
    pub async fn import(&self, payload: Vec<u8>) -> Result<(), NamespaceError> {
        self.send(NamespaceCommand::Import { payload }).await
    }

    /// Adds a member and sends it a snapshot of every collection. Returns
    /// the number of snapshot frames queued.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        sender: PeerSender,
    ) -> Result<usize, NamespaceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(NamespaceCommand::Join {
            connection_id,
            sender,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| NamespaceError::Unavailable(self.id.clone()))?
    }

    /// Removes a member. Returns whether it was one.
    pub async fn leave(&self, connection_id: ConnectionId) -> Result<bool, NamespaceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(NamespaceCommand::Leave {
            connection_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| NamespaceError::Unavailable(self.id.clone()))
    }

    /// Runs `f` against the namespace inside the actor and returns its
    /// result. Frames the closure causes are routed before the next
    /// command is processed.
    pub async fn with_namespace<R, F>(&self, f: F) -> Result<R, NamespaceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Namespace) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: NamespaceJob = Box::new(move |namespace| {
            let _ = reply_tx.send(f(namespace));
        });
        self.send(NamespaceCommand::Run(job)).await?;
        reply_rx
            .await
            .map_err(|_| NamespaceError::Unavailable(self.id.clone()))
    }

    /// Snapshots every collection.
    pub async fn export_all(&self) -> Result<Vec<FullExport>, NamespaceError> {
        self.with_namespace(|namespace| namespace.export_all()).await?
    }

    pub async fn info(&self) -> Result<NamespaceInfo, NamespaceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(NamespaceCommand::Info { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| NamespaceError::Unavailable(self.id.clone()))
    }

    /// Stops the actor. Pending throttled updates are discarded.
    pub async fn shutdown(&self) -> Result<(), NamespaceError> {
        self.send(NamespaceCommand::Shutdown).await
    }

    /// Typed access to one collection of this namespace.
    ///
    /// The type is checked on each call, not here.
    pub fn collection<T: CollectionItem>(
        &self,
        type_id: impl Into<CollectionTypeId>,
    ) -> CollectionHandle<T> {
        CollectionHandle {
            namespace: self.clone(),
            type_id: type_id.into(),
            _record: PhantomData,
        }
    }
}

// ---------------------------------------------------------------------------
// CollectionHandle
// ---------------------------------------------------------------------------

/// Async, typed facade over one collection inside a namespace actor.
///
/// Each call is one round trip to the actor. Reads return clones.
pub struct CollectionHandle<T> {
    namespace: NamespaceHandle,
    type_id: CollectionTypeId,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for CollectionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            type_id: self.type_id.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> fmt::Debug for CollectionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("namespace", &self.namespace.id)
            .field("type_id", &self.type_id)
            .finish()
    }
}

impl<T: CollectionItem> CollectionHandle<T> {
    pub fn collection_type(&self) -> &CollectionTypeId {
        &self.type_id
    }

    async fn with<R, F>(&self, f: F) -> Result<R, NamespaceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Collection<T>) -> Result<R, NamespaceError> + Send + 'static,
    {
        let type_id = self.type_id.clone();
        self.namespace
            .with_namespace(move |namespace| f(namespace.collection_mut::<T>(&type_id)?))
            .await?
    }

    pub async fn add_item(&self, id: impl Into<String>, data: T) -> Result<(), NamespaceError> {
        let id = id.into();
        self.with(move |c| Ok(c.add_item(id, data)?)).await
    }

    pub async fn update_item(&self, id: impl Into<String>, data: T) -> Result<(), NamespaceError> {
        let id = id.into();
        self.with(move |c| Ok(c.update_item(id, data)?)).await
    }

    /// See [`Collection::patch_item`].
    pub async fn patch_item(
        &self,
        id: impl Into<String>,
        fields: serde_json::Value,
    ) -> Result<(), NamespaceError> {
        let id = id.into();
        self.with(move |c| Ok(c.patch_item(id, fields)?)).await
    }

    /// See [`Collection::modify_item`]. Returns whether an update was sent.
    pub async fn modify_item<F>(&self, id: impl Into<String>, write: F) -> Result<bool, NamespaceError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let id = id.into();
        self.with(move |c| Ok(c.modify_item(&id, write)?)).await
    }

    pub async fn remove_item(&self, id: impl Into<String>) -> Result<Option<T>, NamespaceError> {
        let id = id.into();
        self.with(move |c| Ok(c.remove_item(&id))).await
    }

    pub async fn get_item(&self, id: impl Into<String>) -> Result<Option<T>, NamespaceError> {
        let id = id.into();
        self.with(move |c| Ok(c.get_item(&id).cloned())).await
    }

    /// Every record, sorted by id.
    pub async fn items(&self) -> Result<Vec<(String, T)>, NamespaceError> {
        self.with(|c| {
            let mut items: Vec<_> = c
                .items()
                .map(|(id, data)| (id.to_owned(), data.clone()))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(items)
        })
        .await
    }

    /// `id = None` changes the collection default.
    pub async fn set_readonly(&self, readonly: bool, id: Option<String>) -> Result<(), NamespaceError> {
        self.with(move |c| Ok(c.set_readonly(readonly, id.as_deref())?)).await
    }

    /// Registers a callback that runs inside the namespace actor.
    pub async fn subscribe<F>(&self, kind: CollectionEvent, callback: F) -> Result<SubscriptionId, NamespaceError>
    where
        F: FnMut(&Notification<'_, T>) + Send + 'static,
    {
        self.with(move |c| Ok(c.subscribe(kind, callback))).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, NamespaceError> {
        self.with(move |c| Ok(c.unsubscribe(id))).await
    }

    pub async fn len(&self) -> Result<usize, NamespaceError> {
        self.with(|c| Ok(c.len())).await
    }

    pub async fn export(&self) -> Result<FullExport, NamespaceError> {
        self.with(|c| Ok(c.export()?)).await
    }
}
