//! Namespace manager: lazy creation, membership, and idle reaping on the
//! server.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use roomsync_collection::CollectionRegistry;
use roomsync_protocol::{Codec, CollectionTypeId, ConnectionId, NamespaceId};
use roomsync_transport::PeerSender;
use tokio::time::Instant;

use crate::{spawn_namespace, NamespaceError, NamespaceHandle, Role};

struct NamespaceEntry {
    handle: NamespaceHandle,
    created_at: Instant,
    last_activity: Instant,
    members: HashSet<ConnectionId>,
}

impl NamespaceEntry {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at.max(self.last_activity))
    }
}

/// Tracks every server-side namespace and which connections are in it.
///
/// Namespaces are created on first reference with the server's declared
/// collection types and destroyed by [`reap_idle`](Self::reap_idle) once
/// they have no members and no recent traffic. The server keeps this
/// behind one mutex so a join can never race a reap.
pub struct NamespaceManager<C> {
    registry: Arc<CollectionRegistry>,
    type_ids: Vec<CollectionTypeId>,
    codec: C,
    namespaces: HashMap<NamespaceId, NamespaceEntry>,
}

impl<C: Codec + Clone> NamespaceManager<C> {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        mut type_ids: Vec<CollectionTypeId>,
        codec: C,
    ) -> Self {
        type_ids.sort();
        type_ids.dedup();
        Self {
            registry,
            type_ids,
            codec,
            namespaces: HashMap::new(),
        }
    }

    /// Returns the namespace's handle, spawning it first if needed.
    ///
    /// # Errors
    /// [`NamespaceError::UnknownCollectionType`] if a declared type id
    /// isn't registered.
    pub fn get_or_create(&mut self, id: &NamespaceId) -> Result<NamespaceHandle, NamespaceError> {
        if let Some(entry) = self.namespaces.get(id) {
            return Ok(entry.handle.clone());
        }

        let handle = spawn_namespace(
            id.clone(),
            self.type_ids.iter().cloned(),
            &self.registry,
            Role::server(),
            self.codec.clone(),
        )?;
        let now = Instant::now();
        self.namespaces.insert(
            id.clone(),
            NamespaceEntry {
                handle: handle.clone(),
                created_at: now,
                last_activity: now,
                members: HashSet::new(),
            },
        );
        tracing::info!(namespace = %id, total = self.namespaces.len(), "namespace created");
        Ok(handle)
    }

    /// Adds a connection to a namespace (creating it lazily) and sends it
    /// the snapshot.
    pub async fn join(
        &mut self,
        id: &NamespaceId,
        connection_id: ConnectionId,
        sender: PeerSender,
    ) -> Result<NamespaceHandle, NamespaceError> {
        let handle = self.get_or_create(id)?;
        handle.join(connection_id, sender).await?;
        if let Some(entry) = self.namespaces.get_mut(id) {
            entry.members.insert(connection_id);
            entry.last_activity = Instant::now();
        }
        Ok(handle)
    }

    /// Removes a connection from a namespace. Returns whether it was a
    /// member.
    pub async fn leave(&mut self, id: &NamespaceId, connection_id: ConnectionId) -> bool {
        let Some(entry) = self.namespaces.get_mut(id) else {
            return false;
        };
        let was_member = entry.members.remove(&connection_id);
        entry.last_activity = Instant::now();
        if let Err(e) = entry.handle.leave(connection_id).await {
            tracing::debug!(namespace = %id, connection = %connection_id, error = %e, "leave after namespace stopped");
        }
        was_member
    }

    /// Records activity on a namespace that didn't arrive as an inbound
    /// mutation, e.g. server-side writes.
    pub fn touch(&mut self, id: &NamespaceId, now: Instant) {
        if let Some(entry) = self.namespaces.get_mut(id) {
            entry.last_activity = now;
        }
    }

    /// The collection types every namespace is created with, sorted. A
    /// joining member gets one snapshot frame per entry.
    pub fn collection_types(&self) -> &[CollectionTypeId] {
        &self.type_ids
    }

    pub fn get(&self, id: &NamespaceId) -> Option<NamespaceHandle> {
        self.namespaces.get(id).map(|entry| entry.handle.clone())
    }

    pub fn member_count(&self, id: &NamespaceId) -> usize {
        self.namespaces.get(id).map_or(0, |entry| entry.members.len())
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Removes and shuts down every namespace with no members whose last
    /// activity is at least `timeout` before `now`. Returns the reaped ids.
    ///
    /// Inbound traffic is timestamped by each actor, so candidates are
    /// asked for their latest activity before being torn down.
    pub async fn reap_idle(&mut self, now: Instant, timeout: Duration) -> Vec<NamespaceId> {
        let mut candidates: Vec<NamespaceId> = self
            .namespaces
            .iter()
            .filter(|(_, entry)| entry.members.is_empty() && entry.idle_for(now) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        candidates.sort();

        let mut idle = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(entry) = self.namespaces.get_mut(&id) else {
                continue;
            };
            if let Ok(info) = entry.handle.info().await {
                entry.last_activity = entry.last_activity.max(info.last_activity);
                if entry.idle_for(now) < timeout {
                    continue;
                }
            }
            if let Some(entry) = self.namespaces.remove(&id) {
                let _ = entry.handle.shutdown().await;
                tracing::info!(
                    namespace = %id,
                    idle_secs = entry.idle_for(now).as_secs(),
                    "namespace reaped"
                );
            }
            idle.push(id);
        }
        idle
    }

    /// Shuts down every namespace.
    pub async fn shutdown_all(&mut self) {
        for (_, entry) in self.namespaces.drain() {
            let _ = entry.handle.shutdown().await;
        }
    }
}
