//! The replicated collection.
//!
//! A [`Collection<T>`] is a keyed set of records of one schema, living in
//! one namespace. Every mutation goes through the same three steps:
//!
//! ```text
//! apply locally → notify subscribers → emit a frame to the outbox
//! ```
//!
//! The collection never touches a socket. Outbound frames go into an
//! [`Outbox`] channel and the namespace actor that owns the collection
//! decides who receives them. That keeps the collection synchronous and
//! trivially testable: drain the channel and look at what came out.
//!
//! # Throttling
//!
//! Update frames are rate limited per record id. The first update after a
//! quiet period goes out immediately; updates arriving sooner than
//! `throttle` after the last send replace a single pending payload that
//! is flushed once the window closes. Adds and removes are never delayed,
//! and a remove cancels anything pending for its id.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use roomsync_protocol::{
    CollectionEvent, CollectionMutation, CollectionTypeId, ConnectionId,
    FullExport,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::event::{Callback, Change, Notification, Origin, Subscribers, SubscriptionId};
use crate::record::{CollectionItem, Record, RecordCodec};
use crate::{CollectionConfig, CollectionError};

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// One frame a collection wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub mutation: CollectionMutation,
    /// Peer that must not receive it: the sender of a rebroadcast
    /// mutation. `None` for locally originated frames.
    pub exclude: Option<ConnectionId>,
}

/// Where collections push outbound frames.
pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// Receiving end of an [`Outbox`].
pub type OutboxReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Creates a fresh outbox channel.
pub fn outbox() -> (Outbox, OutboxReceiver) {
    mpsc::unbounded_channel()
}

/// Provenance of a remote mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteOrigin {
    /// The connection it arrived on, if known.
    pub sender: Option<ConnectionId>,
    /// Re-emit the raw bytes to every other peer. Set on the server.
    pub rebroadcast: bool,
}

impl RemoteOrigin {
    /// A mutation received on the server from `sender`.
    pub fn relayed_from(sender: ConnectionId) -> Self {
        Self {
            sender: Some(sender),
            rebroadcast: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

struct PendingSend {
    due: Instant,
    payload: Vec<u8>,
}

/// A keyed set of records of type `T`, kept in sync with peers.
pub struct Collection<T> {
    type_id: CollectionTypeId,
    config: CollectionConfig,
    codec: Arc<dyn RecordCodec<T>>,
    records: HashMap<String, Record<T>>,
    subscribers: Subscribers<T>,
    pending: HashMap<String, PendingSend>,
    last_sent_at: HashMap<String, Instant>,
    outbox: Outbox,
}

impl<T: CollectionItem> Collection<T> {
    pub fn new(
        type_id: CollectionTypeId,
        config: CollectionConfig,
        codec: Arc<dyn RecordCodec<T>>,
        outbox: Outbox,
    ) -> Self {
        Self {
            type_id,
            config,
            codec,
            records: HashMap::new(),
            subscribers: Subscribers::new(),
            pending: HashMap::new(),
            last_sent_at: HashMap::new(),
            outbox,
        }
    }

    pub fn collection_type(&self) -> &CollectionTypeId {
        &self.type_id
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    // -- reads ---------------------------------------------------------------

    /// Returns the live value for `id`.
    pub fn get_item(&self, id: &str) -> Option<&T> {
        self.records.get(id).map(Record::data)
    }

    pub fn record(&self, id: &str) -> Option<&Record<T>> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Iterates `(id, value)` pairs in no particular order.
    pub fn items(&self) -> impl Iterator<Item = (&str, &T)> {
        self.records
            .iter()
            .map(|(id, record)| (id.as_str(), record.data()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // -- subscriptions -------------------------------------------------------

    /// Registers `callback` for one kind of change.
    ///
    /// Callbacks run synchronously inside the mutation, in registration
    /// order.
    pub fn subscribe<F>(&mut self, kind: CollectionEvent, callback: F) -> SubscriptionId
    where
        F: FnMut(&Notification<'_, T>) + Send + 'static,
    {
        let callback: Callback<T> = Box::new(callback);
        self.subscribers.add(kind, callback)
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    // -- local mutations -----------------------------------------------------

    /// Inserts a new record and sends an Add frame.
    ///
    /// # Errors
    /// [`CollectionError::DuplicateId`] if `id` is already present.
    pub fn add_item(&mut self, id: impl Into<String>, data: T) -> Result<(), CollectionError> {
        let id = id.into();
        if self.records.contains_key(&id) {
            return Err(CollectionError::DuplicateId {
                collection: self.type_id.clone(),
                id,
            });
        }
        let payload = self.encode(&data)?;

        self.pending.remove(&id);
        self.emit(CollectionEvent::Add, &id, payload, None);
        self.last_sent_at.insert(id.clone(), Instant::now());
        tracing::trace!(collection = %self.type_id, %id, "local add");

        if self.config.local_events {
            self.subscribers.notify(
                &self.type_id,
                Origin::Local,
                Change::Add { id: &id, data: &data },
            );
        }
        if self.config.save_data {
            self.records.insert(id, Record::new(data, self.config.readonly));
        }
        Ok(())
    }

    /// Replaces a record's value and schedules an Update frame. Behaves
    /// like [`add_item`](Self::add_item) if the id isn't present.
    ///
    /// Without `save_data` there is no mirror to check, so this always
    /// sends an Update.
    pub fn update_item(&mut self, id: impl Into<String>, data: T) -> Result<(), CollectionError> {
        let id = id.into();
        if self.config.save_data && !self.records.contains_key(&id) {
            return self.add_item(id, data);
        }
        let payload = self.encode(&data)?;
        self.schedule_update(&id, payload, Instant::now());

        if let Some(record) = self.records.get_mut(&id) {
            record.replace(data.clone());
        }
        if self.config.local_events {
            self.subscribers.notify(
                &self.type_id,
                Origin::Local,
                Change::Update { id: &id, data: &data },
            );
        }
        Ok(())
    }

    /// Merges the top-level fields of `fields` into the record's last
    /// replicated value and sends the result as a full Update.
    ///
    /// If the id isn't present the fields must describe a complete value,
    /// which is then added.
    ///
    /// # Errors
    /// [`CollectionError::InvalidPatch`] if `fields` isn't a JSON object,
    /// the record doesn't serialize to one, or the merged value doesn't
    /// deserialize back into `T`.
    pub fn patch_item(
        &mut self,
        id: impl Into<String>,
        fields: serde_json::Value,
    ) -> Result<(), CollectionError> {
        let id = id.into();
        let serde_json::Value::Object(fields) = fields else {
            return Err(CollectionError::InvalidPatch(
                "partial update must be a JSON object".into(),
            ));
        };

        let merged: T = match self.records.get(&id) {
            Some(record) => {
                let mut base = serde_json::to_value(record.original())
                    .map_err(|e| CollectionError::InvalidPatch(e.to_string()))?;
                let Some(object) = base.as_object_mut() else {
                    return Err(CollectionError::InvalidPatch(format!(
                        "{} records are not JSON objects",
                        self.type_id
                    )));
                };
                object.extend(fields);
                serde_json::from_value(base)
                    .map_err(|e| CollectionError::InvalidPatch(e.to_string()))?
            }
            None => serde_json::from_value(serde_json::Value::Object(fields))
                .map_err(|e| CollectionError::InvalidPatch(e.to_string()))?,
        };
        self.update_item(id, merged)
    }

    /// Writes into a record's live value.
    ///
    /// This is the reactive path: when the collection is `reactive`, the
    /// write changed the value, and neither the record nor the collection
    /// is readonly, the new value is sent as an Update and `true` is
    /// returned. Otherwise the write stays local and the record keeps its
    /// last replicated value as `original`.
    ///
    /// # Errors
    /// [`CollectionError::NotFound`] if there is no such record.
    pub fn modify_item<F>(&mut self, id: &str, write: F) -> Result<bool, CollectionError>
    where
        F: FnOnce(&mut T),
    {
        let Some(record) = self.records.get_mut(id) else {
            return Err(CollectionError::NotFound {
                collection: self.type_id.clone(),
                id: id.to_owned(),
            });
        };
        write(record.data_mut());

        if !record.is_dirty() {
            return Ok(false);
        }
        if !self.config.reactive || record.is_readonly() || self.config.readonly {
            tracing::trace!(collection = %self.type_id, %id, "reactive write kept local");
            return Ok(false);
        }

        let payload = self
            .codec
            .encode(record.data())
            .map_err(|source| CollectionError::Encode {
                collection: self.type_id.clone(),
                source,
            })?;
        record.commit();
        let data = record.data().clone();

        self.schedule_update(id, payload, Instant::now());
        if self.config.local_events {
            self.subscribers.notify(
                &self.type_id,
                Origin::Local,
                Change::Update { id, data: &data },
            );
        }
        Ok(true)
    }

    /// Sends a Remove frame, then deletes the record.
    ///
    /// The frame goes out even if nothing is stored locally, so peers see
    /// the removal when `save_data` is off. Returns the removed value.
    pub fn remove_item(&mut self, id: &str) -> Option<T> {
        self.emit(CollectionEvent::Remove, id, Vec::new(), None);
        self.forget_throttle(id);

        let removed = self.records.remove(id).map(|record| record.data().clone());
        if self.config.local_events {
            self.subscribers
                .notify(&self.type_id, Origin::Local, Change::Remove { id });
        }
        removed
    }

    /// Changes mutability for one record, or for the collection default
    /// when `id` is `None`.
    ///
    /// # Errors
    /// [`CollectionError::NotFound`] for a missing record id.
    pub fn set_readonly(&mut self, readonly: bool, id: Option<&str>) -> Result<(), CollectionError> {
        match id {
            None => {
                self.config.readonly = readonly;
                Ok(())
            }
            Some(id) => match self.records.get_mut(id) {
                Some(record) => {
                    record.set_readonly(readonly);
                    Ok(())
                }
                None => Err(CollectionError::NotFound {
                    collection: self.type_id.clone(),
                    id: id.to_owned(),
                }),
            },
        }
    }

    // -- remote mutations ----------------------------------------------------

    /// Applies an Add received from a peer. An existing record is
    /// overwritten.
    pub fn remote_add(
        &mut self,
        id: &str,
        payload: &[u8],
        origin: RemoteOrigin,
    ) -> Result<(), CollectionError> {
        let data = self.decode(payload)?;
        self.store_remote(id, data, CollectionEvent::Add);
        if origin.rebroadcast {
            self.emit(CollectionEvent::Add, id, payload.to_vec(), origin.sender);
        }
        Ok(())
    }

    /// Applies an Update received from a peer. With `save_data`, an
    /// unknown id is treated as an add.
    pub fn remote_update(
        &mut self,
        id: &str,
        payload: &[u8],
        origin: RemoteOrigin,
    ) -> Result<(), CollectionError> {
        let data = self.decode(payload)?;
        let kind = if self.config.save_data && !self.records.contains_key(id) {
            CollectionEvent::Add
        } else {
            CollectionEvent::Update
        };
        self.store_remote(id, data, kind);
        if origin.rebroadcast {
            self.emit(CollectionEvent::Update, id, payload.to_vec(), origin.sender);
        }
        Ok(())
    }

    /// Applies a Remove received from a peer.
    pub fn remote_remove(&mut self, id: &str, origin: RemoteOrigin) {
        self.records.remove(id);
        self.forget_throttle(id);
        self.subscribers
            .notify(&self.type_id, Origin::Remote, Change::Remove { id });
        if origin.rebroadcast {
            self.emit(CollectionEvent::Remove, id, Vec::new(), origin.sender);
        }
    }

    /// Dispatches a decoded wire mutation to the matching remote method.
    pub fn apply_mutation(
        &mut self,
        mutation: &CollectionMutation,
        origin: RemoteOrigin,
    ) -> Result<(), CollectionError> {
        match mutation.event {
            CollectionEvent::Add => self.remote_add(&mutation.item_id, &mutation.payload, origin),
            CollectionEvent::Update => {
                self.remote_update(&mutation.item_id, &mutation.payload, origin)
            }
            CollectionEvent::Remove => {
                self.remote_remove(&mutation.item_id, origin);
                Ok(())
            }
        }
    }

    fn store_remote(&mut self, id: &str, data: T, kind: CollectionEvent) {
        // A remote value supersedes anything we were about to send.
        self.pending.remove(id);

        if self.config.save_data {
            match self.records.get_mut(id) {
                Some(record) => record.replace(data.clone()),
                None => {
                    self.records
                        .insert(id.to_owned(), Record::new(data.clone(), self.config.readonly));
                }
            }
        }
        let change = match kind {
            CollectionEvent::Add => Change::Add { id, data: &data },
            _ => Change::Update { id, data: &data },
        };
        self.subscribers.notify(&self.type_id, Origin::Remote, change);
    }

    // -- snapshots -----------------------------------------------------------

    /// Encodes every record, sorted by id.
    pub fn export(&self) -> Result<FullExport, CollectionError> {
        let mut ids: Vec<&String> = self.records.keys().collect();
        ids.sort();

        let mut item_ids = Vec::with_capacity(ids.len());
        let mut payload = Vec::with_capacity(ids.len());
        for id in ids {
            let record = &self.records[id];
            payload.push(self.encode(record.original())?);
            item_ids.push(id.clone());
        }
        Ok(FullExport {
            collection_type_id: self.type_id.clone(),
            item_ids,
            payload,
        })
    }

    /// Applies a snapshot as a series of remote adds and returns how many
    /// records it held. Records missing from the snapshot are kept.
    ///
    /// All payloads are decoded before anything is applied, so a bad
    /// snapshot leaves the collection untouched. Nothing is rebroadcast.
    ///
    /// # Errors
    /// [`CollectionError::ArityMismatch`] if the arrays differ in length,
    /// or a decode error for the first bad payload.
    pub fn import(
        &mut self,
        item_ids: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<usize, CollectionError> {
        let decoded = self.decode_snapshot(&item_ids, &payloads)?;
        let count = decoded.len();
        for (id, data) in item_ids.into_iter().zip(decoded) {
            self.store_remote(&id, data, CollectionEvent::Add);
        }
        tracing::debug!(collection = %self.type_id, count, "imported snapshot");
        Ok(count)
    }

    /// Makes the snapshot the whole contents of the collection.
    ///
    /// Like [`import`](Self::import), but every record the snapshot lacks
    /// is dropped and notified as a remote `Remove`, and pending throttled
    /// sends are discarded. A client uses this on reconnect, when the
    /// server's snapshot is the truth.
    ///
    /// # Errors
    /// Same as [`import`](Self::import); on error nothing changes.
    pub fn replace_with(
        &mut self,
        item_ids: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<usize, CollectionError> {
        let decoded = self.decode_snapshot(&item_ids, &payloads)?;

        let keep: HashSet<&str> = item_ids.iter().map(String::as_str).collect();
        let mut stale: Vec<String> = self
            .records
            .keys()
            .filter(|id| !keep.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        for id in &stale {
            self.records.remove(id);
            self.subscribers
                .notify(&self.type_id, Origin::Remote, Change::Remove { id: id.as_str() });
        }
        self.pending.clear();
        self.last_sent_at.clear();

        let count = decoded.len();
        for (id, data) in item_ids.into_iter().zip(decoded) {
            self.store_remote(&id, data, CollectionEvent::Add);
        }
        tracing::debug!(
            collection = %self.type_id,
            count,
            dropped = stale.len(),
            "replaced contents from snapshot"
        );
        Ok(count)
    }

    fn decode_snapshot(
        &self,
        item_ids: &[String],
        payloads: &[Vec<u8>],
    ) -> Result<Vec<T>, CollectionError> {
        if item_ids.len() != payloads.len() {
            return Err(CollectionError::ArityMismatch {
                ids: item_ids.len(),
                payloads: payloads.len(),
            });
        }
        payloads.iter().map(|bytes| self.decode(bytes)).collect()
    }

    // -- throttle ------------------------------------------------------------

    /// When the next pending update is due, if any.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Sends every pending update due at or before `now`. Returns how
    /// many went out.
    pub fn flush_due(&mut self, now: Instant) -> usize {
        let mut due: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(id, pending)| (pending.due, id.clone()))
            .collect();
        due.sort();

        for (_, id) in &due {
            if let Some(pending) = self.pending.remove(id) {
                self.emit(CollectionEvent::Update, id, pending.payload, None);
                self.last_sent_at.insert(id.clone(), now);
            }
        }
        due.len()
    }

    fn schedule_update(&mut self, id: &str, payload: Vec<u8>, now: Instant) {
        let throttle = self.config.throttle;
        let window_open = match self.last_sent_at.get(id) {
            None => true,
            Some(last) => throttle.is_zero() || now.duration_since(*last) >= throttle,
        };

        if window_open && !self.pending.contains_key(id) {
            self.emit(CollectionEvent::Update, id, payload, None);
            self.last_sent_at.insert(id.to_owned(), now);
            return;
        }

        let due = match self.last_sent_at.get(id) {
            Some(last) => last.checked_add(throttle).unwrap_or_else(|| far_future(now)),
            None => now,
        };
        tracing::trace!(collection = %self.type_id, %id, "update throttled");
        self.pending.insert(id.to_owned(), PendingSend { due, payload });
    }

    fn forget_throttle(&mut self, id: &str) {
        self.pending.remove(id);
        self.last_sent_at.remove(id);
    }

    // -- plumbing ------------------------------------------------------------

    fn emit(
        &self,
        event: CollectionEvent,
        id: &str,
        payload: Vec<u8>,
        exclude: Option<ConnectionId>,
    ) {
        let outbound = Outbound {
            mutation: CollectionMutation {
                collection_type_id: self.type_id.clone(),
                event,
                item_id: id.to_owned(),
                payload,
            },
            exclude,
        };
        if self.outbox.send(outbound).is_err() {
            tracing::debug!(collection = %self.type_id, %id, "outbox closed, frame dropped");
        }
    }

    fn encode(&self, data: &T) -> Result<Vec<u8>, CollectionError> {
        self.codec
            .encode(data)
            .map_err(|source| CollectionError::Encode {
                collection: self.type_id.clone(),
                source,
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CollectionError> {
        self.codec
            .decode(bytes)
            .map_err(|source| CollectionError::Decode {
                collection: self.type_id.clone(),
                source,
            })
    }
}

/// Deadline for a throttle window too long to represent as an `Instant`.
fn far_future(now: Instant) -> Instant {
    now.checked_add(Duration::from_secs(86_400 * 365 * 30)).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Type-erased access
// ---------------------------------------------------------------------------

/// A collection with its record type erased, so a namespace can hold
/// collections of different types side by side and route wire frames to
/// them by type id.
pub trait AnyCollection: Send {
    fn collection_type(&self) -> &CollectionTypeId;

    fn apply_mutation(
        &mut self,
        mutation: &CollectionMutation,
        origin: RemoteOrigin,
    ) -> Result<(), CollectionError>;

    fn export(&self) -> Result<FullExport, CollectionError>;

    fn import(
        &mut self,
        item_ids: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<usize, CollectionError>;

    fn replace_with(
        &mut self,
        item_ids: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<usize, CollectionError>;

    fn next_due(&self) -> Option<Instant>;

    fn flush_due(&mut self, now: Instant) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: CollectionItem> AnyCollection for Collection<T> {
    fn collection_type(&self) -> &CollectionTypeId {
        &self.type_id
    }

    fn apply_mutation(
        &mut self,
        mutation: &CollectionMutation,
        origin: RemoteOrigin,
    ) -> Result<(), CollectionError> {
        Collection::apply_mutation(self, mutation, origin)
    }

    fn export(&self) -> Result<FullExport, CollectionError> {
        Collection::export(self)
    }

    fn import(
        &mut self,
        item_ids: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<usize, CollectionError> {
        Collection::import(self, item_ids, payloads)
    }

    fn replace_with(
        &mut self,
        item_ids: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<usize, CollectionError> {
        Collection::replace_with(self, item_ids, payloads)
    }

    fn next_due(&self) -> Option<Instant> {
        Collection::next_due(self)
    }

    fn flush_due(&mut self, now: Instant) -> usize {
        Collection::flush_due(self, now)
    }

    fn len(&self) -> usize {
        Collection::len(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use roomsync_protocol::JsonCodec;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Player {
        name: String,
        score: i64,
    }

    fn player(name: &str, score: i64) -> Player {
        Player {
            name: name.into(),
            score,
        }
    }

    fn collection(config: CollectionConfig) -> (Collection<Player>, OutboxReceiver) {
        let (tx, rx) = outbox();
        let codec: Arc<dyn RecordCodec<Player>> = Arc::new(JsonCodec);
        (Collection::new("player".into(), config, codec, tx), rx)
    }

    fn drain(rx: &mut OutboxReceiver) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn decoded(frame: &Outbound) -> Player {
        serde_json::from_slice(&frame.mutation.payload).unwrap()
    }

    fn bytes(value: &Player) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn test_add_emits_add_frame_and_stores() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        players.add_item("p1", player("ann", 0)).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mutation.event, CollectionEvent::Add);
        assert_eq!(frames[0].mutation.item_id, "p1");
        assert_eq!(frames[0].exclude, None);
        assert_eq!(decoded(&frames[0]), player("ann", 0));
        assert_eq!(players.get_item("p1"), Some(&player("ann", 0)));
    }

    #[test]
    fn test_add_existing_id_is_rejected() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        players.add_item("p1", player("ann", 0)).unwrap();
        let result = players.add_item("p1", player("bob", 1));

        assert!(matches!(result, Err(CollectionError::DuplicateId { .. })));
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(players.get_item("p1"), Some(&player("ann", 0)));
    }

    #[test]
    fn test_update_missing_id_behaves_as_add() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        players.update_item("p1", player("ann", 3)).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mutation.event, CollectionEvent::Add);
    }

    #[test]
    fn test_update_without_save_data_always_sends_update() {
        let config = CollectionConfig {
            save_data: false,
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.update_item("p1", player("ann", 3)).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mutation.event, CollectionEvent::Update);
        assert!(players.is_empty());
    }

    #[test]
    fn test_patch_merges_fields_into_original() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        players.add_item("p1", player("ann", 1)).unwrap();
        drain(&mut rx);

        players
            .patch_item("p1", serde_json::json!({ "score": 10 }))
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mutation.event, CollectionEvent::Update);
        assert_eq!(decoded(&frames[0]), player("ann", 10));
        assert_eq!(players.get_item("p1"), Some(&player("ann", 10)));
    }

    #[test]
    fn test_patch_rejects_non_object_and_bad_shape() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        players.add_item("p1", player("ann", 1)).unwrap();

        let result = players.patch_item("p1", serde_json::json!(5));
        assert!(matches!(result, Err(CollectionError::InvalidPatch(_))));

        let result = players.patch_item("p1", serde_json::json!({ "score": "high" }));
        assert!(matches!(result, Err(CollectionError::InvalidPatch(_))));

        // A partial value can't create a record.
        let result = players.patch_item("p2", serde_json::json!({ "score": 1 }));
        assert!(matches!(result, Err(CollectionError::InvalidPatch(_))));
    }

    #[test]
    fn test_remove_sends_frame_even_without_record() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        assert_eq!(players.remove_item("ghost"), None);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mutation.event, CollectionEvent::Remove);
        assert!(frames[0].mutation.payload.is_empty());
    }

    #[test]
    fn test_modify_sends_only_when_reactive_and_changed() {
        let config = CollectionConfig {
            reactive: true,
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.add_item("p1", player("ann", 1)).unwrap();
        drain(&mut rx);

        assert!(!players.modify_item("p1", |p| p.score = 1).unwrap());
        assert!(drain(&mut rx).is_empty());

        assert!(players.modify_item("p1", |p| p.score = 2).unwrap());
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoded(&frames[0]), player("ann", 2));
        assert_eq!(players.record("p1").unwrap().original().score, 2);
    }

    #[test]
    fn test_modify_non_reactive_stays_local() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        players.add_item("p1", player("ann", 1)).unwrap();
        drain(&mut rx);

        assert!(!players.modify_item("p1", |p| p.score = 9).unwrap());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(players.get_item("p1").unwrap().score, 9);
        assert_eq!(players.record("p1").unwrap().original().score, 1);
    }

    #[test]
    fn test_modify_missing_record_is_not_found() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        let result = players.modify_item("nope", |p| p.score = 1);
        assert!(matches!(result, Err(CollectionError::NotFound { .. })));
    }

    #[test]
    fn test_readonly_record_suppresses_reactive_send() {
        let config = CollectionConfig {
            reactive: true,
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.add_item("p1", player("ann", 1)).unwrap();
        players.set_readonly(true, Some("p1")).unwrap();
        drain(&mut rx);

        assert!(!players.modify_item("p1", |p| p.score = 5).unwrap());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(players.get_item("p1").unwrap().score, 5);

        // Explicit calls are not gated by readonly.
        players.update_item("p1", player("ann", 6)).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_set_readonly_unknown_id_is_not_found() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        let result = players.set_readonly(true, Some("nope"));
        assert!(matches!(result, Err(CollectionError::NotFound { .. })));
        players.set_readonly(true, None).unwrap();
        assert!(players.config().readonly);
    }

    #[test]
    fn test_remote_mutations_notify_remote_and_rebroadcast_with_exclusion() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        players.subscribe(CollectionEvent::Add, move |n| {
            sink.lock().unwrap().push((n.origin, n.change.id().to_owned()));
        });

        let bytes = bytes(&player("bob", 4));
        let sender = ConnectionId::new(7);
        players
            .remote_add("p2", &bytes, RemoteOrigin::relayed_from(sender))
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(Origin::Remote, "p2".to_string())]);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].exclude, Some(sender));
        assert_eq!(frames[0].mutation.payload, bytes);
    }

    #[test]
    fn test_remote_without_rebroadcast_emits_nothing() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        let bytes = bytes(&player("bob", 4));
        players.remote_add("p2", &bytes, RemoteOrigin::default()).unwrap();
        players.remote_remove("p2", RemoteOrigin::default());
        assert!(drain(&mut rx).is_empty());
        assert!(players.is_empty());
    }

    #[test]
    fn test_remote_add_overwrites_existing() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        players.add_item("p1", player("ann", 1)).unwrap();
        let bytes = bytes(&player("ann", 50));
        players.remote_add("p1", &bytes, RemoteOrigin::default()).unwrap();
        assert_eq!(players.get_item("p1").unwrap().score, 50);
    }

    #[test]
    fn test_remote_garbage_is_decode_error_and_changes_nothing() {
        let (mut players, mut rx) = collection(CollectionConfig::default());
        let result = players.remote_update(
            "p1",
            b"{not json",
            RemoteOrigin::relayed_from(ConnectionId::new(1)),
        );
        assert!(matches!(result, Err(CollectionError::Decode { .. })));
        assert!(players.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_local_events_off_silences_local_but_not_remote() {
        let config = CollectionConfig {
            local_events: false,
            ..CollectionConfig::default()
        };
        let (mut players, _rx) = collection(config);
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        players.subscribe(CollectionEvent::Add, move |_| *sink.lock().unwrap() += 1);

        players.add_item("p1", player("ann", 1)).unwrap();
        assert_eq!(*count.lock().unwrap(), 0);

        let bytes = bytes(&player("bob", 1));
        players.remote_add("p2", &bytes, RemoteOrigin::default()).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_export_is_sorted_by_id() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        players.add_item("b", player("b", 2)).unwrap();
        players.add_item("a", player("a", 1)).unwrap();

        let export = players.export().unwrap();
        assert_eq!(export.item_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(export.payload.len(), 2);
    }

    #[test]
    fn test_import_arity_mismatch_applies_nothing() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        let bytes = bytes(&player("a", 1));
        let result = players.import(vec!["a".into(), "b".into()], vec![bytes]);
        assert!(matches!(
            result,
            Err(CollectionError::ArityMismatch { ids: 2, payloads: 1 })
        ));
        assert!(players.is_empty());
    }

    #[test]
    fn test_import_with_one_bad_payload_applies_nothing() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        let good = bytes(&player("a", 1));
        let result = players.import(
            vec!["a".into(), "b".into()],
            vec![good, b"garbage".to_vec()],
        );
        assert!(matches!(result, Err(CollectionError::Decode { .. })));
        assert!(players.is_empty());
    }

    #[test]
    fn test_replace_with_drops_records_missing_from_snapshot() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        players
            .import(
                vec!["a".into(), "b".into()],
                vec![bytes(&player("ann", 1)), bytes(&player("bob", 2))],
            )
            .unwrap();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        players.subscribe(CollectionEvent::Remove, move |n| {
            sink.lock().unwrap().push((n.origin, n.change.id().to_owned()));
        });

        let count = players
            .replace_with(vec!["b".into()], vec![bytes(&player("bob", 5))])
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(players.len(), 1);
        assert_eq!(players.get_item("a"), None);
        assert_eq!(players.get_item("b"), Some(&player("bob", 5)));
        assert_eq!(*removed.lock().unwrap(), vec![(Origin::Remote, "a".to_string())]);
    }

    #[test]
    fn test_import_keeps_records_missing_from_snapshot() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        players.import(vec!["a".into()], vec![bytes(&player("ann", 1))]).unwrap();
        players.import(vec!["b".into()], vec![bytes(&player("bob", 2))]).unwrap();
        assert_eq!(players.len(), 2);
    }

    #[test]
    fn test_replace_with_bad_payload_changes_nothing() {
        let (mut players, _rx) = collection(CollectionConfig::default());
        players.import(vec!["a".into()], vec![bytes(&player("ann", 1))]).unwrap();

        let result = players.replace_with(vec!["b".into()], vec![b"garbage".to_vec()]);
        assert!(matches!(result, Err(CollectionError::Decode { .. })));
        assert_eq!(players.get_item("a"), Some(&player("ann", 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_with_discards_pending_sends() {
        let config = CollectionConfig {
            throttle: Duration::from_millis(50),
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.add_item("p1", player("ann", 0)).unwrap();
        players.update_item("p1", player("ann", 9)).unwrap();
        assert!(players.next_due().is_some());
        drain(&mut rx);

        players
            .replace_with(vec!["p1".into()], vec![bytes(&player("ann", 3))])
            .unwrap();
        assert_eq!(players.next_due(), None);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(players.flush_due(Instant::now()), 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(players.get_item("p1"), Some(&player("ann", 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_throttle_defers_without_overflow() {
        let config = CollectionConfig {
            throttle: Duration::MAX,
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.add_item("p1", player("ann", 0)).unwrap();
        players.update_item("p1", player("ann", 1)).unwrap();

        let due = players.next_due().expect("update is pending");
        assert!(due > Instant::now() + Duration::from_secs(86_400));
        assert_eq!(players.flush_due(Instant::now()), 0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_coalesces_burst_into_one_trailing_update() {
        let config = CollectionConfig {
            throttle: Duration::from_millis(50),
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        let start = Instant::now();
        players.add_item("p1", player("ann", 0)).unwrap();
        drain(&mut rx);

        for score in 1..=10 {
            players.update_item("p1", player("ann", score)).unwrap();
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(players.next_due(), Some(start + Duration::from_millis(50)));
        assert_eq!(players.flush_due(Instant::now()), 0);

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(players.flush_due(Instant::now()), 1);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoded(&frames[0]).score, 10);
        assert_eq!(players.next_due(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sends_immediately_after_quiet_period() {
        let config = CollectionConfig {
            throttle: Duration::from_millis(50),
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.add_item("p1", player("ann", 0)).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;

        players.update_item("p1", player("ann", 1)).unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].mutation.event, CollectionEvent::Update);
        assert_eq!(players.next_due(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_pending_update() {
        let config = CollectionConfig {
            throttle: Duration::from_millis(50),
            ..CollectionConfig::default()
        };
        let (mut players, mut rx) = collection(config);
        players.add_item("p1", player("ann", 0)).unwrap();
        players.update_item("p1", player("ann", 1)).unwrap();
        assert!(players.next_due().is_some());

        players.remove_item("p1");
        assert_eq!(players.next_due(), None);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(players.flush_due(Instant::now()), 0);

        let events: Vec<_> = drain(&mut rx).iter().map(|f| f.mutation.event).collect();
        assert_eq!(events, vec![CollectionEvent::Add, CollectionEvent::Remove]);
    }

    #[test]
    fn test_any_collection_downcasts_to_concrete_type() {
        let (players, _rx) = collection(CollectionConfig::default());
        let mut erased: Box<dyn AnyCollection> = Box::new(players);
        assert_eq!(erased.collection_type().as_str(), "player");
        assert!(erased.as_any().downcast_ref::<Collection<Player>>().is_some());
        assert!(erased.as_any_mut().downcast_mut::<Collection<String>>().is_none());
    }
}
