//! The namespace: one collection per declared type.

use std::any::type_name;
use std::collections::BTreeMap;

use roomsync_collection::{
    AnyCollection, Collection, CollectionItem, CollectionRegistry, Outbox, RemoteOrigin,
};
use roomsync_protocol::{CollectionMutation, CollectionTypeId, FullExport, NamespaceId};
use tokio::time::Instant;

use crate::NamespaceError;

/// A set of collections addressed by type id.
///
/// The namespace itself is synchronous. It is normally owned by an actor
/// task (see [`spawn_namespace`](crate::spawn_namespace)) and reached
/// through a [`NamespaceHandle`](crate::NamespaceHandle).
pub struct Namespace {
    id: NamespaceId,
    created_at: Instant,
    collections: BTreeMap<CollectionTypeId, Box<dyn AnyCollection>>,
}

impl Namespace {
    /// Builds one empty collection per type id, all emitting into `outbox`.
    ///
    /// Repeated type ids are collapsed.
    ///
    /// # Errors
    /// [`NamespaceError::UnknownCollectionType`] for a type id the registry
    /// doesn't know. No namespace is created.
    pub fn new(
        id: NamespaceId,
        type_ids: impl IntoIterator<Item = CollectionTypeId>,
        registry: &CollectionRegistry,
        outbox: Outbox,
    ) -> Result<Self, NamespaceError> {
        let mut collections = BTreeMap::new();
        for type_id in type_ids {
            if collections.contains_key(&type_id) {
                continue;
            }
            let collection = registry
                .build(&type_id, outbox.clone())
                .ok_or_else(|| NamespaceError::UnknownCollectionType(type_id.clone()))?;
            collections.insert(type_id, collection);
        }
        Ok(Self {
            id,
            created_at: Instant::now(),
            collections,
        })
    }

    pub fn id(&self) -> &NamespaceId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Type ids in this namespace, sorted.
    pub fn type_ids(&self) -> Vec<CollectionTypeId> {
        self.collections.keys().cloned().collect()
    }

    /// Typed read access to a collection.
    ///
    /// # Errors
    /// - [`NamespaceError::UnknownCollectionType`] if the type id isn't here
    /// - [`NamespaceError::TypeMismatch`] if it holds something other than `T`
    pub fn collection<T: CollectionItem>(
        &self,
        type_id: &CollectionTypeId,
    ) -> Result<&Collection<T>, NamespaceError> {
        self.collections
            .get(type_id)
            .ok_or_else(|| NamespaceError::UnknownCollectionType(type_id.clone()))?
            .as_any()
            .downcast_ref::<Collection<T>>()
            .ok_or_else(|| mismatch::<T>(type_id))
    }

    /// Typed write access to a collection. Same errors as
    /// [`collection`](Self::collection).
    pub fn collection_mut<T: CollectionItem>(
        &mut self,
        type_id: &CollectionTypeId,
    ) -> Result<&mut Collection<T>, NamespaceError> {
        self.collections
            .get_mut(type_id)
            .ok_or_else(|| NamespaceError::UnknownCollectionType(type_id.clone()))?
            .as_any_mut()
            .downcast_mut::<Collection<T>>()
            .ok_or_else(|| mismatch::<T>(type_id))
    }

    /// Routes a wire mutation to its collection.
    ///
    /// Unknown collection types and undecodable payloads are logged and
    /// dropped; a bad frame never takes the namespace down. Returns whether
    /// the mutation was applied.
    pub fn handle_message(&mut self, mutation: &CollectionMutation, origin: RemoteOrigin) -> bool {
        let Some(collection) = self.collections.get_mut(&mutation.collection_type_id) else {
            tracing::warn!(
                namespace = %self.id,
                collection = %mutation.collection_type_id,
                "mutation for unknown collection type, dropping"
            );
            return false;
        };
        match collection.apply_mutation(mutation, origin) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    namespace = %self.id,
                    collection = %mutation.collection_type_id,
                    item_id = %mutation.item_id,
                    error = %e,
                    "failed to apply mutation, dropping"
                );
                false
            }
        }
    }

    /// Replays a snapshot into its collection and returns how many records
    /// it held.
    pub fn import_collection(&mut self, export: FullExport) -> Result<usize, NamespaceError> {
        let collection = self
            .collections
            .get_mut(&export.collection_type_id)
            .ok_or_else(|| NamespaceError::UnknownCollectionType(export.collection_type_id.clone()))?;
        Ok(collection.import(export.item_ids, export.payload)?)
    }

    /// Makes a snapshot the whole contents of its collection, dropping
    /// records the snapshot doesn't list.
    pub fn replace_collection(&mut self, export: FullExport) -> Result<usize, NamespaceError> {
        let collection = self
            .collections
            .get_mut(&export.collection_type_id)
            .ok_or_else(|| NamespaceError::UnknownCollectionType(export.collection_type_id.clone()))?;
        Ok(collection.replace_with(export.item_ids, export.payload)?)
    }

    /// Snapshots every collection, sorted by type id.
    pub fn export_all(&self) -> Result<Vec<FullExport>, NamespaceError> {
        self.collections
            .values()
            .map(|collection| collection.export().map_err(NamespaceError::from))
            .collect()
    }

    /// Record counts per collection, sorted by type id.
    pub fn sizes(&self) -> Vec<(CollectionTypeId, usize)> {
        self.collections
            .iter()
            .map(|(type_id, collection)| (type_id.clone(), collection.len()))
            .collect()
    }

    /// Earliest throttle deadline across all collections.
    pub fn next_due(&self) -> Option<Instant> {
        self.collections.values().filter_map(|c| c.next_due()).min()
    }

    /// Flushes every due throttled update. Returns how many frames went out.
    pub fn flush_due(&mut self, now: Instant) -> usize {
        self.collections
            .values_mut()
            .map(|collection| collection.flush_due(now))
            .sum()
    }
}

fn mismatch<T>(type_id: &CollectionTypeId) -> NamespaceError {
    NamespaceError::TypeMismatch {
        type_id: type_id.clone(),
        requested: type_name::<T>(),
    }
}

#[cfg(test)]
mod tests {
    use roomsync_collection::{outbox, CollectionConfig};
    use roomsync_protocol::CollectionEvent;

    use super::*;

    fn registry() -> CollectionRegistry {
        let mut registry = CollectionRegistry::new();
        registry.register::<i64>("score", CollectionConfig::default()).unwrap();
        registry.register::<String>("chat", CollectionConfig::default()).unwrap();
        registry
    }

    fn namespace(type_ids: &[&str]) -> Result<Namespace, NamespaceError> {
        let (tx, _rx) = outbox();
        Namespace::new(
            "lobby".into(),
            type_ids.iter().map(|&t| CollectionTypeId::from(t)),
            &registry(),
            tx,
        )
    }

    #[test]
    fn test_new_collapses_duplicate_type_ids() {
        let ns = namespace(&["score", "chat", "score"]).unwrap();
        assert_eq!(
            ns.type_ids(),
            vec![CollectionTypeId::from("chat"), CollectionTypeId::from("score")]
        );
    }

    #[test]
    fn test_new_with_unregistered_type_fails() {
        let result = namespace(&["score", "nope"]);
        assert!(matches!(result, Err(NamespaceError::UnknownCollectionType(t)) if t.as_str() == "nope"));
    }

    #[test]
    fn test_typed_access_checks_record_type() {
        let mut ns = namespace(&["score"]).unwrap();
        ns.collection_mut::<i64>(&"score".into())
            .unwrap()
            .add_item("a", 3)
            .unwrap();
        assert_eq!(ns.collection::<i64>(&"score".into()).unwrap().get_item("a"), Some(&3));

        let wrong = ns.collection::<String>(&"score".into());
        assert!(matches!(wrong, Err(NamespaceError::TypeMismatch { .. })));
        let missing = ns.collection::<i64>(&"chat".into());
        assert!(matches!(missing, Err(NamespaceError::UnknownCollectionType(_))));
    }

    #[test]
    fn test_handle_message_ignores_unknown_type_and_bad_payload() {
        let mut ns = namespace(&["score"]).unwrap();
        let mut mutation = CollectionMutation {
            collection_type_id: "nope".into(),
            event: CollectionEvent::Add,
            item_id: "a".into(),
            payload: b"1".to_vec(),
        };
        assert!(!ns.handle_message(&mutation, RemoteOrigin::default()));

        mutation.collection_type_id = "score".into();
        mutation.payload = b"\"text\"".to_vec();
        assert!(!ns.handle_message(&mutation, RemoteOrigin::default()));

        mutation.payload = b"7".to_vec();
        assert!(ns.handle_message(&mutation, RemoteOrigin::default()));
        assert_eq!(ns.sizes(), vec![(CollectionTypeId::from("score"), 1)]);
    }

    #[test]
    fn test_export_all_then_import_reproduces_records() {
        let mut source = namespace(&["score", "chat"]).unwrap();
        source
            .collection_mut::<i64>(&"score".into())
            .unwrap()
            .add_item("a", 1)
            .unwrap();
        source
            .collection_mut::<String>(&"chat".into())
            .unwrap()
            .add_item("m1", "hi".into())
            .unwrap();
        let exports = source.export_all().unwrap();
        assert_eq!(exports[0].collection_type_id.as_str(), "chat");

        let mut target = namespace(&["score", "chat"]).unwrap();
        for export in exports {
            assert_eq!(target.import_collection(export).unwrap(), 1);
        }
        assert_eq!(target.sizes(), source.sizes());
    }
}
