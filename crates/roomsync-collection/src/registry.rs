//! The collection type registry.
//!
//! Every peer registers the same set of record types under the same type
//! ids before it creates namespaces. A namespace then asks the registry
//! to build one fresh collection per type id it declares.

use std::collections::HashMap;
use std::sync::Arc;

use roomsync_protocol::{Codec, CollectionTypeId, JsonCodec};

use crate::collection::{AnyCollection, Collection, Outbox};
use crate::record::{CollectionItem, RecordCodec};
use crate::{CollectionConfig, CollectionError};

/// Builds collections of one concrete record type.
trait CollectionFactory: Send + Sync {
    fn build(&self, type_id: CollectionTypeId, outbox: Outbox) -> Box<dyn AnyCollection>;
    fn config(&self) -> &CollectionConfig;
}

struct TypedFactory<T> {
    config: CollectionConfig,
    codec: Arc<dyn RecordCodec<T>>,
}

impl<T: CollectionItem> CollectionFactory for TypedFactory<T> {
    fn build(&self, type_id: CollectionTypeId, outbox: Outbox) -> Box<dyn AnyCollection> {
        Box::new(Collection::new(
            type_id,
            self.config.clone(),
            Arc::clone(&self.codec),
            outbox,
        ))
    }

    fn config(&self) -> &CollectionConfig {
        &self.config
    }
}

/// Maps collection type ids to record types, configs, and codecs.
///
/// Populate it once at startup, then share it behind an `Arc`.
///
/// ```rust
/// use roomsync_collection::{CollectionConfig, CollectionRegistry};
///
/// let mut registry = CollectionRegistry::new();
/// registry
///     .register::<i64>("score", CollectionConfig::default())
///     .unwrap();
/// assert!(registry.contains(&"score".into()));
/// ```
#[derive(Default)]
pub struct CollectionRegistry {
    factories: HashMap<CollectionTypeId, Box<dyn CollectionFactory>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `type_id`, encoding records as JSON.
    ///
    /// # Errors
    /// [`CollectionError::DuplicateType`] if the id is taken.
    pub fn register<T: CollectionItem>(
        &mut self,
        type_id: impl Into<CollectionTypeId>,
        config: CollectionConfig,
    ) -> Result<(), CollectionError> {
        self.register_with_codec::<T, _>(type_id, config, JsonCodec)
    }

    /// Registers `T` under `type_id` with a specific record codec.
    pub fn register_with_codec<T, C>(
        &mut self,
        type_id: impl Into<CollectionTypeId>,
        config: CollectionConfig,
        codec: C,
    ) -> Result<(), CollectionError>
    where
        T: CollectionItem,
        C: Codec,
    {
        let type_id = type_id.into();
        if self.factories.contains_key(&type_id) {
            return Err(CollectionError::DuplicateType(type_id));
        }
        let codec: Arc<dyn RecordCodec<T>> = Arc::new(codec);
        tracing::debug!(collection = %type_id, "registered collection type");
        self.factories
            .insert(type_id, Box::new(TypedFactory { config, codec }));
        Ok(())
    }

    /// Builds an empty collection for `type_id`, or `None` if the id was
    /// never registered.
    pub fn build(&self, type_id: &CollectionTypeId, outbox: Outbox) -> Option<Box<dyn AnyCollection>> {
        self.factories
            .get(type_id)
            .map(|factory| factory.build(type_id.clone(), outbox))
    }

    pub fn contains(&self, type_id: &CollectionTypeId) -> bool {
        self.factories.contains_key(type_id)
    }

    pub fn config(&self, type_id: &CollectionTypeId) -> Option<&CollectionConfig> {
        self.factories.get(type_id).map(|factory| factory.config())
    }

    /// Registered type ids, sorted.
    pub fn type_ids(&self) -> Vec<CollectionTypeId> {
        let mut ids: Vec<_> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for CollectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}
