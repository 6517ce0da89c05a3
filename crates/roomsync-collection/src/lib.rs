//! Replicated record collections for Roomsync.
//!
//! - **[`Collection<T>`]**: a keyed set of records of one type that
//!   applies local and remote mutations, notifies subscribers, throttles
//!   outbound updates, and exports/imports snapshots.
//! - **[`CollectionRegistry`]**: maps collection type ids to record
//!   types so namespaces can build their collections by name.
//! - **[`AnyCollection`]**: the type-erased view a namespace routes wire
//!   frames through.
//!
//! Collections are synchronous and never touch sockets: outbound frames
//! go into an [`Outbox`] channel owned by whoever holds the collection.

mod collection;
mod config;
mod error;
mod event;
mod record;
mod registry;

pub use collection::{
    outbox, AnyCollection, Collection, Outbound, Outbox, OutboxReceiver,
    RemoteOrigin,
};
pub use config::CollectionConfig;
pub use error::CollectionError;
pub use event::{Callback, Change, Notification, Origin, SubscriptionId};
pub use record::{CollectionItem, Record, RecordCodec};
pub use registry::CollectionRegistry;
