//! Namespaces for Roomsync.
//!
//! A namespace is the unit of isolation: one instance of every declared
//! collection type, shared by every connection that joined it.
//!
//! # Key types
//!
//! - [`Namespace`]: the collections themselves, plus frame dispatch
//! - [`NamespaceHandle`]: talk to a running namespace actor
//! - [`CollectionHandle`]: async typed access to one collection
//! - [`Role`]: who receives the frames a namespace emits
//! - [`NamespaceManager`]: server-side lazy creation, membership, and idle
//!   reaping
//!
//! Each namespace runs as one Tokio task. Wire frames, consumer calls, and
//! throttle timers are all serialised through that task, so a mutation is
//! never observed half-applied.

mod actor;
mod error;
mod handle;
mod manager;
mod namespace;

pub use actor::{spawn_namespace, NamespaceInfo, Role};
pub use error::NamespaceError;
pub use handle::{CollectionHandle, NamespaceHandle};
pub use manager::NamespaceManager;
pub use namespace::Namespace;
