//! Change notifications delivered to local subscribers.

use std::fmt;

use roomsync_protocol::{CollectionEvent, CollectionTypeId};

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Made through this process's own API.
    Local,
    /// Received from a peer, or imported from a snapshot.
    Remote,
}

/// The mutation itself. Borrowed from the collection for the duration of
/// the callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change<'a, T> {
    Add { id: &'a str, data: &'a T },
    Update { id: &'a str, data: &'a T },
    Remove { id: &'a str },
}

impl<'a, T> Change<'a, T> {
    pub fn kind(&self) -> CollectionEvent {
        match *self {
            Self::Add { .. } => CollectionEvent::Add,
            Self::Update { .. } => CollectionEvent::Update,
            Self::Remove { .. } => CollectionEvent::Remove,
        }
    }

    pub fn id(&self) -> &'a str {
        match *self {
            Self::Add { id, .. } | Self::Update { id, .. } | Self::Remove { id } => id,
        }
    }

    /// The new value; `None` for removals.
    pub fn data(&self) -> Option<&'a T> {
        match *self {
            Self::Add { data, .. } | Self::Update { data, .. } => Some(data),
            Self::Remove { .. } => None,
        }
    }
}

/// What a subscriber callback receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Notification<'a, T> {
    pub collection: &'a CollectionTypeId,
    pub origin: Origin,
    pub change: Change<'a, T>,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A subscriber callback.
///
/// Runs synchronously inside the mutation that triggered it, so it must
/// not block.
pub type Callback<T> = Box<dyn FnMut(&Notification<'_, T>) + Send>;

/// Subscriber list for one collection, in registration order.
pub(crate) struct Subscribers<T> {
    next_id: u64,
    entries: Vec<(SubscriptionId, CollectionEvent, Callback<T>)>,
}

impl<T> Subscribers<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, kind: CollectionEvent, callback: Callback<T>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, kind, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn notify(
        &mut self,
        collection: &CollectionTypeId,
        origin: Origin,
        change: Change<'_, T>,
    ) {
        let kind = change.kind();
        let notification = Notification {
            collection,
            origin,
            change,
        };
        for (_, subscribed, callback) in &mut self.entries {
            if *subscribed == kind {
                callback(&notification);
            }
        }
    }
}
