//! Records and the traits record types must satisfy.

use roomsync_protocol::{Codec, ProtocolError};
use serde::{de::DeserializeOwned, Serialize};

/// Bounds every record type stored in a collection must meet.
///
/// `PartialEq` powers change detection on reactive writes; serde is
/// needed by the codecs and by field-wise patches. Implemented
/// automatically for any type that fits.
pub trait CollectionItem:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + 'static
{
}

impl<T> CollectionItem for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + 'static
{
}

/// Object-safe encode/decode pair for one record type.
///
/// [`Codec`] has generic methods and can't be boxed, so the registry
/// stores this instead. Every `Codec` is a `RecordCodec<T>` for any
/// serde type `T`.
pub trait RecordCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, ProtocolError>;
}

impl<T, C> RecordCodec<T> for C
where
    C: Codec,
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        Codec::encode(self, value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        Codec::decode(self, bytes)
    }
}

/// One entry in a collection.
///
/// `data` is the live value that `modify_item` writes into. `original`
/// is the last value observed from a local or remote mutation and is the
/// base that partial updates merge into. The two are equal after every
/// applied mutation; they only differ while a non-propagated write sits
/// in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    data: T,
    original: T,
    readonly: bool,
}

impl<T: Clone> Record<T> {
    pub(crate) fn new(data: T, readonly: bool) -> Self {
        Self {
            original: data.clone(),
            data,
            readonly,
        }
    }

    /// The live value.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// The last replicated value.
    pub fn original(&self) -> &T {
        &self.original
    }

    /// Whether reactive writes on this record stay local.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub(crate) fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    /// Applies a full value: both sides converge on it.
    pub(crate) fn replace(&mut self, value: T) {
        self.original = value.clone();
        self.data = value;
    }

    /// Promotes the live value to the replicated one.
    pub(crate) fn commit(&mut self) {
        self.original = self.data.clone();
    }

    pub(crate) fn is_dirty(&self) -> bool
    where
        T: PartialEq,
    {
        self.data != self.original
    }
}
