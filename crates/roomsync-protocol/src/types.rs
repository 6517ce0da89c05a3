//! Core protocol types for Roomsync's wire format.
//!
//! Every frame on the wire is an [`Envelope`]: a message type, a
//! timestamp, and an opaque payload. The payload is itself an encoded
//! body whose shape depends on the type:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ type: CollectionMutation             │  ← routing discriminator
//! │ timestamp: "1760891234567"           │  ← sender clock, ms since epoch
//! │ ┌──────────────────────────────────┐ │
//! │ │ payload: CollectionMutation {..} │ │  ← encoded body
//! │ └──────────────────────────────────┘ │
//! └──────────────────────────────────────┘
//! ```
//!
//! Inside a [`CollectionMutation`] or [`FullExport`] sits one more layer:
//! the record bytes, encoded by the codec registered for that collection
//! type. The protocol layer never looks inside those.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Codec, ProtocolError};

/// The protocol version. Clients send it in their [`Handshake`] and the
/// server rejects mismatches.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier of a namespace (a room). Chosen by callers, carried in the
/// handshake.
///
/// `#[serde(transparent)]` keeps it a plain string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub String);

impl NamespaceId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NamespaceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NamespaceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Names a record schema, e.g. `"playerState"`.
///
/// Used both as the registry key and as the collection address on the
/// wire, so it must be the same string on every peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionTypeId(pub String);

impl CollectionTypeId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionTypeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CollectionTypeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Top-level frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Client → Server: first frame on a socket, payload is [`Handshake`].
    Handshake,
    /// Server → Client: handshake accepted, payload is [`Joined`].
    Joined,
    /// Either direction: liveness check. The server echoes it verbatim.
    Ping,
    /// Either direction: payload is a [`CollectionMutation`].
    CollectionMutation,
    /// Server → Client: payload is a [`FullExport`] snapshot.
    FullExport,
    /// Server → Client: payload is an [`ErrorMessage`].
    Error,
    /// Any tag this build doesn't recognise. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The outer wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// What the payload contains.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Sender clock in milliseconds since the Unix epoch, as a decimal
    /// string.
    pub timestamp: String,

    /// The encoded body.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wraps an already-encoded body, stamped with the current time.
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            timestamp: timestamp_now(),
            payload,
        }
    }

    /// Encodes `body` and wraps it in an envelope, returning the final
    /// frame bytes.
    pub fn frame<C: Codec, T: Serialize>(
        codec: &C,
        kind: MessageType,
        body: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        let payload = codec.encode(body)?;
        codec.encode(&Self::new(kind, payload))
    }

    /// Decodes the payload as `T`.
    pub fn open<C: Codec, T: DeserializeOwned>(
        &self,
        codec: &C,
    ) -> Result<T, ProtocolError> {
        codec.decode(&self.payload)
    }

    /// Parses the timestamp back into milliseconds, if well-formed.
    pub fn timestamp_millis(&self) -> Option<u64> {
        self.timestamp.parse().ok()
    }
}

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// [`now_millis`] rendered as an envelope timestamp.
pub fn timestamp_now() -> String {
    now_millis().to_string()
}

// ---------------------------------------------------------------------------
// Collection frames
// ---------------------------------------------------------------------------

/// Which mutation a [`CollectionMutation`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionEvent {
    Add,
    Update,
    Remove,
}

impl fmt::Display for CollectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One record mutation.
///
/// `payload` is the record encoded by the collection's codec; it is empty
/// for [`CollectionEvent::Remove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMutation {
    pub collection_type_id: CollectionTypeId,
    pub event: CollectionEvent,
    pub item_id: String,
    pub payload: Vec<u8>,
}

/// Snapshot of every record in one collection, used to bring a late
/// joiner up to date. `item_ids` and `payload` are parallel arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullExport {
    pub collection_type_id: CollectionTypeId,
    pub item_ids: Vec<String>,
    pub payload: Vec<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Connection frames
// ---------------------------------------------------------------------------

/// Client → Server: "put me in this namespace".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Must equal [`PROTOCOL_VERSION`].
    pub version: u32,
    /// The namespace to join. Created on the server if it doesn't exist.
    pub namespace_id: NamespaceId,
    /// Caller-chosen identity, used for logging and authentication.
    pub caller_id: String,
    /// Optional credential handed to the server's authenticator.
    #[serde(default)]
    pub token: Option<String>,
}

/// Server → Client: handshake accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joined {
    /// Server-assigned connection id, the one used for echo exclusion.
    pub connection_id: u64,
    pub namespace_id: NamespaceId,
    /// How many `FullExport` frames follow this one, one per collection.
    #[serde(default)]
    pub snapshots: u32,
}

/// Server → Client: something went wrong.
///
/// `code` follows HTTP-style conventions (400 bad request, 401
/// unauthorized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

// =========================================================================
// Tests
// =========================================================================
