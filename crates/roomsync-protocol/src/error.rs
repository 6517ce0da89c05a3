//! Error types for the protocol layer.
//!
//! Each crate in Roomsync defines its own error enum. A `ProtocolError`
//! always means the problem is in turning frames into bytes or back, not
//! in networking or collection state.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// JSON serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// JSON deserialization failed: malformed JSON, missing fields,
    /// wrong data types, or truncated frames.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// Binary serialization failed.
    #[cfg(feature = "binary")]
    #[error("binary encode failed: {0}")]
    BinaryEncode(bincode::error::EncodeError),

    /// Binary deserialization failed.
    #[cfg(feature = "binary")]
    #[error("binary decode failed: {0}")]
    BinaryDecode(bincode::error::DecodeError),

    /// The frame decoded fine but violates protocol rules, e.g. a
    /// handshake with the wrong version or a payload of the wrong kind.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
