//! Codec trait and implementations for serializing/deserializing frames.
//!
//! A codec converts between Rust types and raw bytes. The same trait is
//! used for the outer wire envelope and, per collection type, for the
//! records themselves. Two implementations ship:
//!
//! - [`JsonCodec`]: human-readable, easy to inspect in browser DevTools.
//! - [`BincodeCodec`]: compact binary for production traffic.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because codecs live inside long-running Tokio
/// tasks (namespace actors, connection handlers) that may hop threads.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns an encode error if the value can't be represented in
    /// this format.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns a decode error if the bytes are malformed, incomplete,
    /// or don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use roomsync_protocol::{Codec, Envelope, JsonCodec, MessageType};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new(MessageType::Ping, Vec::new());
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

// ---------------------------------------------------------------------------
// BincodeCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses bincode's standard configuration
/// (variable-length integers, little endian).
///
/// Byte payloads stay byte payloads instead of becoming JSON number
/// arrays, which makes this the better fit for high-frequency updates.
#[cfg(feature = "binary")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

#[cfg(feature = "binary")]
impl Codec for BincodeCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(ProtocolError::BinaryEncode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(value, _read)| value)
            .map_err(ProtocolError::BinaryDecode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionEvent, CollectionMutation, Envelope, MessageType};

    fn mutation() -> CollectionMutation {
        CollectionMutation {
            collection_type_id: "playerState".into(),
            event: CollectionEvent::Update,
            item_id: "p1".into(),
            payload: vec![1, 2, 3, 255],
        }
    }

    #[test]
    fn test_json_codec_round_trips_mutation() {
        let codec = JsonCodec;
        let bytes = codec.encode(&mutation()).unwrap();
        let decoded: CollectionMutation = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, mutation());
    }

    #[test]
    fn test_bincode_codec_round_trips_envelope() {
        let codec = BincodeCodec;
        let inner = codec.encode(&mutation()).unwrap();
        let envelope = Envelope::new(MessageType::CollectionMutation, inner);

        let bytes = codec.encode(&envelope).unwrap();
        let decoded: Envelope = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);

        let body: CollectionMutation = decoded.open(&codec).unwrap();
        assert_eq!(body, mutation());
    }

    #[test]
    fn test_bincode_is_smaller_than_json_for_byte_payloads() {
        let envelope =
            Envelope::new(MessageType::CollectionMutation, vec![200; 64]);
        let json = JsonCodec.encode(&envelope).unwrap();
        let binary = BincodeCodec.encode(&envelope).unwrap();
        assert!(binary.len() < json.len());
    }

    #[test]
    fn test_json_decode_garbage_is_decode_error() {
        let result: Result<Envelope, _> = JsonCodec.decode(b"not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_bincode_decode_truncated_is_decode_error() {
        let bytes = BincodeCodec.encode(&mutation()).unwrap();
        let result: Result<CollectionMutation, _> =
            BincodeCodec.decode(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(ProtocolError::BinaryDecode(_))));
    }
}
