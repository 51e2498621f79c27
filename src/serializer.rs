//! Payload serialization contract and the transport envelope.
//!
//! A transport is configured with one [`Serializer`]: [`CodecSerializer`]
//! round-trips messages through their registered MessagePack codec, while
//! [`NullSerializer`] passes the original value through untouched -- the
//! loopback optimization for in-process delivery without copying.

use std::fmt;

use bytes::Bytes;

use crate::error::BusError;
use crate::headers::Headers;
use crate::message::{AnyMessage, DecodeFn, MessageCodec};

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The payload half of an envelope.
#[derive(Clone)]
pub enum Payload {
    /// Encoded bytes that crossed (or can cross) a transport boundary.
    Bytes(Bytes),
    /// Loopback sentinel: the original message travels by reference and the
    /// receiving side must use it directly.
    Value(AnyMessage),
}

impl Payload {
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Value(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// The unit exchanged with a transport: headers plus payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub headers: Headers,
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// Serializer contract
// ---------------------------------------------------------------------------

/// Pluggable payload codec selected per transport.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Encode an outbound message into a transport payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the codec rejects the message.
    fn serialize(&self, codec: &MessageCodec, message: &AnyMessage) -> Result<Payload, BusError>;

    /// Decode an inbound payload into a message value. Both implementations
    /// accept both payload variants so a bytes envelope arriving at a
    /// pass-through transport (or vice versa) still decodes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the payload bytes are malformed.
    fn deserialize(&self, decode: &DecodeFn, payload: Payload) -> Result<AnyMessage, BusError>;
}

/// Round-trips messages through their registered codec. The consumer
/// observes a structurally-equal clone of the produced message.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecSerializer;

impl Serializer for CodecSerializer {
    fn serialize(&self, codec: &MessageCodec, message: &AnyMessage) -> Result<Payload, BusError> {
        (codec.encode)(message.as_ref()).map(Payload::Bytes)
    }

    fn deserialize(&self, decode: &DecodeFn, payload: Payload) -> Result<AnyMessage, BusError> {
        match payload {
            Payload::Bytes(bytes) => decode(&bytes),
            Payload::Value(value) => Ok(value),
        }
    }
}

/// Identity serializer: the consumer observes the producer's original value.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSerializer;

impl Serializer for NullSerializer {
    fn serialize(&self, _codec: &MessageCodec, message: &AnyMessage) -> Result<Payload, BusError> {
        Ok(Payload::Value(message.clone()))
    }

    fn deserialize(&self, decode: &DecodeFn, payload: Payload) -> Result<AnyMessage, BusError> {
        match payload {
            Payload::Value(value) => Ok(value),
            Payload::Bytes(bytes) => decode(&bytes),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[test]
    fn codec_serializer_clones_by_value() {
        let codec = MessageCodec::of::<Ping>();
        let serializer = CodecSerializer;
        let original: AnyMessage = Arc::new(Ping { seq: 9 });

        let payload = serializer.serialize(&codec, &original).unwrap();
        assert!(matches!(payload, Payload::Bytes(_)));

        let decoded = serializer.deserialize(&codec.decode, payload).unwrap();
        let ping = decoded.downcast_ref::<Ping>().unwrap();
        assert_eq!(ping.seq, 9);
        assert!(!Arc::ptr_eq(&original, &decoded));
    }

    #[test]
    fn null_serializer_passes_reference_through() {
        let codec = MessageCodec::of::<Ping>();
        let serializer = NullSerializer;
        let original: AnyMessage = Arc::new(Ping { seq: 3 });

        let payload = serializer.serialize(&codec, &original).unwrap();
        let Payload::Value(value) = &payload else {
            panic!("expected sentinel payload");
        };
        assert!(Arc::ptr_eq(&original, value));

        let decoded = serializer.deserialize(&codec.decode, payload).unwrap();
        assert!(Arc::ptr_eq(&original, &decoded));
    }

    #[test]
    fn serializers_decode_the_foreign_variant() {
        let codec = MessageCodec::of::<Ping>();
        let original: AnyMessage = Arc::new(Ping { seq: 1 });

        // Null serializer still decodes bytes.
        let bytes = CodecSerializer.serialize(&codec, &original).unwrap();
        let decoded = NullSerializer.deserialize(&codec.decode, bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Ping>().unwrap().seq, 1);

        // Codec serializer still accepts a sentinel.
        let sentinel = NullSerializer.serialize(&codec, &original).unwrap();
        let decoded = CodecSerializer.deserialize(&codec.decode, sentinel).unwrap();
        assert!(Arc::ptr_eq(&original, &decoded));
    }
}
