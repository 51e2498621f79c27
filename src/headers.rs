//! Message headers and the envelope wire codec.
//!
//! Headers are an insertion-ordered map from string keys to small scalar
//! values. A handful of keys are reserved by the core (see [`keys`]);
//! everything else is passed through transports unchanged.
//!
//! The wire codec serializes a header map alongside a payload into the
//! default envelope format used by loopback and by transports that have no
//! native header support:
//! `[u16 count] [per header: u16 keyLen, key, u8 tag, u32 valueLen, value]
//! [payload to end]`, all integers big-endian.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BusError;

/// Header keys reserved by the core. Transports must preserve unknown keys
/// end-to-end; these are the only ones the dispatch core interprets.
pub mod keys {
    /// Unique id of a request/response exchange.
    pub const REQUEST_ID: &str = "RequestId";
    /// Logical address replies are delivered to.
    pub const REPLY_TO: &str = "ReplyTo";
    /// Absolute unix-millis timestamp after which the message is dropped.
    pub const EXPIRES: &str = "Expires";
    /// Non-empty on a reply when the remote handler failed.
    pub const ERROR: &str = "Error";
    /// Optional hint for polymorphic deserialization.
    pub const MESSAGE_TYPE: &str = "MessageType";
}

// ---------------------------------------------------------------------------
// HeaderValue
// ---------------------------------------------------------------------------

/// A header value. Wire tags: 0=string, 1=int64, 2=bool, 3=unix-millis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    I64(i64),
    Bool(bool),
    /// Milliseconds since the unix epoch.
    Millis(u64),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Insertion-ordered header map. Inserting an existing key replaces the
/// value in place, keeping the original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(HeaderValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(HeaderValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(HeaderValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_millis(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(HeaderValue::Millis(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Current wall-clock time in milliseconds since the unix epoch.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Envelope wire codec
// ---------------------------------------------------------------------------

const TAG_STR: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_MILLIS: u8 = 3;

fn codec_error(reason: impl ToString) -> BusError {
    BusError::serialization("envelope", reason)
}

/// Encode `(headers, payload)` into the default envelope format.
///
/// # Errors
///
/// Returns a serialization error if the header count, a key, or a string
/// value exceeds its length field.
pub fn encode_envelope(headers: &Headers, payload: &[u8]) -> Result<Bytes, BusError> {
    let count = u16::try_from(headers.len()).map_err(|_| codec_error("too many headers"))?;
    let mut buf = BytesMut::with_capacity(2 + headers.len() * 16 + payload.len());
    buf.put_u16(count);
    for (key, value) in headers.iter() {
        let key_len =
            u16::try_from(key.len()).map_err(|_| codec_error(format!("key too long: {key}")))?;
        buf.put_u16(key_len);
        buf.put_slice(key.as_bytes());
        match value {
            HeaderValue::Str(s) => {
                let value_len = u32::try_from(s.len())
                    .map_err(|_| codec_error(format!("value too long for key {key}")))?;
                buf.put_u8(TAG_STR);
                buf.put_u32(value_len);
                buf.put_slice(s.as_bytes());
            }
            HeaderValue::I64(v) => {
                buf.put_u8(TAG_I64);
                buf.put_u32(8);
                buf.put_i64(*v);
            }
            HeaderValue::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u32(1);
                buf.put_u8(u8::from(*v));
            }
            HeaderValue::Millis(v) => {
                buf.put_u8(TAG_MILLIS);
                buf.put_u32(8);
                buf.put_u64(*v);
            }
        }
    }
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode an envelope produced by [`encode_envelope`], returning the header
/// map and the remaining payload bytes.
///
/// # Errors
///
/// Returns a serialization error on truncated input, an unknown type tag,
/// or a malformed value.
pub fn decode_envelope(buf: &[u8]) -> Result<(Headers, Bytes), BusError> {
    let mut cursor = buf;
    if cursor.remaining() < 2 {
        return Err(codec_error("truncated header count"));
    }
    let count = cursor.get_u16();
    let mut headers = Headers::new();
    for _ in 0..count {
        if cursor.remaining() < 2 {
            return Err(codec_error("truncated key length"));
        }
        let key_len = cursor.get_u16() as usize;
        if cursor.remaining() < key_len {
            return Err(codec_error("truncated key"));
        }
        let key = std::str::from_utf8(&cursor[..key_len])
            .map_err(|e| codec_error(format!("key is not utf-8: {e}")))?
            .to_string();
        cursor.advance(key_len);
        if cursor.remaining() < 5 {
            return Err(codec_error("truncated value header"));
        }
        let tag = cursor.get_u8();
        let value_len = cursor.get_u32() as usize;
        if cursor.remaining() < value_len {
            return Err(codec_error("truncated value"));
        }
        let value = match tag {
            TAG_STR => {
                let s = std::str::from_utf8(&cursor[..value_len])
                    .map_err(|e| codec_error(format!("value is not utf-8: {e}")))?
                    .to_string();
                cursor.advance(value_len);
                HeaderValue::Str(s)
            }
            TAG_I64 => {
                if value_len != 8 {
                    return Err(codec_error("int64 value must be 8 bytes"));
                }
                HeaderValue::I64(cursor.get_i64())
            }
            TAG_BOOL => {
                if value_len != 1 {
                    return Err(codec_error("bool value must be 1 byte"));
                }
                HeaderValue::Bool(cursor.get_u8() != 0)
            }
            TAG_MILLIS => {
                if value_len != 8 {
                    return Err(codec_error("unix-millis value must be 8 bytes"));
                }
                HeaderValue::Millis(cursor.get_u64())
            }
            other => return Err(codec_error(format!("unknown header type tag {other}"))),
        };
        headers.insert(key, value);
    }
    Ok((headers, Bytes::copy_from_slice(cursor)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> Headers {
        let mut headers = Headers::new();
        headers.insert(keys::REQUEST_ID, "req-1");
        headers.insert("retries", 3i64);
        headers.insert("compressed", false);
        headers.insert(keys::EXPIRES, HeaderValue::Millis(1_700_000_000_000));
        headers
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("b", "2");
        headers.insert("a", "3");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get_str("a"), Some("3"));
        // Position of "a" is unchanged.
        let order: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn typed_getters_reject_wrong_variant() {
        let headers = sample_headers();
        assert_eq!(headers.get_str(keys::REQUEST_ID), Some("req-1"));
        assert_eq!(headers.get_i64(keys::REQUEST_ID), None);
        assert_eq!(headers.get_i64("retries"), Some(3));
        assert_eq!(headers.get_bool("compressed"), Some(false));
        assert_eq!(headers.get_millis(keys::EXPIRES), Some(1_700_000_000_000));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn remove_returns_value() {
        let mut headers = sample_headers();
        assert_eq!(headers.remove("retries"), Some(HeaderValue::I64(3)));
        assert!(!headers.contains("retries"));
        assert_eq!(headers.remove("retries"), None);
    }

    #[test]
    fn envelope_roundtrip() {
        let headers = sample_headers();
        let payload = b"hello world";

        let encoded = encode_envelope(&headers, payload).unwrap();
        let (decoded, rest) = decode_envelope(&encoded).unwrap();

        assert_eq!(decoded, headers);
        assert_eq!(&rest[..], payload);
    }

    #[test]
    fn envelope_roundtrip_empty_headers() {
        let encoded = encode_envelope(&Headers::new(), b"p").unwrap();
        let (decoded, rest) = decode_envelope(&encoded).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(&rest[..], b"p");
    }

    #[test]
    fn envelope_preserves_header_order() {
        let mut headers = Headers::new();
        headers.insert("z", "1");
        headers.insert("a", "2");
        headers.insert("m", "3");

        let encoded = encode_envelope(&headers, &[]).unwrap();
        let (decoded, _) = decode_envelope(&encoded).unwrap();

        let order: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["z", "a", "m"]);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let headers = sample_headers();
        let encoded = encode_envelope(&headers, b"payload").unwrap();

        // Chop in the middle of the header section.
        let err = decode_envelope(&encoded[..6]).unwrap_err();
        assert!(matches!(err, BusError::Serialization { .. }));

        let err = decode_envelope(&[]).unwrap_err();
        assert!(matches!(err, BusError::Serialization { .. }));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        // count=1, keyLen=1, key='k', tag=9, valueLen=0
        let raw = [0u8, 1, 0, 1, b'k', 9, 0, 0, 0, 0];
        let err = decode_envelope(&raw).unwrap_err();
        assert!(format!("{err}").contains("unknown header type tag"));
    }

    #[test]
    fn wire_layout_is_stable() {
        let mut headers = Headers::new();
        headers.insert("k", true);
        let encoded = encode_envelope(&headers, &[0xAB]).unwrap();
        // count=1 | keyLen=1 | 'k' | tag=2 | valueLen=1 | 1 | payload
        assert_eq!(
            &encoded[..],
            &[0, 1, 0, 1, b'k', TAG_BOOL, 0, 0, 0, 1, 1, 0xAB]
        );
    }
}
