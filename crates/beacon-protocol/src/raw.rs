//! Opaque payload carrier.
//!
//! [`RawPayload`] holds an application payload (usually a JSON value) without
//! ever interpreting it. Validity of the contents is the producer's concern.
//! Binary formats (the inter-node envelope) carry the bytes as-is; the only
//! time they are looked at is when a message is rendered to its JSON wire
//! form, where they are embedded verbatim.

use bytes::Bytes;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Error as _, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;

/// An immutable, uninterpreted payload.
///
/// Equality and ordering are byte-wise over the stored bytes. An empty
/// payload stands for "absent" and encodes as JSON `null`.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawPayload(Bytes);

impl RawPayload {
    /// The absent payload.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Build a payload from borrowed input.
    ///
    /// The bytes are copied so the payload never aliases the caller's buffer.
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        Self(Bytes::copy_from_slice(data))
    }

    /// The stored bytes, or `None` when the payload is absent.
    #[must_use]
    pub fn encode(&self) -> Option<&[u8]> {
        if self.0.is_empty() {
            None
        } else {
            Some(&self.0)
        }
    }

    /// Build a payload from a JSON value.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self(Bytes::from(value.to_string()))
    }

    /// The stored bytes (empty when absent).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the payload is absent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for RawPayload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&[u8]> for RawPayload {
    fn from(bytes: &[u8]) -> Self {
        Self::decode(bytes)
    }
}

impl From<&str> for RawPayload {
    fn from(s: &str) -> Self {
        Self::decode(s.as_bytes())
    }
}

impl fmt::Debug for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPayload({})", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for RawPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            return serializer.serialize_bytes(&self.0);
        }
        let Some(bytes) = self.encode() else {
            return serializer.serialize_none();
        };
        let text = std::str::from_utf8(bytes)
            .map_err(|e| S::Error::custom(format!("raw payload is not utf-8: {e}")))?;
        let raw: &RawValue = serde_json::from_str(text)
            .map_err(|e| S::Error::custom(format!("raw payload is not valid JSON: {e}")))?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RawPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if !deserializer.is_human_readable() {
            let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
            return Ok(Self::from(buf.into_vec()));
        }
        let raw = Option::<Box<RawValue>>::deserialize(deserializer)?;
        Ok(raw.map_or_else(Self::empty, |raw| Self::decode(raw.get().as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_decode_copies_input() {
        let mut buf = b"{\"a\":1}".to_vec();
        let payload = RawPayload::decode(&buf);
        buf[2] = b'b';
        assert_eq!(payload.as_bytes(), b"{\"a\":1}");
    }

    #[test]
    fn test_empty_is_absent() {
        let payload = RawPayload::decode(b"");
        assert!(payload.is_empty());
        assert_eq!(payload.encode(), None);
        assert_eq!(serde_json::to_string(&payload).unwrap(), "null");
    }

    #[test]
    fn test_json_passthrough() {
        let payload = RawPayload::from("{\"foo\":[1,2,{\"bar\":null}]}");
        let encoded = serde_json::to_string(&payload).unwrap();
        assert_eq!(encoded, "{\"foo\":[1,2,{\"bar\":null}]}");

        let decoded: RawPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_null_decodes_to_empty() {
        let decoded: RawPayload = serde_json::from_str("null").unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_invalid_json_is_carried_until_encoded() {
        let payload = RawPayload::from("not json");
        assert_eq!(payload.len(), 8);

        let err = serde_json::to_string(&payload).unwrap_err();
        assert!(err.to_string().contains("raw payload is not valid JSON"));
    }

    #[test]
    fn test_binary_form_keeps_bytes_unparsed() {
        let payload = RawPayload::from("{not json at all");
        let packed = rmp_serde::to_vec(&payload).unwrap();
        let unpacked: RawPayload = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(unpacked, payload);

        let packed = rmp_serde::to_vec(&RawPayload::empty()).unwrap();
        let unpacked: RawPayload = rmp_serde::from_slice(&packed).unwrap();
        assert!(unpacked.is_empty());
    }

    #[test]
    fn test_bytewise_ordering() {
        let a = RawPayload::from("\"a\"");
        let b = RawPayload::from("\"b\"");
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(a.cmp(&a.clone()), Ordering::Equal);
        assert_ne!(a, b);
    }
}
