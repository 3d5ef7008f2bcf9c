//! Encoding for messages and inter-node envelopes.
//!
//! Client-facing messages use their JSON wire form. Between nodes, each
//! message travels inside an [`Envelope`]: a MessagePack record with
//! length-prefixed framing whose body is the MessagePack form of the message.
//! Raw payloads ride in that body as plain bytes and are never parsed.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum EnvelopeKind {
    Message = 0x01,
    Join = 0x02,
    Leave = 0x03,
    Admin = 0x04,
    Control = 0x05,
}

impl From<EnvelopeKind> for u8 {
    fn from(kind: EnvelopeKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EnvelopeKind::Message),
            0x02 => Ok(EnvelopeKind::Join),
            0x03 => Ok(EnvelopeKind::Leave),
            0x04 => Ok(EnvelopeKind::Admin),
            0x05 => Ok(EnvelopeKind::Control),
            _ => Err("Invalid envelope kind"),
        }
    }
}

/// A routed unit on the inter-node bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload kind.
    pub kind: EnvelopeKind,
    /// Routing key the envelope was published to.
    pub channel: String,
    /// MessagePack body.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Envelope {
    /// Wrap a value by encoding it as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn wrap<T: Serialize>(
        kind: EnvelopeKind,
        channel: impl Into<String>,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            channel: channel.into(),
            body: rmp_serde::to_vec_named(value)?,
        })
    }

    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not decode as `T`.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }
}

/// Encode a value to its JSON wire form.
///
/// # Errors
///
/// Returns an error if serialization fails, e.g. a raw payload that is not
/// valid JSON.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a value from its JSON wire form.
///
/// # Errors
///
/// Returns an error if the data is not valid JSON for `T`.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Encode an envelope to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(envelope)
}
