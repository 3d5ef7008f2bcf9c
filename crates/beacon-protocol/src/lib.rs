//! # beacon-protocol
//!
//! Message model and wire encoding for the Beacon broker.
//!
//! - [`RawPayload`] - opaque application payload, embedded verbatim in JSON
//! - [`Message`], [`ClientInfo`], [`JoinLeaveMessage`] - what subscribers receive
//! - [`AdminMessage`], [`ControlMessage`] - admin and cluster-internal traffic
//! - [`codec`] - JSON wire form and the framed envelope used between nodes
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Message};
//!
//! let msg = Message::new("news:tech", b"{\"title\":\"hello\"}");
//! let encoded = codec::encode_json(&msg).unwrap();
//! let decoded: Message = codec::decode_json(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod message;
pub mod raw;

pub use codec::{decode, encode, Envelope, EnvelopeKind, ProtocolError};
pub use message::{
    generate_message_id, unix_seconds, AdminMessage, ClientInfo, ConnId, ControlCommand,
    ControlMessage, JoinLeaveMessage, Message, MessageId, NodeInfo, UserId,
};
pub use raw::RawPayload;
