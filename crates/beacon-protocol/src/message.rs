//! Message types exchanged through the broker.
//!
//! Every type here has a JSON wire form that existing clients depend on:
//! optional fields are omitted when empty rather than encoded as `null`, and
//! decoders accept either omission or an explicit `null` for them.

use crate::raw::RawPayload;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A unique message identifier.
pub type MessageId = String;

/// Per-connection identifier.
pub type ConnId = String;

/// User identifier; empty means anonymous.
pub type UserId = String;

/// Generate a unique message ID.
///
/// IDs are minted concurrently on many nodes without coordination, so they
/// combine a millisecond timestamp with random bits (UUIDv7).
#[must_use]
pub fn generate_message_id() -> MessageId {
    Uuid::now_v7().simple().to_string()
}

/// Current wall clock in whole seconds since the epoch.
#[must_use]
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Identifies a connected client within a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// User ID, empty for anonymous users.
    #[serde(default, deserialize_with = "null_as_default")]
    pub user: UserId,
    /// Connection ID.
    #[serde(default, deserialize_with = "null_as_default")]
    pub client: ConnId,
    /// Info attached when the connection was established.
    #[serde(default, skip_serializing_if = "is_absent")]
    pub default_info: Option<RawPayload>,
    /// Channel-specific info attached on subscribe.
    #[serde(default, skip_serializing_if = "is_absent")]
    pub channel_info: Option<RawPayload>,
}

fn is_absent(info: &Option<RawPayload>) -> bool {
    info.as_ref().map_or(true, RawPayload::is_empty)
}

impl ClientInfo {
    /// Create client info. Fields are taken as given.
    #[must_use]
    pub fn new(
        user: impl Into<UserId>,
        client: impl Into<ConnId>,
        default_info: Option<RawPayload>,
        channel_info: Option<RawPayload>,
    ) -> Self {
        Self {
            user: user.into(),
            client: client.into(),
            default_info,
            channel_info,
        }
    }

    /// Check if the user is anonymous.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user.is_empty()
    }
}

/// The unit of delivery.
///
/// Field order is the wire order: `uid, timestamp, info, channel, data, client`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier, usable for deduplication only.
    #[serde(default, deserialize_with = "null_as_default")]
    pub uid: MessageId,
    /// Seconds since the epoch, string-encoded.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    /// Publisher info, when published on behalf of a client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    /// Target channel.
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel: String,
    /// Application payload.
    #[serde(default)]
    pub data: RawPayload,
    /// Originating connection ID.
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub client: ConnId,
}

impl Message {
    /// Create a new message. The payload is copied.
    #[must_use]
    pub fn new(channel: impl Into<String>, data: &[u8]) -> Self {
        Self {
            uid: generate_message_id(),
            timestamp: unix_seconds().to_string(),
            info: None,
            channel: channel.into(),
            data: RawPayload::decode(data),
            client: ConnId::new(),
        }
    }

    /// Set the originating connection.
    #[must_use]
    pub fn with_client(mut self, client: impl Into<ConnId>) -> Self {
        self.client = client.into();
        self
    }

    /// Attach publisher info.
    #[must_use]
    pub fn with_info(mut self, info: Option<ClientInfo>) -> Self {
        self.info = info;
        self
    }

    /// Timestamp as seconds, if it parses.
    #[must_use]
    pub fn timestamp_secs(&self) -> Option<i64> {
        self.timestamp.parse().ok()
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.data.len()
    }
}

/// Notification that a client joined or left a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinLeaveMessage {
    /// Channel the client joined or left.
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel: String,
    /// The client.
    #[serde(default)]
    pub data: ClientInfo,
}

impl JoinLeaveMessage {
    /// Create a join/leave notification.
    #[must_use]
    pub fn new(channel: impl Into<String>, info: ClientInfo) -> Self {
        Self {
            channel: channel.into(),
            data: info,
        }
    }
}

/// Snapshot of a broker node, shared with peers and admins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node uid, unique per process start.
    pub uid: String,
    /// Human readable node name.
    pub name: String,
    /// Node version.
    #[serde(default)]
    pub version: String,
    /// Connected clients on this node.
    #[serde(default)]
    pub num_clients: usize,
    /// Channels with local subscribers.
    #[serde(default)]
    pub num_channels: usize,
    /// Start time in seconds since the epoch.
    #[serde(default)]
    pub started_at: i64,
}

/// Messages for administrative observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum AdminMessage {
    /// A copy of a message published into a watched channel.
    Message(Message),
    /// Periodic node statistics.
    Node(NodeInfo),
}

/// Cluster-internal command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Liveness and statistics of the sending node.
    Ping(NodeInfo),
}

/// A control message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Uid of the sending node.
    pub uid: String,
    /// The command.
    pub command: ControlCommand,
}

impl ControlMessage {
    /// Create a control message originating from `uid`.
    #[must_use]
    pub fn new(uid: impl Into<String>, command: ControlCommand) -> Self {
        Self {
            uid: uid.into(),
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("test", b"{}");
        assert_eq!(msg.channel, "test");
        assert_eq!(msg.data.as_bytes(), b"{}");
        assert!(msg.client.is_empty());
        assert!(msg.info.is_none());
        assert!(msg.timestamp_secs().is_some());
    }

    #[test]
    fn test_message_encoding_omits_empty_fields() {
        let msg = Message::new("test", b"{}");
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"channel\":\"test\""));
        assert!(json.contains("\"data\":{}"));
        assert!(json.contains("\"timestamp\":"));
        assert!(json.contains("\"uid\":"));
        assert!(!json.contains("\"client\""));
        assert!(!json.contains("\"info\""));
    }

    #[test]
    fn test_message_key_order() {
        let info = ClientInfo::new("42", "conn-1", None, None);
        let mut msg = Message::new("news", b"1")
            .with_client("conn-1")
            .with_info(Some(info));
        msg.uid = "abc".to_string();
        msg.timestamp = "1700000000".to_string();

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"uid":"abc","timestamp":"1700000000","info":{"user":"42","client":"conn-1"},"channel":"news","data":1,"client":"conn-1"}"#
        );
    }

    #[test]
    fn test_message_roundtrip() {
        let plain = Message::new("test", b"{\"a\":1}");
        let json = serde_json::to_vec(&plain).unwrap();
        assert_eq!(serde_json::from_slice::<Message>(&json).unwrap(), plain);

        let info = ClientInfo::new(
            "42",
            "conn-1",
            Some(RawPayload::from("{\"name\":\"Alice\"}")),
            Some(RawPayload::from("[1,2]")),
        );
        let full = Message::new("chat:lobby", b"\"hi\"")
            .with_client("conn-1")
            .with_info(Some(info));
        let json = serde_json::to_vec(&full).unwrap();
        assert_eq!(serde_json::from_slice::<Message>(&json).unwrap(), full);
    }

    #[test]
    fn test_message_decode_tolerates_nulls_and_unknown_keys() {
        let json = r#"{"uid":"u1","timestamp":"1","info":null,"channel":"c","data":null,"client":null,"extra":{"x":[1]}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.uid, "u1");
        assert!(msg.info.is_none());
        assert!(msg.data.is_empty());
        assert!(msg.client.is_empty());

        let omitted: Message = serde_json::from_str(r#"{"uid":"u1","timestamp":"1","channel":"c"}"#).unwrap();
        assert_eq!(omitted, msg);
    }

    #[test]
    fn test_empty_data_encodes_as_null() {
        let msg = Message::new("c", b"");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"data\":null"));
    }

    #[test]
    fn test_client_info_keeps_empty_info_but_omits_it() {
        let info = ClientInfo::new("", "conn-1", Some(RawPayload::empty()), None);
        assert!(info.is_anonymous());
        assert_eq!(info.default_info, Some(RawPayload::empty()));
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"user":"","client":"conn-1"}"#
        );
    }

    #[test]
    fn test_join_leave_encoding() {
        let jl = JoinLeaveMessage::new("room", ClientInfo::new("1", "c1", None, None));
        assert_eq!(
            serde_json::to_string(&jl).unwrap(),
            r#"{"channel":"room","data":{"user":"1","client":"c1"}}"#
        );
    }

    #[test]
    fn test_control_message_encoding() {
        let msg = ControlMessage::new(
            "node-1",
            ControlCommand::Ping(NodeInfo {
                uid: "node-1".into(),
                name: "beacon".into(),
                ..NodeInfo::default()
            }),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"method\":\"ping\""));
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 32);
    }
}
