//! Wire encoding for peer messages
//!
//! Messages are encoded as self-describing JSON objects with every field
//! explicit and a version number in front, so newer peers can add fields and
//! message types without breaking older ones:
//!
//! ```text
//! {
//!   "v": 1,
//!   "id": "01J9...",
//!   "senderId": "u-ana",
//!   "senderName": "Ana",
//!   "receiverId": null,
//!   "type": "teamLocation",
//!   "content": null,
//!   "payload": { "latitude": 59.91, "longitude": 10.75 },
//!   "timestamp": 1760000000000,
//!   "expiresAt": null
//! }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::message::{MessageType, Payload, PeerMessage};
use crate::error::DecodeError;
use crate::types::{MessageId, Millis, UserId};

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    v: u8,
    id: MessageId,
    sender_id: UserId,
    sender_name: String,
    #[serde(default)]
    receiver_id: Option<UserId>,
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    timestamp: Millis,
    #[serde(default)]
    expires_at: Option<Millis>,
}

impl PeerMessage {
    /// Encode message to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let wire = WireMessage {
            v: WIRE_VERSION,
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            receiver_id: self.receiver_id.clone(),
            message_type: self.message_type,
            content: self.content.clone(),
            payload: payload_to_value(&self.payload)?,
            timestamp: self.timestamp,
            expires_at: self.expires_at,
        };
        serde_json::to_vec(&wire)
    }

    /// Decode message from wire bytes
    ///
    /// # Errors
    ///
    /// - `DecodeError::Malformed` for invalid JSON, a missing required field
    ///   or an unknown type tag
    /// - `DecodeError::UnsupportedVersion` for an unknown wire version
    /// - `DecodeError::InvalidPayload` when the payload does not match its type
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;
        if wire.v != WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(wire.v));
        }
        let payload = payload_from_value(wire.message_type, wire.payload)?;

        Ok(PeerMessage {
            id: wire.id,
            sender_id: wire.sender_id,
            sender_name: wire.sender_name,
            receiver_id: wire.receiver_id,
            message_type: wire.message_type,
            content: wire.content,
            payload,
            timestamp: wire.timestamp,
            expires_at: wire.expires_at,
        })
    }
}

fn payload_to_value(payload: &Payload) -> Result<Option<serde_json::Value>, serde_json::Error> {
    let value = match payload {
        Payload::None => return Ok(None),
        Payload::TaskCompletion(p) => serde_json::to_value(p)?,
        Payload::BarStopVisit(p) => serde_json::to_value(p)?,
        Payload::TeamLocation(p) => serde_json::to_value(p)?,
        Payload::TeamUpdate(p) => serde_json::to_value(p)?,
        Payload::SyncRequest(p) => serde_json::to_value(p)?,
        Payload::SyncResponse(p) => serde_json::to_value(p)?,
        Payload::Opaque(v) => v.clone(),
    };
    Ok(Some(value))
}

fn payload_from_value(
    kind: MessageType,
    value: Option<serde_json::Value>,
) -> Result<Payload, DecodeError> {
    match kind {
        MessageType::Text | MessageType::TeamChat => {
            Ok(value.map_or(Payload::None, Payload::Opaque))
        }
        MessageType::TaskCompletion => required(kind, value).map(Payload::TaskCompletion),
        MessageType::BarStopVisit => required(kind, value).map(Payload::BarStopVisit),
        MessageType::TeamLocation => required(kind, value).map(Payload::TeamLocation),
        MessageType::TeamUpdate => required(kind, value).map(Payload::TeamUpdate),
        MessageType::SyncResponse => required(kind, value).map(Payload::SyncResponse),
        MessageType::SyncRequest => match value {
            None | Some(serde_json::Value::Null) => Ok(Payload::SyncRequest(Default::default())),
            Some(v) => typed(kind, v).map(Payload::SyncRequest),
        },
    }
}

fn required<T: DeserializeOwned>(
    kind: MessageType,
    value: Option<serde_json::Value>,
) -> Result<T, DecodeError> {
    match value {
        None | Some(serde_json::Value::Null) => Err(DecodeError::InvalidPayload {
            kind,
            reason: "missing payload".to_string(),
        }),
        Some(v) => typed(kind, v),
    }
}

fn typed<T: DeserializeOwned>(kind: MessageType, value: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{CompletionPayload, LocationPayload};

    fn completion() -> CompletionPayload {
        CompletionPayload {
            completion_id: "c-42".to_string(),
            task_id: "task-7".to_string(),
            user_id: UserId::from("u-ana"),
            points: Some(25),
            completed_at: 1_700_000_000_000,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_encode_uses_explicit_fields() {
        let msg = PeerMessage::team_location(
            UserId::from("u-ana"),
            "Ana",
            LocationPayload {
                latitude: 59.91,
                longitude: 10.75,
                accuracy_m: None,
            },
        )
        .with_timestamp(1_760_000_000_000);

        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "teamLocation");
        assert_eq!(value["senderId"], "u-ana");
        assert_eq!(value["timestamp"], 1_760_000_000_000i64);
        assert_eq!(value["payload"]["latitude"], 59.91);
        assert!(value["receiverId"].is_null());
    }

    #[test]
    fn test_completion_survives_the_wire() {
        let msg = PeerMessage::task_completion(UserId::from("u-ana"), "Ana", completion())
            .expires_at(1_800_000_000_000);
        let decoded = PeerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_type_tag_is_malformed() {
        let bytes = br#"{"v":1,"id":"m1","senderId":"u1","senderName":"A","type":"teleport","timestamp":1}"#;
        assert!(matches!(
            PeerMessage::decode(bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let bytes = br#"{"v":1,"senderId":"u1","senderName":"A","type":"text","timestamp":1}"#;
        assert!(matches!(
            PeerMessage::decode(bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            PeerMessage::decode(&[0xff, 0x00, 0x13]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let bytes = br#"{"v":9,"id":"m1","senderId":"u1","senderName":"A","type":"text","timestamp":1}"#;
        assert!(matches!(
            PeerMessage::decode(bytes),
            Err(DecodeError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_missing_payload_for_typed_message() {
        let bytes = br#"{"v":1,"id":"m1","senderId":"u1","senderName":"A","type":"teamLocation","timestamp":1}"#;
        match PeerMessage::decode(bytes) {
            Err(DecodeError::InvalidPayload { kind, .. }) => {
                assert_eq!(kind, MessageType::TeamLocation)
            }
            other => panic!("expected invalid payload, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_payload_fields_are_preserved() {
        let bytes = br#"{"v":1,"id":"m1","senderId":"u1","senderName":"A","type":"taskCompletion",
            "payload":{"completionId":"c1","taskId":"t1","userId":"u1","completedAt":5,
                       "photo":{"width":640,"tags":["deck","sunset"]}},
            "timestamp":5}"#;
        let msg = PeerMessage::decode(bytes).unwrap();
        let Payload::TaskCompletion(completion) = &msg.payload else {
            panic!("expected completion payload");
        };
        assert_eq!(completion.extra["photo"]["tags"][1], "sunset");

        let again = PeerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(again, msg);
    }

    #[test]
    fn test_chat_payload_is_kept_opaque() {
        let bytes = br#"{"v":1,"id":"m1","senderId":"u1","senderName":"A","type":"teamChat",
            "content":"hi","payload":{"reaction":{"emoji":"anchor"}},"timestamp":5}"#;
        let msg = PeerMessage::decode(bytes).unwrap();
        match &msg.payload {
            Payload::Opaque(v) => assert_eq!(v["reaction"]["emoji"], "anchor"),
            other => panic!("expected opaque payload, got {:?}", other),
        }
    }

    #[test]
    fn test_sync_request_payload_is_optional() {
        let bytes = br#"{"v":1,"id":"m1","senderId":"u1","senderName":"A","type":"syncRequest","timestamp":5}"#;
        let msg = PeerMessage::decode(bytes).unwrap();
        assert_eq!(msg.payload, Payload::SyncRequest(Default::default()));
    }
}
