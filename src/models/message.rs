//! Chat message models
//!
//! `WireMessage` is the loose shape the socket and REST backend hand us;
//! `ChatMessage` is the validated form the store and sessions work with.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

/// Customer identity that keys a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Message identifier.
///
/// Optimistic entries carry a client-generated `Local` id until the
/// server-confirmed copy replaces them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(Uuid),
    Server(String),
}

impl MessageId {
    pub fn local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local-{}", id),
            Self::Server(id) => f.write_str(id),
        }
    }
}

/// Which side of the conversation wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Customer,
    Support,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Customer => "user",
            Sender::Support => "support",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" | "customer" => Some(Sender::Customer),
            "support" => Some(Sender::Support),
            _ => None,
        }
    }
}

/// Validated chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub participant_id: ParticipantId,
    pub sender: Sender,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build an optimistic message with a temporary id, stamped now.
    pub fn draft(
        participant_id: ParticipantId,
        sender: Sender,
        body: &str,
    ) -> Result<Self, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyBody);
        }
        Ok(Self {
            id: MessageId::local(),
            participant_id,
            sender,
            body: body.to_string(),
            sent_at: Utc::now(),
        })
    }

    /// Wire form for publishing. Local ids are not sent.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: match &self.id {
                MessageId::Server(id) => Some(id.clone()),
                MessageId::Local(_) => None,
            },
            user_id: Some(self.participant_id.as_str().to_string()),
            sender: Some(self.sender.as_str().to_string()),
            message: Some(self.body.clone()),
            timestamp: Some(self.sent_at.to_rfc3339()),
        }
    }
}

/// Loosely typed message as it appears on the socket and REST API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TryFrom<WireMessage> for ChatMessage {
    type Error = ChatError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let participant = wire
            .user_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ChatError::InvalidMessage("missing userId".into()))?;

        let sender_raw = wire.sender.unwrap_or_default();
        let sender = Sender::parse(&sender_raw)
            .ok_or_else(|| ChatError::InvalidMessage(format!("unknown sender {:?}", sender_raw)))?;

        let body = wire.message.unwrap_or_default();
        if body.trim().is_empty() {
            return Err(ChatError::InvalidMessage("empty message body".into()));
        }

        // Local ids mark our own unconfirmed sends; a remote message
        // without a durable id could never be de-duplicated.
        let id = wire
            .id
            .filter(|id| !id.trim().is_empty())
            .map(MessageId::Server)
            .ok_or_else(|| ChatError::InvalidMessage("missing _id".into()))?;

        let sent_at = wire
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            id,
            participant_id: ParticipantId::new(participant),
            sender,
            body,
            sent_at,
        })
    }
}

impl ChatMessage {
    /// Coerce an arbitrary JSON payload into a message.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ChatError> {
        let wire: WireMessage = serde_json::from_value(value)
            .map_err(|e| ChatError::InvalidMessage(e.to_string()))?;
        Self::try_from(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_message_coercion() {
        let msg = ChatMessage::from_value(json!({
            "_id": "65f1",
            "userId": "u1",
            "sender": "user",
            "message": "hi",
            "timestamp": "2024-03-01T10:00:00.000Z"
        }))
        .unwrap();

        assert_eq!(msg.id, MessageId::Server("65f1".into()));
        assert_eq!(msg.participant_id, ParticipantId::new("u1"));
        assert_eq!(msg.sender, Sender::Customer);
        assert_eq!(msg.body, "hi");
        assert_eq!(msg.sent_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_missing_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let msg = ChatMessage::from_value(json!({
            "_id": "m9",
            "userId": "u1",
            "sender": "support",
            "message": "hello"
        }))
        .unwrap();

        assert_eq!(msg.id, MessageId::Server("m9".into()));
        assert!(msg.sent_at >= before);
        assert_eq!(msg.sender, Sender::Support);
    }

    #[test]
    fn test_remote_message_without_id_is_rejected() {
        let payload = json!({"userId": "u1", "sender": "support", "message": "hello"});
        assert!(matches!(
            ChatMessage::from_value(payload),
            Err(ChatError::InvalidMessage(_))
        ));
        assert!(ChatMessage::from_value(
            json!({"_id": " ", "userId": "u1", "sender": "user", "message": "x"})
        )
        .is_err());
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        assert!(ChatMessage::from_value(json!({"sender": "user", "message": "x"})).is_err());
        assert!(
            ChatMessage::from_value(json!({"userId": "u1", "sender": "bot", "message": "x"}))
                .is_err()
        );
        assert!(
            ChatMessage::from_value(json!({"userId": "u1", "sender": "user", "message": "  "}))
                .is_err()
        );
        assert!(ChatMessage::from_value(json!("just a string")).is_err());
    }

    #[test]
    fn test_draft_trims_and_rejects_blank() {
        let msg = ChatMessage::draft("u1".into(), Sender::Customer, "  hi there ").unwrap();
        assert_eq!(msg.body, "hi there");
        assert!(msg.id.is_local());

        assert!(matches!(
            ChatMessage::draft("u1".into(), Sender::Customer, "   "),
            Err(ChatError::EmptyBody)
        ));
    }

    #[test]
    fn test_to_wire_omits_local_id() {
        let msg = ChatMessage::draft("u1".into(), Sender::Customer, "hi").unwrap();
        let value = serde_json::to_value(msg.to_wire()).unwrap();
        assert!(value.get("_id").is_none());
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["sender"], "user");
        assert_eq!(value["message"], "hi");
    }
}
