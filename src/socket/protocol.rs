//! socket.io v4 framing over engine.io v4
//!
//! Only the subset the chat uses: open, ping/pong, namespace connect and
//! event packets on the default namespace.

use serde::Deserialize;
use serde_json::Value;

use crate::models::{ChatMessage, ParticipantId};

const EV_REGISTER: &str = "register";
const EV_ADMIN_JOIN: &str = "admin_join";
const EV_CUSTOMER_SEND: &str = "sendMessage";
const EV_ADMIN_REPLY: &str = "support_reply";
const EV_FOR_ADMIN: &str = "new_user_message";
const EV_FOR_CUSTOMER: &str = "receiveMessage";

/// Engine.io handshake payload (`0{...}`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(String),
    Close,
    Ping,
    Pong,
    Connected,
    ConnectError(String),
    Disconnected,
    Event { name: String, args: Vec<Value> },
    Unknown(String),
}

impl Packet {
    /// Decode one engine.io text frame.
    pub fn parse(frame: &str) -> Packet {
        let mut chars = frame.chars();
        let Some(kind) = chars.next() else {
            return Packet::Unknown(String::new());
        };
        let rest = chars.as_str();

        match kind {
            '0' => Packet::Open(rest.to_string()),
            '1' => Packet::Close,
            '2' => Packet::Ping,
            '3' => Packet::Pong,
            '4' => parse_socketio(rest),
            _ => Packet::Unknown(frame.to_string()),
        }
    }
}

fn parse_socketio(payload: &str) -> Packet {
    let mut chars = payload.chars();
    let Some(kind) = chars.next() else {
        return Packet::Unknown(payload.to_string());
    };
    let rest = chars.as_str();

    match kind {
        '0' => Packet::Connected,
        '1' => Packet::Disconnected,
        '4' => Packet::ConnectError(rest.to_string()),
        '2' => {
            // Optional ack id digits precede the JSON array.
            let json = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            match serde_json::from_str::<Vec<Value>>(json) {
                Ok(mut items) if !items.is_empty() => match items.remove(0) {
                    Value::String(name) => Packet::Event { name, args: items },
                    _ => Packet::Unknown(payload.to_string()),
                },
                _ => Packet::Unknown(payload.to_string()),
            }
        }
        _ => Packet::Unknown(payload.to_string()),
    }
}

/// Namespace connect frame sent after the engine.io handshake.
pub const CONNECT_FRAME: &str = "40";
/// Reply to an engine.io ping.
pub const PONG_FRAME: &str = "3";

/// Events this client publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    RegisterCustomer(ParticipantId),
    RegisterAdmin,
    CustomerSend(ChatMessage),
    AdminReply(ChatMessage),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::RegisterCustomer(_) => EV_REGISTER,
            OutboundEvent::RegisterAdmin => EV_ADMIN_JOIN,
            OutboundEvent::CustomerSend(_) => EV_CUSTOMER_SEND,
            OutboundEvent::AdminReply(_) => EV_ADMIN_REPLY,
        }
    }

    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            OutboundEvent::RegisterCustomer(_) | OutboundEvent::RegisterAdmin
        )
    }

    /// Encode as a socket.io event frame (`42["name",...]`).
    pub fn to_frame(&self) -> String {
        let mut items = vec![Value::String(self.name().to_string())];
        match self {
            OutboundEvent::RegisterCustomer(id) => {
                items.push(Value::String(id.as_str().to_string()));
            }
            OutboundEvent::RegisterAdmin => {}
            OutboundEvent::CustomerSend(msg) | OutboundEvent::AdminReply(msg) => {
                items.push(serde_json::to_value(msg.to_wire()).unwrap_or(Value::Null));
            }
        }
        format!("42{}", Value::Array(items))
    }
}

/// Events delivered to subscribers, already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessageForAdmin(ChatMessage),
    NewMessageForCustomer(ChatMessage),
}

impl InboundEvent {
    pub fn message(&self) -> &ChatMessage {
        match self {
            InboundEvent::NewMessageForAdmin(m) | InboundEvent::NewMessageForCustomer(m) => m,
        }
    }

    /// Map a socket.io event to an inbound chat event.
    ///
    /// Unknown event names yield `None`; malformed payloads are logged and
    /// dropped.
    pub fn from_event(name: &str, mut args: Vec<Value>) -> Option<Self> {
        let wrap: fn(ChatMessage) -> InboundEvent = match name {
            EV_FOR_ADMIN => InboundEvent::NewMessageForAdmin,
            EV_FOR_CUSTOMER => InboundEvent::NewMessageForCustomer,
            _ => {
                tracing::debug!("Ignoring socket event {}", name);
                return None;
            }
        };

        if args.is_empty() {
            tracing::warn!("Socket event {} carried no payload", name);
            return None;
        }

        match ChatMessage::from_value(args.remove(0)) {
            Ok(msg) => Some(wrap(msg)),
            Err(e) => {
                tracing::warn!("Dropping {} event: {}", name, e);
                None
            }
        }
    }
}
