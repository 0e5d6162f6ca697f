//! Live-channel wire protocol.
//!
//! Frames are JSON text messages:
//!
//! - client → server: `{"event": <name>, "data": <payload>, "ack": <id>?}`
//! - server → client: `{"event": <name>, "data": <payload>}`
//!
//! A client frame carrying an `ack` id gets exactly one `ack` frame back
//! with the same id, telling it whether the action succeeded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::error::ChatError;
use crate::storage::Message;

pub const EVENT_JOIN_CONVERSATION: &str = "conversation:join";
pub const EVENT_SEND_MESSAGE: &str = "message:send";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_MARK_READ: &str = "messages:markRead";

/// A raw client frame, before the payload is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_event(event: &ClientEvent, ack: Option<u64>) -> Result<Self, ProtocolError> {
        let (name, data) = match event {
            ClientEvent::JoinConversation(id) => (EVENT_JOIN_CONVERSATION, Value::String(id.to_string())),
            ClientEvent::SendMessage(req) => (EVENT_SEND_MESSAGE, to_value(req)?),
            ClientEvent::Typing(req) => (EVENT_TYPING, to_value(req)?),
            ClientEvent::MarkRead(id) => (EVENT_MARK_READ, Value::String(id.to_string())),
        };
        Ok(Self {
            event: name.to_string(),
            data,
            ack,
        })
    }

    /// Interpret the payload according to the event name.
    pub fn into_event(self) -> Result<ClientEvent, ProtocolError> {
        match self.event.as_str() {
            EVENT_JOIN_CONVERSATION => conversation_id(self.data).map(ClientEvent::JoinConversation),
            EVENT_SEND_MESSAGE => payload(self.data).map(ClientEvent::SendMessage),
            EVENT_TYPING => payload(self.data).map(ClientEvent::Typing),
            EVENT_MARK_READ => conversation_id(self.data).map(ClientEvent::MarkRead),
            _ => Err(ProtocolError::UnknownEvent(self.event)),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn payload<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// Accepts a bare id string or `{"conversationId": …}`.
fn conversation_id(data: Value) -> Result<Uuid, ProtocolError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ById {
        conversation_id: Uuid,
    }

    match data {
        Value::String(s) => Uuid::parse_str(&s)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
        other => payload::<ById>(other).map(|b| b.conversation_id),
    }
}

/// A client action.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinConversation(Uuid),
    SendMessage(SendMessageRequest),
    Typing(TypingRequest),
    MarkRead(Uuid),
}

/// Send request, shared by the live and fallback paths.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub to_user_id: Option<Uuid>,
    #[serde(default)]
    pub content: Option<String>,
}

impl SendMessageRequest {
    pub fn new(to_user_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            to_user_id: Some(to_user_id),
            content: Some(content.into()),
        }
    }

    /// Both fields are required.
    pub fn validate(self) -> Result<(Uuid, String), ChatError> {
        match (self.to_user_id, self.content) {
            (Some(to), Some(content)) => Ok((to, content)),
            _ => Err(ChatError::validation("toUserId and content are required")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    #[serde(default)]
    pub to_user_id: Option<Uuid>,
    #[serde(default)]
    pub is_typing: bool,
}

/// `typing` as delivered to the recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub from_user_id: Uuid,
    pub is_typing: bool,
}

/// `messages:read` payload. Carries no message list: receivers re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadNotice {
    pub conversation_id: Uuid,
    pub reader_id: Uuid,
}

/// Acknowledgement payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBody {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckBody {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn joined(conversation_id: Uuid) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::ok()
        }
    }

    pub fn sent(message: Message) -> Self {
        Self {
            conversation_id: Some(message.conversation_id),
            message: Some(message),
            ..Self::ok()
        }
    }

    pub fn read(conversation_id: Uuid, updated: usize) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            updated: Some(updated),
            ..Self::ok()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: u64,
    #[serde(flatten)]
    pub body: AckBody,
}

/// A server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "typing")]
    Typing(TypingNotice),
    #[serde(rename = "messages:read")]
    MessagesRead(ReadNotice),
    #[serde(rename = "ack")]
    Ack(Ack),
}

impl ServerEvent {
    pub fn ack(id: u64, body: AckBody) -> Self {
        ServerEvent::Ack(Ack { ack: id, body })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Encode once into a shareable broadcast frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.encode().map(Arc::from)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnknownEvent(String),
    ConnectionClosed,
    Timeout,
    /// The server refused the WebSocket upgrade
    HandshakeRejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownEvent(name) => write!(f, "Unknown event: {name}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::HandshakeRejected(e) => write!(f, "Handshake rejected: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
