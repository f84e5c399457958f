//! JSON event protocol spoken over the real-time channel.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! { "event": "message:send", "data": { "conversationId": "…", "content": "…" } }
//! { "event": "ping" }
//! ```
//!
//! Event names are the interoperability surface and must match the server
//! byte for byte. Both directions are closed enums so that a new event kind is
//! a compile-checked addition instead of a stringly-typed handler.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    Conversation, ConversationKind, Message, Notification, Participant, PresenceStatus, TestAlert,
};

// ───────────────────────────────────────────────────────────────────
// Outbound payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateRequest {
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAlertRequest {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

/// Events the client emits.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SendMessage(SendMessage),
    EditMessage(EditMessage),
    DeleteMessage(MessageRef),
    React(ReactionRequest),
    Unreact(ReactionRequest),
    TypingStart(ConversationRef),
    TypingStop(ConversationRef),
    PresenceUpdate(PresenceUpdateRequest),
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    Ping,
    SendTestAlert(TestAlertRequest),
    AcknowledgeTestAlert(IdRef),
    MarkNotificationRead(IdRef),
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => "message:send",
            ClientEvent::EditMessage(_) => "message:edit",
            ClientEvent::DeleteMessage(_) => "message:delete",
            ClientEvent::React(_) => "message:react",
            ClientEvent::Unreact(_) => "message:unreact",
            ClientEvent::TypingStart(_) => "typing:start",
            ClientEvent::TypingStop(_) => "typing:stop",
            ClientEvent::PresenceUpdate(_) => "presence:update",
            ClientEvent::JoinConversation(_) => "conversation:join",
            ClientEvent::LeaveConversation(_) => "conversation:leave",
            ClientEvent::Ping => "ping",
            ClientEvent::SendTestAlert(_) => "test:alert:send",
            ClientEvent::AcknowledgeTestAlert(_) => "test:alert:acknowledge",
            ClientEvent::MarkNotificationRead(_) => "notification:read",
        }
    }

    /// Message id this event targets, if any.
    pub fn target_message(&self) -> Option<&str> {
        match self {
            ClientEvent::EditMessage(p) => Some(&p.message_id),
            ClientEvent::DeleteMessage(p) => Some(&p.message_id),
            ClientEvent::React(p) | ClientEvent::Unreact(p) => Some(&p.message_id),
            _ => None,
        }
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            ClientEvent::SendMessage(p) => serde_json::to_value(p),
            ClientEvent::EditMessage(p) => serde_json::to_value(p),
            ClientEvent::DeleteMessage(p) => serde_json::to_value(p),
            ClientEvent::React(p) | ClientEvent::Unreact(p) => serde_json::to_value(p),
            ClientEvent::TypingStart(p)
            | ClientEvent::TypingStop(p)
            | ClientEvent::JoinConversation(p)
            | ClientEvent::LeaveConversation(p) => serde_json::to_value(p),
            ClientEvent::PresenceUpdate(p) => serde_json::to_value(p),
            ClientEvent::Ping => Ok(Value::Null),
            ClientEvent::SendTestAlert(p) => serde_json::to_value(p),
            ClientEvent::AcknowledgeTestAlert(p) | ClientEvent::MarkNotificationRead(p) => {
                serde_json::to_value(p)
            }
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = self
            .payload()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        encode_frame(self.name(), data)
    }

    /// Parse a text frame sent by a client (used by loopback servers and tests).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame = parse_frame(text)?;
        let event = match frame.event.as_str() {
            "message:send" => ClientEvent::SendMessage(data(frame.data)?),
            "message:edit" => ClientEvent::EditMessage(data(frame.data)?),
            "message:delete" => ClientEvent::DeleteMessage(data(frame.data)?),
            "message:react" => ClientEvent::React(data(frame.data)?),
            "message:unreact" => ClientEvent::Unreact(data(frame.data)?),
            "typing:start" => ClientEvent::TypingStart(data(frame.data)?),
            "typing:stop" => ClientEvent::TypingStop(data(frame.data)?),
            "presence:update" => ClientEvent::PresenceUpdate(data(frame.data)?),
            "conversation:join" => ClientEvent::JoinConversation(data(frame.data)?),
            "conversation:leave" => ClientEvent::LeaveConversation(data(frame.data)?),
            "ping" => ClientEvent::Ping,
            "test:alert:send" => ClientEvent::SendTestAlert(data(frame.data)?),
            "test:alert:acknowledge" => ClientEvent::AcknowledgeTestAlert(data(frame.data)?),
            "notification:read" => ClientEvent::MarkNotificationRead(data(frame.data)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdited {
    pub message_id: String,
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChange {
    pub message_id: String,
    pub conversation_id: String,
    pub emoji: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub conversation_id: String,
    pub user_id: String,
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Snapshot of several users' presence.
///
/// The server sends either a bare array or `{ "users": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PresenceBatchRepr")]
pub struct PresenceBatch {
    pub users: Vec<PresenceChange>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PresenceBatchRepr {
    List(Vec<PresenceChange>),
    Wrapped {
        #[serde(alias = "presences")]
        users: Vec<PresenceChange>,
    },
}

impl From<PresenceBatchRepr> for PresenceBatch {
    fn from(repr: PresenceBatchRepr) -> Self {
        match repr {
            PresenceBatchRepr::List(users) | PresenceBatchRepr::Wrapped { users } => {
                PresenceBatch { users }
            }
        }
    }
}

/// Body of `conversation:created` and `conversation:updated`.
///
/// The unread count and last message are tracked on the client; absent
/// fields leave the stored values alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationChange {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl From<Conversation> for ConversationChange {
    fn from(conv: Conversation) -> Self {
        Self {
            id: conv.id,
            kind: conv.kind,
            name: conv.name,
            participants: Some(conv.participants),
            last_message: conv.last_message,
            unread_count: Some(conv.unread_count),
            updated_at: conv.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertAcknowledged {
    pub id: String,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
}

/// Which component an inbound event is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Conversation,
    Presence,
    Alert,
    Heartbeat,
}

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    MessageReceived(Message),
    MessageEdited(MessageEdited),
    MessageDeleted(MessageDeleted),
    ReactionAdded(ReactionChange),
    ReactionRemoved(ReactionChange),
    TypingIndicator(TypingIndicator),
    PresenceUpdate(PresenceChange),
    PresenceBatch(PresenceBatch),
    ConversationCreated(ConversationChange),
    ConversationUpdated(ConversationChange),
    Notification(Notification),
    TestAlert(TestAlert),
    TestAlertAcknowledged(AlertAcknowledged),
    Pong,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageReceived(_) => "message:received",
            ServerEvent::MessageEdited(_) => "message:edited",
            ServerEvent::MessageDeleted(_) => "message:deleted",
            ServerEvent::ReactionAdded(_) => "message:reaction:added",
            ServerEvent::ReactionRemoved(_) => "message:reaction:removed",
            ServerEvent::TypingIndicator(_) => "typing:indicator",
            ServerEvent::PresenceUpdate(_) => "presence:update",
            ServerEvent::PresenceBatch(_) => "presence:batch",
            ServerEvent::ConversationCreated(_) => "conversation:created",
            ServerEvent::ConversationUpdated(_) => "conversation:updated",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::TestAlert(_) => "test:alert",
            ServerEvent::TestAlertAcknowledged(_) => "test:alert:acknowledged",
            ServerEvent::Pong => "pong",
        }
    }

    pub fn class(&self) -> EventClass {
        match self {
            ServerEvent::MessageReceived(_)
            | ServerEvent::MessageEdited(_)
            | ServerEvent::MessageDeleted(_)
            | ServerEvent::ReactionAdded(_)
            | ServerEvent::ReactionRemoved(_)
            | ServerEvent::ConversationCreated(_)
            | ServerEvent::ConversationUpdated(_) => EventClass::Conversation,
            ServerEvent::TypingIndicator(_)
            | ServerEvent::PresenceUpdate(_)
            | ServerEvent::PresenceBatch(_) => EventClass::Presence,
            ServerEvent::Notification(_)
            | ServerEvent::TestAlert(_)
            | ServerEvent::TestAlertAcknowledged(_) => EventClass::Alert,
            ServerEvent::Pong => EventClass::Heartbeat,
        }
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            ServerEvent::MessageReceived(p) => serde_json::to_value(p),
            ServerEvent::MessageEdited(p) => serde_json::to_value(p),
            ServerEvent::MessageDeleted(p) => serde_json::to_value(p),
            ServerEvent::ReactionAdded(p) | ServerEvent::ReactionRemoved(p) => {
                serde_json::to_value(p)
            }
            ServerEvent::TypingIndicator(p) => serde_json::to_value(p),
            ServerEvent::PresenceUpdate(p) => serde_json::to_value(p),
            ServerEvent::PresenceBatch(p) => serde_json::to_value(&p.users),
            ServerEvent::ConversationCreated(p) | ServerEvent::ConversationUpdated(p) => {
                serde_json::to_value(p)
            }
            ServerEvent::Notification(p) => serde_json::to_value(p),
            ServerEvent::TestAlert(p) => serde_json::to_value(p),
            ServerEvent::TestAlertAcknowledged(p) => serde_json::to_value(p),
            ServerEvent::Pong => Ok(Value::Null),
        }
    }

    /// Serialize to a text frame (used by loopback servers and tests).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = self
            .payload()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        encode_frame(self.name(), data)
    }

    /// Parse a text frame pushed by the server.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame = parse_frame(text)?;
        let event = match frame.event.as_str() {
            "message:received" => ServerEvent::MessageReceived(data(frame.data)?),
            "message:edited" => ServerEvent::MessageEdited(data(frame.data)?),
            "message:deleted" => ServerEvent::MessageDeleted(data(frame.data)?),
            "message:reaction:added" => ServerEvent::ReactionAdded(data(frame.data)?),
            "message:reaction:removed" => ServerEvent::ReactionRemoved(data(frame.data)?),
            "typing:indicator" => ServerEvent::TypingIndicator(data(frame.data)?),
            "presence:update" => ServerEvent::PresenceUpdate(data(frame.data)?),
            "presence:batch" => ServerEvent::PresenceBatch(data(frame.data)?),
            "conversation:created" => ServerEvent::ConversationCreated(data(frame.data)?),
            "conversation:updated" => ServerEvent::ConversationUpdated(data(frame.data)?),
            "notification" => ServerEvent::Notification(data(frame.data)?),
            "test:alert" => ServerEvent::TestAlert(data(frame.data)?),
            "test:alert:acknowledged" => ServerEvent::TestAlertAcknowledged(data(frame.data)?),
            "pong" => ServerEvent::Pong,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    data: Value,
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn encode_frame(event: &str, data: Value) -> Result<String, ProtocolError> {
    serde_json::to_string(&OutboundFrame { event, data })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

fn data<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}
