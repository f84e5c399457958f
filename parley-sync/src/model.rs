//! Domain records shared by the wire protocol and the local stores.
//!
//! Field names follow the server's JSON (camelCase). Identifiers are opaque
//! strings issued by the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Reported availability of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[serde(alias = "ONLINE")]
    Online,
    #[serde(alias = "AWAY")]
    Away,
    #[serde(alias = "BUSY")]
    Busy,
    #[serde(alias = "OFFLINE")]
    Offline,
}

/// Direct (two-party) or group conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    #[serde(alias = "DIRECT")]
    Direct,
    #[serde(alias = "GROUP")]
    Group,
}

/// A single emoji reaction left by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
}

/// Attachment metadata. The file itself lives in external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    pub url: String,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Whether `user_id` already reacted with `emoji`.
    pub fn has_reaction(&self, emoji: &str, user_id: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.emoji == emoji && r.user_id == user_id)
    }
}

/// Conversation member as carried in conversation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A conversation summary as shown in the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Sort key of the conversation list: the later of the last message and
    /// the conversation's own update time.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        match &self.last_message {
            Some(msg) if msg.created_at > self.updated_at => msg.created_at,
            _ => self.updated_at,
        }
    }
}

/// A server-pushed notification (mention, invite, meeting reminder...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Broadcast test alert, cleared everywhere once any session acknowledges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAlert {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Local preferences deciding whether an incoming message produces a
/// sound/banner notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPrefs {
    pub sound: bool,
    pub banner: bool,
    pub muted_conversations: HashSet<String>,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            sound: true,
            banner: true,
            muted_conversations: HashSet::new(),
        }
    }
}

impl NotificationPrefs {
    /// Whether any notice should be produced for this conversation.
    pub fn allows(&self, conversation_id: &str) -> bool {
        (self.sound || self.banner) && !self.muted_conversations.contains(conversation_id)
    }
}
