//! Presence and typing aggregation.
//!
//! Turns inbound `presence:*` and `typing:indicator` events into per-user
//! soft state. Nothing here is persisted; after a reconnect the server's
//! snapshot plus incremental events rebuild it.
//!
//! ## Data flow
//!
//! ```text
//! ServerEvent (presence class)
//!       │
//!       ▼
//! PresenceAggregator::plan()     (pure, reads current state)
//!       │
//!       ▼  PresenceDelta
//! PresenceAggregator::commit()   (engine actor, single writer)
//!       │
//!       ▼
//! is_active() / typing_in()      (derived on every call)
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::model::PresenceStatus;
use crate::protocol::{PresenceChange, ServerEvent};

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// Last known presence of one user.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub status_message: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    fn from_change(change: &PresenceChange, wall_now: DateTime<Utc>) -> Self {
        Self {
            status: change.status,
            status_message: change.status_message.clone(),
            last_seen: change.last_seen.unwrap_or(wall_now),
        }
    }
}

/// One user typing in one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingRecord {
    pub conversation_id: String,
    pub user_id: String,
    pub display_name: String,
    pub started_at: Instant,
    pub expires_at: Instant,
}

impl TypingRecord {
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// State change computed from an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDelta {
    /// Overwrite these users' records as one unit.
    Upsert(Vec<(String, PresenceRecord)>),
    TypingStarted(TypingRecord),
    TypingStopped {
        conversation_id: String,
        user_id: String,
    },
}

// ───────────────────────────────────────────────────────────────────
// Aggregator
// ───────────────────────────────────────────────────────────────────

pub struct PresenceAggregator {
    /// Our own user id; our typing echoes are ignored.
    local_user_id: String,
    presence: HashMap<String, PresenceRecord>,
    /// Keyed by (conversation_id, user_id).
    typing: HashMap<(String, String), TypingRecord>,
    typing_ttl: Duration,
    freshness: Duration,
}

impl PresenceAggregator {
    pub fn new(local_user_id: impl Into<String>, typing_ttl: Duration, freshness: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            presence: HashMap::new(),
            typing: HashMap::new(),
            typing_ttl,
            freshness,
        }
    }

    /// Compute the delta for a presence-class event. `None` when the event
    /// changes nothing.
    pub fn plan(&self, event: &ServerEvent, now: Instant, wall_now: DateTime<Utc>) -> Option<PresenceDelta> {
        match event {
            ServerEvent::PresenceUpdate(change) => Some(PresenceDelta::Upsert(vec![(
                change.user_id.clone(),
                PresenceRecord::from_change(change, wall_now),
            )])),
            ServerEvent::PresenceBatch(batch) if !batch.users.is_empty() => {
                Some(PresenceDelta::Upsert(
                    batch
                        .users
                        .iter()
                        .map(|c| (c.user_id.clone(), PresenceRecord::from_change(c, wall_now)))
                        .collect(),
                ))
            }
            ServerEvent::TypingIndicator(ind) if ind.user_id != self.local_user_id => {
                if ind.is_typing {
                    Some(PresenceDelta::TypingStarted(TypingRecord {
                        conversation_id: ind.conversation_id.clone(),
                        user_id: ind.user_id.clone(),
                        display_name: ind.display_name.clone(),
                        started_at: now,
                        expires_at: now + self.typing_ttl,
                    }))
                } else if self
                    .typing
                    .contains_key(&(ind.conversation_id.clone(), ind.user_id.clone()))
                {
                    Some(PresenceDelta::TypingStopped {
                        conversation_id: ind.conversation_id.clone(),
                        user_id: ind.user_id.clone(),
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Apply a delta computed by [`plan`](Self::plan).
    pub fn commit(&mut self, delta: PresenceDelta) {
        match delta {
            PresenceDelta::Upsert(records) => {
                for (user_id, record) in records {
                    self.presence.insert(user_id, record);
                }
            }
            PresenceDelta::TypingStarted(record) => {
                self.typing
                    .insert((record.conversation_id.clone(), record.user_id.clone()), record);
            }
            PresenceDelta::TypingStopped { conversation_id, user_id } => {
                self.typing.remove(&(conversation_id, user_id));
            }
        }
    }

    /// Last-writer-wins update of one user.
    pub fn upsert(
        &mut self,
        user_id: impl Into<String>,
        status: PresenceStatus,
        status_message: Option<String>,
        last_seen: Option<DateTime<Utc>>,
        wall_now: DateTime<Utc>,
    ) {
        self.presence.insert(
            user_id.into(),
            PresenceRecord {
                status,
                status_message,
                last_seen: last_seen.unwrap_or(wall_now),
            },
        );
    }

    pub fn presence(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.presence.get(user_id)
    }

    /// Online and seen within the freshness window. Derived on every call.
    pub fn is_active(&self, user_id: &str, wall_now: DateTime<Utc>) -> bool {
        let Some(record) = self.presence.get(user_id) else {
            return false;
        };
        if record.status != PresenceStatus::Online {
            return false;
        }
        match (wall_now - record.last_seen).to_std() {
            Ok(age) => age < self.freshness,
            // last_seen ahead of our clock
            Err(_) => true,
        }
    }

    /// Insert or refresh a typing indicator; replaces any pending expiry.
    pub fn set_typing(
        &mut self,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        now: Instant,
    ) {
        let record = TypingRecord {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            started_at: now,
            expires_at: now + self.typing_ttl,
        };
        self.commit(PresenceDelta::TypingStarted(record));
    }

    /// Remove a typing indicator. Returns whether one existed.
    pub fn stop_typing(&mut self, conversation_id: &str, user_id: &str) -> bool {
        self.typing
            .remove(&(conversation_id.to_string(), user_id.to_string()))
            .is_some()
    }

    /// Live typing indicators of a conversation, oldest first.
    pub fn typing_in(&self, conversation_id: &str, now: Instant) -> Vec<TypingRecord> {
        let mut records: Vec<TypingRecord> = self
            .typing
            .values()
            .filter(|r| r.conversation_id == conversation_id && r.is_live(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.user_id.cmp(&b.user_id)));
        records
    }

    /// When the earliest typing indicator expires.
    pub fn next_typing_expiry(&self) -> Option<Instant> {
        self.typing.values().map(|r| r.expires_at).min()
    }

    /// Drop expired indicators. Returns the affected conversations.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<String> {
        let mut changed: Vec<String> = self
            .typing
            .values()
            .filter(|r| !r.is_live(now))
            .map(|r| r.conversation_id.clone())
            .collect();
        self.typing.retain(|_, r| r.is_live(now));
        changed.sort();
        changed.dedup();
        changed
    }

    /// Conversations with at least one typing record, live or not.
    pub fn typing_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.typing.keys().map(|(c, _)| c.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Drop all typing state (disconnect).
    pub fn clear_typing(&mut self) {
        self.typing.clear();
    }

    /// Drop everything (logout).
    pub fn clear(&mut self) {
        self.presence.clear();
        self.typing.clear();
    }

    pub fn tracked_users(&self) -> usize {
        self.presence.len()
    }
}
