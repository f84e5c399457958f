//! Conversation/message reconciliation.
//!
//! Inbound change events are first turned into a [`StoreDelta`] by the pure
//! [`Reconciler::plan`], then committed to the [`ConversationStore`] by the
//! engine, which is the only writer. Planning returns `None` for anything
//! that would not change state (duplicate delivery, unknown targets), which
//! is how replays and out-of-order duplicates are absorbed.
//!
//! Invariants kept by the store:
//! - no two messages of a conversation share an id;
//! - a deleted id is never re-inserted;
//! - the conversation list is sorted by effective timestamp, newest first.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::error::ReplayError;
use crate::model::{Conversation, Message, NotificationPrefs, Reaction};
use crate::protocol::{ClientEvent, ConversationChange, ServerEvent};

/// A state change ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreDelta {
    AppendMessage {
        message: Message,
        bump_unread: bool,
    },
    EditMessage {
        conversation_id: String,
        message_id: String,
        content: String,
        edited_at: DateTime<Utc>,
    },
    RemoveMessage {
        conversation_id: String,
        message_id: String,
    },
    AddReaction {
        conversation_id: String,
        message_id: String,
        reaction: Reaction,
    },
    RemoveReaction {
        conversation_id: String,
        message_id: String,
        reaction: Reaction,
    },
    UpsertConversation(Conversation),
}

/// Side effect requested for a new message: sound and/or banner.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingNotice {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub preview: String,
    pub sound: bool,
    pub banner: bool,
}

/// A planned delta plus whatever the host should be told about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub delta: StoreDelta,
    pub notice: Option<IncomingNotice>,
    /// The message belongs to a conversation the store has never seen.
    pub unknown_conversation: bool,
}

impl Reconciliation {
    fn plain(delta: StoreDelta) -> Self {
        Self {
            delta,
            notice: None,
            unknown_conversation: false,
        }
    }
}

/// Context the reconciler needs beyond the store itself.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub local_user_id: &'a str,
    /// Conversation currently open in the UI.
    pub active_conversation: Option<&'a str>,
    pub prefs: &'a NotificationPrefs,
    pub now: DateTime<Utc>,
}

const PREVIEW_CHARS: usize = 80;

pub struct Reconciler;

impl Reconciler {
    /// Plan the effect of a conversation-class event.
    pub fn plan(
        store: &ConversationStore,
        event: &ServerEvent,
        ctx: &ReconcileContext<'_>,
    ) -> Option<Reconciliation> {
        match event {
            ServerEvent::MessageReceived(message) => Self::plan_message(store, message, ctx),
            ServerEvent::MessageEdited(edit) => {
                let current = store.message(&edit.conversation_id, &edit.message_id)?;
                if current.content == edit.content && current.edited_at.is_some() {
                    return None;
                }
                Some(Reconciliation::plain(StoreDelta::EditMessage {
                    conversation_id: edit.conversation_id.clone(),
                    message_id: edit.message_id.clone(),
                    content: edit.content.clone(),
                    edited_at: edit.edited_at.unwrap_or(ctx.now),
                }))
            }
            ServerEvent::MessageDeleted(del) => {
                store.message(&del.conversation_id, &del.message_id)?;
                Some(Reconciliation::plain(StoreDelta::RemoveMessage {
                    conversation_id: del.conversation_id.clone(),
                    message_id: del.message_id.clone(),
                }))
            }
            ServerEvent::ReactionAdded(change) => {
                let message = store.message(&change.conversation_id, &change.message_id)?;
                if message.has_reaction(&change.emoji, &change.user_id) {
                    return None;
                }
                Some(Reconciliation::plain(StoreDelta::AddReaction {
                    conversation_id: change.conversation_id.clone(),
                    message_id: change.message_id.clone(),
                    reaction: Reaction {
                        emoji: change.emoji.clone(),
                        user_id: change.user_id.clone(),
                    },
                }))
            }
            ServerEvent::ReactionRemoved(change) => {
                let message = store.message(&change.conversation_id, &change.message_id)?;
                if !message.has_reaction(&change.emoji, &change.user_id) {
                    return None;
                }
                Some(Reconciliation::plain(StoreDelta::RemoveReaction {
                    conversation_id: change.conversation_id.clone(),
                    message_id: change.message_id.clone(),
                    reaction: Reaction {
                        emoji: change.emoji.clone(),
                        user_id: change.user_id.clone(),
                    },
                }))
            }
            ServerEvent::ConversationCreated(change) | ServerEvent::ConversationUpdated(change) => {
                let existing = store.conversation(&change.id);
                let merged = merge_conversation(existing, change);
                if existing == Some(&merged) {
                    return None;
                }
                Some(Reconciliation::plain(StoreDelta::UpsertConversation(merged)))
            }
            _ => None,
        }
    }

    fn plan_message(
        store: &ConversationStore,
        message: &Message,
        ctx: &ReconcileContext<'_>,
    ) -> Option<Reconciliation> {
        if store.contains_message(&message.conversation_id, &message.id)
            || store.is_deleted(&message.id)
        {
            return None;
        }

        let from_other = message.sender_id != ctx.local_user_id;
        let in_background = ctx.active_conversation != Some(message.conversation_id.as_str());
        let bump_unread = from_other && in_background;

        let notice = (bump_unread && ctx.prefs.allows(&message.conversation_id)).then(|| {
            IncomingNotice {
                conversation_id: message.conversation_id.clone(),
                message_id: message.id.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: message.sender_name.clone(),
                preview: message.content.chars().take(PREVIEW_CHARS).collect(),
                sound: ctx.prefs.sound,
                banner: ctx.prefs.banner,
            }
        });

        Some(Reconciliation {
            delta: StoreDelta::AppendMessage {
                message: message.clone(),
                bump_unread,
            },
            notice,
            unknown_conversation: store.conversation(&message.conversation_id).is_none(),
        })
    }
}

/// Fold a server-side conversation change into the stored record. The
/// local unread count and a newer local last message survive unless the
/// server sends its own.
fn merge_conversation(existing: Option<&Conversation>, change: &ConversationChange) -> Conversation {
    let Some(existing) = existing else {
        return Conversation {
            id: change.id.clone(),
            kind: change.kind,
            name: change.name.clone(),
            participants: change.participants.clone().unwrap_or_default(),
            last_message: change.last_message.clone(),
            unread_count: change.unread_count.unwrap_or(0),
            updated_at: change.updated_at,
        };
    };

    let last_message = match (&existing.last_message, &change.last_message) {
        (Some(local), Some(remote)) if local.created_at > remote.created_at => Some(local.clone()),
        (local, None) => local.clone(),
        (_, remote) => remote.clone(),
    };
    Conversation {
        id: change.id.clone(),
        kind: change.kind,
        name: change.name.clone().or_else(|| existing.name.clone()),
        participants: change
            .participants
            .clone()
            .unwrap_or_else(|| existing.participants.clone()),
        last_message,
        unread_count: change.unread_count.unwrap_or(existing.unread_count),
        updated_at: change.updated_at.max(existing.updated_at),
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Canonical conversation and message state on the client.
#[derive(Debug, Default)]
pub struct ConversationStore {
    /// Sorted newest first by effective timestamp.
    conversations: Vec<Conversation>,
    /// Per-conversation message sequences in arrival order.
    messages: HashMap<String, Vec<Message>>,
    /// Ids of deleted messages.
    tombstones: HashSet<String>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a planned delta.
    pub fn commit(&mut self, delta: StoreDelta) {
        match delta {
            StoreDelta::AppendMessage { message, bump_unread } => {
                self.append_message(message, bump_unread)
            }
            StoreDelta::EditMessage {
                conversation_id,
                message_id,
                content,
                edited_at,
            } => {
                if let Some(msg) = self.message_mut(&conversation_id, &message_id) {
                    msg.content = content;
                    msg.edited_at = Some(edited_at);
                }
                self.refresh_last_message(&conversation_id);
            }
            StoreDelta::RemoveMessage {
                conversation_id,
                message_id,
            } => {
                if let Some(seq) = self.messages.get_mut(&conversation_id) {
                    seq.retain(|m| m.id != message_id);
                }
                self.tombstones.insert(message_id);
                self.refresh_last_message(&conversation_id);
            }
            StoreDelta::AddReaction {
                conversation_id,
                message_id,
                reaction,
            } => {
                if let Some(msg) = self.message_mut(&conversation_id, &message_id) {
                    if !msg.has_reaction(&reaction.emoji, &reaction.user_id) {
                        msg.reactions.push(reaction);
                    }
                }
            }
            StoreDelta::RemoveReaction {
                conversation_id,
                message_id,
                reaction,
            } => {
                if let Some(msg) = self.message_mut(&conversation_id, &message_id) {
                    msg.reactions
                        .retain(|r| !(r.emoji == reaction.emoji && r.user_id == reaction.user_id));
                }
            }
            StoreDelta::UpsertConversation(conv) => self.upsert_conversation(conv),
        }
    }

    fn append_message(&mut self, message: Message, bump_unread: bool) {
        let seq = self.messages.entry(message.conversation_id.clone()).or_default();
        if seq.iter().any(|m| m.id == message.id) {
            return;
        }
        seq.push(message.clone());

        if let Some(conv) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            let newer = conv
                .last_message
                .as_ref()
                .map_or(true, |last| message.created_at >= last.created_at);
            if newer {
                conv.last_message = Some(message.clone());
            }
            if message.created_at > conv.updated_at {
                conv.updated_at = message.created_at;
            }
            if bump_unread {
                conv.unread_count += 1;
            }
            self.sort();
        }
    }

    fn upsert_conversation(&mut self, incoming: Conversation) {
        match self.conversations.iter_mut().find(|c| c.id == incoming.id) {
            Some(existing) => *existing = incoming,
            None => self.conversations.push(incoming),
        }
        self.sort();
    }

    /// Keep `last_message` in step with the sequence after edits/deletes.
    fn refresh_last_message(&mut self, conversation_id: &str) {
        let latest = self
            .messages
            .get(conversation_id)
            .and_then(|seq| seq.iter().max_by_key(|m| m.created_at))
            .cloned();
        if let Some(conv) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            let tracked = conv.last_message.as_ref().map(|m| m.id.clone());
            match (&latest, tracked) {
                (Some(latest), _) => conv.last_message = Some(latest.clone()),
                (None, Some(id)) if self.tombstones.contains(&id) => conv.last_message = None,
                _ => {}
            }
            self.sort();
        }
    }

    fn sort(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.effective_timestamp()
                .cmp(&a.effective_timestamp())
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    fn message_mut(&mut self, conversation_id: &str, message_id: &str) -> Option<&mut Message> {
        self.messages
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| m.id == message_id)
    }

    /// Seed or replace a conversation's history (e.g. after an HTTP fetch).
    /// Duplicate and deleted ids are skipped.
    pub fn load_history(&mut self, conversation_id: &str, history: Vec<Message>) {
        let mut seen = HashSet::new();
        let seq: Vec<Message> = history
            .into_iter()
            .filter(|m| !self.tombstones.contains(&m.id) && seen.insert(m.id.clone()))
            .collect();
        self.messages.insert(conversation_id.to_string(), seq);
        self.refresh_last_message(conversation_id);
    }

    /// Opening a conversation marks it read. Returns whether anything changed.
    pub fn mark_read(&mut self, conversation_id: &str) -> bool {
        match self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            Some(conv) if conv.unread_count > 0 => {
                conv.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.messages
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(conversation_id).iter().find(|m| m.id == message_id)
    }

    pub fn contains_message(&self, conversation_id: &str, message_id: &str) -> bool {
        self.message(conversation_id, message_id).is_some()
    }

    pub fn is_deleted(&self, message_id: &str) -> bool {
        self.tombstones.contains(message_id)
    }

    /// Why a queued outbound event can no longer be replayed, if at all.
    pub fn replay_conflict(&self, event: &ClientEvent) -> Option<ReplayError> {
        let target = event.target_message()?;
        self.is_deleted(target)
            .then(|| ReplayError::TargetDeleted(target.to_string()))
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.tombstones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConversationKind;
    use crate::protocol::{MessageDeleted, MessageEdited, ReactionChange, ReactionRequest};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn conversation(id: &str, updated: i64) -> Conversation {
        Conversation {
            id: id.into(),
            kind: ConversationKind::Group,
            name: Some(id.to_uppercase()),
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
            updated_at: at(updated),
        }
    }

    fn message(id: &str, conv: &str, sender: &str, created: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: conv.into(),
            sender_id: sender.into(),
            sender_name: Some("Sender".into()),
            content: format!("body of {id}"),
            created_at: at(created),
            edited_at: None,
            reply_to_id: None,
            reactions: Vec::new(),
            attachments: Vec::new(),
        }
    }

    struct Harness {
        store: ConversationStore,
        prefs: NotificationPrefs,
        active: Option<String>,
    }

    impl Harness {
        fn new() -> Self {
            let mut store = ConversationStore::new();
            for (id, updated) in [("a", 10), ("b", 20), ("c", 30)] {
                store.commit(StoreDelta::UpsertConversation(conversation(id, updated)));
            }
            Self {
                store,
                prefs: NotificationPrefs::default(),
                active: None,
            }
        }

        fn apply(&mut self, event: ServerEvent) -> Option<Reconciliation> {
            let ctx = ReconcileContext {
                local_user_id: "me",
                active_conversation: self.active.as_deref(),
                prefs: &self.prefs,
                now: at(1_000),
            };
            let plan = Reconciler::plan(&self.store, &event, &ctx)?;
            self.store.commit(plan.delta.clone());
            Some(plan)
        }

        fn order(&self) -> Vec<String> {
            self.store.conversations().iter().map(|c| c.id.clone()).collect()
        }
    }

    #[test]
    fn test_initial_sort_newest_first() {
        let h = Harness::new();
        assert_eq!(h.order(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_duplicate_message_applied_once() {
        let mut h = Harness::new();
        let event = ServerEvent::MessageReceived(message("m1", "a", "u2", 40));
        assert!(h.apply(event.clone()).is_some());
        assert!(h.apply(event.clone()).is_none());
        // even if the planner is bypassed the store refuses the duplicate
        h.store.commit(StoreDelta::AppendMessage {
            message: message("m1", "a", "u2", 40),
            bump_unread: true,
        });
        assert_eq!(h.store.messages("a").len(), 1);
        assert_eq!(h.store.conversation("a").unwrap().unread_count, 1);
    }

    #[test]
    fn test_new_message_moves_conversation_up() {
        let mut h = Harness::new();
        h.apply(ServerEvent::MessageReceived(message("m1", "a", "u2", 40)));
        assert_eq!(h.order(), vec!["a", "c", "b"]);

        // an older message does not outrank a newer update
        h.apply(ServerEvent::MessageReceived(message("m2", "b", "u2", 25)));
        assert_eq!(h.order(), vec!["a", "c", "b"]);

        let convs = h.store.conversations();
        assert!(convs
            .windows(2)
            .all(|w| w[0].effective_timestamp() >= w[1].effective_timestamp()));
    }

    #[test]
    fn test_unread_and_notice_rules() {
        let mut h = Harness::new();
        h.active = Some("a".into());

        // open conversation: no unread, no notice
        let plan = h.apply(ServerEvent::MessageReceived(message("m1", "a", "u2", 40))).unwrap();
        assert!(plan.notice.is_none());
        assert_eq!(h.store.conversation("a").unwrap().unread_count, 0);

        // own message elsewhere: no unread
        let plan = h.apply(ServerEvent::MessageReceived(message("m2", "b", "me", 41))).unwrap();
        assert!(plan.notice.is_none());
        assert_eq!(h.store.conversation("b").unwrap().unread_count, 0);

        // someone else's message elsewhere: +1 and a notice
        let plan = h.apply(ServerEvent::MessageReceived(message("m3", "b", "u2", 42))).unwrap();
        let notice = plan.notice.unwrap();
        assert_eq!(notice.conversation_id, "b");
        assert!(notice.sound && notice.banner);
        assert_eq!(h.store.conversation("b").unwrap().unread_count, 1);
    }

    #[test]
    fn test_muted_conversation_counts_but_is_silent() {
        let mut h = Harness::new();
        h.prefs.muted_conversations.insert("c".into());
        let plan = h.apply(ServerEvent::MessageReceived(message("m1", "c", "u2", 40))).unwrap();
        assert!(plan.notice.is_none());
        assert_eq!(h.store.conversation("c").unwrap().unread_count, 1);
        assert!(h.store.mark_read("c"));
        assert!(!h.store.mark_read("c"));
    }

    #[test]
    fn test_unknown_conversation_flagged() {
        let mut h = Harness::new();
        let plan = h.apply(ServerEvent::MessageReceived(message("m1", "zz", "u2", 40))).unwrap();
        assert!(plan.unknown_conversation);
        assert_eq!(h.store.messages("zz").len(), 1);
    }

    #[test]
    fn test_edit_in_place() {
        let mut h = Harness::new();
        h.apply(ServerEvent::MessageReceived(message("m1", "a", "u2", 40)));
        h.apply(ServerEvent::MessageReceived(message("m2", "a", "u2", 41)));
        let edit = ServerEvent::MessageEdited(MessageEdited {
            message_id: "m1".into(),
            conversation_id: "a".into(),
            content: "fixed".into(),
            edited_at: Some(at(50)),
        });
        assert!(h.apply(edit.clone()).is_some());
        assert!(h.apply(edit).is_none());

        let seq = h.store.messages("a");
        assert_eq!(seq[0].content, "fixed");
        assert_eq!(seq[0].edited_at, Some(at(50)));
        assert_eq!(seq[1].id, "m2");
    }

    #[test]
    fn test_edit_unknown_message_ignored() {
        let mut h = Harness::new();
        let edit = ServerEvent::MessageEdited(MessageEdited {
            message_id: "nope".into(),
            conversation_id: "a".into(),
            content: "x".into(),
            edited_at: None,
        });
        assert!(h.apply(edit).is_none());
    }

    #[test]
    fn test_delete_updates_last_message_and_blocks_replay() {
        let mut h = Harness::new();
        h.apply(ServerEvent::MessageReceived(message("m1", "a", "u2", 40)));
        h.apply(ServerEvent::MessageReceived(message("m2", "a", "u2", 41)));
        let delete = ServerEvent::MessageDeleted(MessageDeleted {
            message_id: "m2".into(),
            conversation_id: "a".into(),
        });
        assert!(h.apply(delete.clone()).is_some());
        assert!(h.apply(delete).is_none());

        assert_eq!(h.store.messages("a").len(), 1);
        assert_eq!(
            h.store.conversation("a").unwrap().last_message.as_ref().unwrap().id,
            "m1"
        );
        // late redelivery of a deleted message stays deleted
        assert!(h.apply(ServerEvent::MessageReceived(message("m2", "a", "u2", 41))).is_none());

        let react = ClientEvent::React(ReactionRequest { message_id: "m2".into(), emoji: "👍".into() });
        assert_eq!(
            h.store.replay_conflict(&react),
            Some(ReplayError::TargetDeleted("m2".into()))
        );
    }

    #[test]
    fn test_reactions_idempotent() {
        let mut h = Harness::new();
        h.apply(ServerEvent::MessageReceived(message("m1", "a", "u2", 40)));
        let change = ReactionChange {
            message_id: "m1".into(),
            conversation_id: "a".into(),
            emoji: "🔥".into(),
            user_id: "u3".into(),
        };
        assert!(h.apply(ServerEvent::ReactionAdded(change.clone())).is_some());
        assert!(h.apply(ServerEvent::ReactionAdded(change.clone())).is_none());
        assert_eq!(h.store.message("a", "m1").unwrap().reactions.len(), 1);

        assert!(h.apply(ServerEvent::ReactionRemoved(change.clone())).is_some());
        assert!(h.apply(ServerEvent::ReactionRemoved(change)).is_none());
        assert!(h.store.message("a", "m1").unwrap().reactions.is_empty());
    }

    #[test]
    fn test_conversation_update_resorts() {
        let mut h = Harness::new();
        let mut updated = conversation("a", 100);
        updated.unread_count = 4;
        let change = ConversationChange::from(updated);
        assert!(h.apply(ServerEvent::ConversationUpdated(change.clone())).is_some());
        assert_eq!(h.order(), vec!["a", "c", "b"]);
        assert_eq!(h.store.conversation("a").unwrap().unread_count, 4);
        // identical payload is a no-op
        assert!(h.apply(ServerEvent::ConversationUpdated(change)).is_none());

        h.apply(ServerEvent::ConversationCreated(conversation("d", 5).into()));
        assert_eq!(h.order(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_partial_update_keeps_local_counters() {
        let mut h = Harness::new();
        h.apply(ServerEvent::MessageReceived(message("m1", "b", "u2", 500)));
        assert_eq!(h.order(), vec!["b", "c", "a"]);

        let rename: ConversationChange = serde_json::from_value(serde_json::json!({
            "id": "b",
            "type": "group",
            "name": "renamed",
            "updatedAt": at(40),
        }))
        .unwrap();
        assert!(h.apply(ServerEvent::ConversationUpdated(rename)).is_some());

        let conv = h.store.conversation("b").unwrap();
        assert_eq!(conv.name.as_deref(), Some("renamed"));
        assert_eq!(conv.unread_count, 1);
        assert_eq!(conv.last_message.as_ref().map(|m| m.id.as_str()), Some("m1"));
        assert_eq!(h.order(), vec!["b", "c", "a"]);

        // An older server-side last message does not replace the local one
        let mut stale = conversation("b", 40);
        stale.last_message = Some(message("m0", "b", "u2", 1));
        stale.unread_count = 0;
        h.apply(ServerEvent::ConversationUpdated(stale.into()));
        let conv = h.store.conversation("b").unwrap();
        assert_eq!(conv.last_message.as_ref().map(|m| m.id.as_str()), Some("m1"));
        assert_eq!(conv.unread_count, 0);
    }

    #[test]
    fn test_load_history_dedups() {
        let mut store = ConversationStore::new();
        store.commit(StoreDelta::UpsertConversation(conversation("a", 0)));
        store.load_history(
            "a",
            vec![
                message("m1", "a", "u", 1),
                message("m1", "a", "u", 1),
                message("m2", "a", "u", 2),
            ],
        );
        assert_eq!(store.messages("a").len(), 2);
        assert_eq!(store.conversation("a").unwrap().last_message.as_ref().unwrap().id, "m2");
    }
}
