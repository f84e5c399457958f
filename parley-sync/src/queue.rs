//! Offline queue for outbound operations requested while disconnected.
//!
//! The queue is the single source of truth for unsent work: an operation is
//! removed only once it has been handed to the channel (or deliberately
//! discarded and reported), so a drop in the middle of a flush leaves the
//! remainder in place for the next connect and nothing is replayed twice.

use std::collections::VecDeque;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ReplayError, SyncError};
use crate::protocol::ClientEvent;

/// Category of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Message,
    Typing,
    Presence,
    Reaction,
    /// Alert sends/acknowledgements and notification read receipts.
    Alert,
}

impl OperationKind {
    /// Kind of a queueable event. Room membership and probes are not
    /// queued: membership is re-established on connect and probes are
    /// meaningless offline.
    pub fn of(event: &ClientEvent) -> Option<Self> {
        match event {
            ClientEvent::SendMessage(_)
            | ClientEvent::EditMessage(_)
            | ClientEvent::DeleteMessage(_) => Some(OperationKind::Message),
            ClientEvent::TypingStart(_) | ClientEvent::TypingStop(_) => Some(OperationKind::Typing),
            ClientEvent::PresenceUpdate(_) => Some(OperationKind::Presence),
            ClientEvent::React(_) | ClientEvent::Unreact(_) => Some(OperationKind::Reaction),
            ClientEvent::SendTestAlert(_)
            | ClientEvent::AcknowledgeTestAlert(_)
            | ClientEvent::MarkNotificationRead(_) => Some(OperationKind::Alert),
            ClientEvent::JoinConversation(_)
            | ClientEvent::LeaveConversation(_)
            | ClientEvent::Ping => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub event: ClientEvent,
    pub enqueued_at: Instant,
}

/// Result of replaying one operation.
#[derive(Debug)]
pub enum Replay {
    /// Handed to the channel; remove it.
    Sent,
    /// Cannot ever succeed; remove it and report.
    Discard(ReplayError),
    /// Channel went away; stop and keep this and everything after it.
    Interrupted,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub discarded: Vec<(QueuedOperation, ReplayError)>,
    pub interrupted: bool,
}

pub struct OfflineQueue {
    queue: VecDeque<QueuedOperation>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Append an operation. Fails when the event is not queueable or the
    /// queue is full; the caller surfaces the error, nothing is dropped
    /// silently.
    pub fn enqueue(&mut self, event: ClientEvent, now: Instant) -> Result<Uuid, SyncError> {
        let kind = OperationKind::of(&event).ok_or(SyncError::NotQueueable(event.name()))?;
        if self.queue.len() >= self.max_size {
            return Err(SyncError::QueueFull {
                kind,
                capacity: self.max_size,
            });
        }
        let id = Uuid::new_v4();
        self.queue.push_back(QueuedOperation {
            id,
            kind,
            event,
            enqueued_at: now,
        });
        Ok(id)
    }

    /// Replay operations front to back until the queue is empty or `replay`
    /// reports an interruption.
    pub fn flush<F>(&mut self, mut replay: F) -> FlushReport
    where
        F: FnMut(&QueuedOperation) -> Replay,
    {
        let mut report = FlushReport::default();
        while let Some(op) = self.queue.front() {
            match replay(op) {
                Replay::Sent => {
                    self.queue.pop_front();
                    report.sent += 1;
                }
                Replay::Discard(reason) => {
                    if let Some(op) = self.queue.pop_front() {
                        report.discarded.push((op, reason));
                    }
                }
                Replay::Interrupted => {
                    report.interrupted = true;
                    break;
                }
            }
        }
        report
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Clear all queued operations (logout).
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.queue.iter()
    }
}
