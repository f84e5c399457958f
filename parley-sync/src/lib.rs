//! # parley-sync — Real-time sync engine for the Parley chat client
//!
//! Keeps one persistent WebSocket channel to the Parley server alive and
//! reconciles everything pushed over it into local state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Command (mpsc)   ┌──────────────┐  JSON text   ┌────────┐
//! │ EngineHandle │ ────────────────► │  SyncEngine  │ ◄──────────► │ Server │
//! │ (host app)   │ ◄──────────────── │  (actor)     │   Channel    └────────┘
//! └──────────────┘  SyncEvent        └──────┬───────┘
//!                                           │ plan / commit
//!              ┌──────────────┬─────────────┼──────────────┬─────────────┐
//!              ▼              ▼             ▼              ▼             ▼
//!       ConnectionMachine  Reconnect   OfflineQueue  Conversation    Presence
//!       + Heartbeat        Scheduler   (FIFO)        Store           Aggregator
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire contract: closed inbound/outbound event enums
//! - [`model`] — Conversations, messages, presence, notifications
//! - [`connection`] — Connection state machine
//! - [`reconnect`] — Exponential backoff with jitter and a rate window
//! - [`heartbeat`] — Ping/pong liveness and stale detection
//! - [`queue`] — Offline operation queue, replayed on connect
//! - [`presence`] — Presence and typing indicators
//! - [`reconciler`] — Message/conversation reconciliation and store
//! - [`alerts`] — Test alerts, first acknowledgement wins
//! - [`transport`] — Channel abstraction and the WebSocket transport
//! - [`engine`] — The actor tying it all together
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | Reconnect delay | 1 s doubling to 30 s, +≤30 % jitter |
//! | Reconnect rate | ≤10 attempts per 60 s |
//! | Heartbeat | ping every 25 s, stale after 60 s |
//! | Typing indicator | expires after 5 s |
//! | Presence freshness | 5 min |
//! | Offline queue | 10 000 operations |

pub mod alerts;
pub mod auth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod reconciler;
pub mod reconnect;
pub mod transport;

// Re-exports for convenience
pub use alerts::AlertBoard;
pub use auth::{CredentialSource, NoRefresh, RefreshWith};
pub use config::{resolve_endpoint, EngineConfig, ENDPOINT_ENV, FALLBACK_ENDPOINT};
pub use connection::{CloseCause, ConnectionMachine, ConnectionState, Recovery};
pub use engine::{Delivery, EngineHandle, EngineStatus, SyncEngine, SyncEvent};
pub use error::{AuthError, OpenError, ReplayError, SyncError};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use model::{
    Attachment, Conversation, ConversationKind, Message, Notification, NotificationPrefs,
    Participant, PresenceStatus, Reaction, TestAlert,
};
pub use presence::{PresenceAggregator, PresenceDelta, PresenceRecord, TypingRecord};
pub use protocol::{ClientEvent, ConversationChange, EventClass, ProtocolError, ServerEvent};
pub use queue::{FlushReport, OfflineQueue, OperationKind, QueuedOperation, Replay};
pub use reconciler::{
    ConversationStore, IncomingNotice, ReconcileContext, Reconciler, Reconciliation, StoreDelta,
};
pub use reconnect::{RateWindow, ReconnectPlan, ReconnectPolicy, ReconnectScheduler};
pub use transport::{Channel, ChannelClosed, ChannelFrame, ChannelPeer, Transport, WsTransport};
