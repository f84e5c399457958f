//! The sync engine actor.
//!
//! A single tokio task owns the connection, the offline queue, the stores
//! and every timer. Host calls arrive as commands through [`EngineHandle`];
//! channel frames, timer deadlines and the in-flight dial or credential
//! refresh are multiplexed in the same `select!` loop, so no two of them
//! ever run concurrently and no handler waits on I/O.
//!
//! ```text
//!   EngineHandle ──Command──┐
//!                           ▼
//!   Channel ──frame──► ┌──────────┐ ──SyncEvent──► host
//!   dial / refresh ──► │SyncEngine│
//!   deadlines ───────► └────┬─────┘
//!    reconnect              │ plan / commit
//!    heartbeat              │
//!    typing expiry          ▼
//!              ConversationStore · PresenceAggregator · AlertBoard
//! ```

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::alerts::AlertBoard;
use crate::auth::CredentialSource;
use crate::config::EngineConfig;
use crate::connection::{CloseCause, ConnectionMachine, ConnectionState, Recovery};
use crate::error::{AuthError, OpenError, ReplayError, SyncError};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::model::{Conversation, Message, Notification, NotificationPrefs, PresenceStatus, TestAlert};
use crate::presence::{PresenceAggregator, PresenceDelta, PresenceRecord, TypingRecord};
use crate::protocol::{
    ClientEvent, ConversationRef, EditMessage, EventClass, IdRef, MessageRef,
    PresenceUpdateRequest, ProtocolError, ReactionRequest, SendMessage, ServerEvent,
    TestAlertRequest,
};
use crate::queue::{OfflineQueue, QueuedOperation, Replay};
use crate::reconciler::{
    ConversationStore, IncomingNotice, ReconcileContext, Reconciler, Reconciliation, StoreDelta,
};
use crate::reconnect::{ReconnectPlan, ReconnectScheduler};
use crate::transport::{Channel, ChannelFrame, Transport};

/// Events emitted to the host application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Channel open, queue flushed.
    Connected,
    /// Channel lost or closed.
    Disconnected { reason: String },
    /// Next attempt planned.
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
        throttled: bool,
    },
    /// Credential rejected and could not be refreshed. No further attempts
    /// until `set_credential`.
    AuthenticationFailed { reason: String },
    /// A queued operation was dropped during replay.
    ReplayFailed {
        operation: QueuedOperation,
        reason: ReplayError,
    },
    QueueFlushed { sent: usize },
    MessageReceived(Message),
    /// Edit, delete or reaction change of a stored message.
    MessageChanged {
        conversation_id: String,
        message_id: String,
    },
    ConversationsChanged,
    /// A message arrived for a conversation the store does not know.
    UnknownConversation(String),
    /// Sound/banner notice for a background message.
    IncomingMessage(IncomingNotice),
    PresenceChanged(Vec<String>),
    TypingChanged { conversation_id: String },
    Notification(Notification),
    TestAlert(TestAlert),
    TestAlertCleared { id: String },
}

/// What happened to an outbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the open channel.
    Sent,
    /// Held in the offline queue until the next connect.
    Queued(Uuid),
}

/// Snapshot of the engine's connection bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: ConnectionState,
    pub attempt_count: u32,
    pub attempts_in_window: usize,
    pub queued: usize,
    pub auth_blocked: bool,
    pub reconnect_pending: bool,
    pub heartbeat_running: bool,
    pub active_conversation: Option<String>,
}

enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Wake,
    SetCredential(String),
    Send {
        event: ClientEvent,
        reply: oneshot::Sender<Result<Delivery, SyncError>>,
    },
    OpenConversation(Option<String>),
    SetPrefs(NotificationPrefs),
    LoadConversations(Vec<Conversation>),
    LoadHistory {
        conversation_id: String,
        messages: Vec<Message>,
    },
    Query(Query),
    Logout(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Query {
    Status(oneshot::Sender<EngineStatus>),
    Conversations(oneshot::Sender<Vec<Conversation>>),
    Messages(String, oneshot::Sender<Vec<Message>>),
    Presence(String, oneshot::Sender<Option<PresenceRecord>>),
    IsActive(String, oneshot::Sender<bool>),
    Typing(String, oneshot::Sender<Vec<TypingRecord>>),
    Queued(oneshot::Sender<Vec<QueuedOperation>>),
    Alerts(oneshot::Sender<Vec<TestAlert>>),
}

enum Wake {
    Command(Command),
    Orphaned,
    Frame(ChannelFrame),
    Opened(Result<Channel, OpenError>),
    Refreshed(Result<String, AuthError>),
    Reconnect,
    Heartbeat,
    TypingExpiry,
}

// ─── Handle ────────────────────────────────────────────────

/// Cloneable entry point to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn command(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    async fn query<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Query) -> Result<R, SyncError> {
        self.ask(|tx| Command::Query(make(tx))).await
    }

    /// Open the channel. No-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.command(Command::Connect).await
    }

    /// Close the channel and stop reconnecting until `connect`.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.command(Command::Disconnect).await
    }

    /// Reset the backoff and attempt right away.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.command(Command::Reconnect).await
    }

    /// The application came to the foreground.
    pub async fn notify_foreground(&self) -> Result<(), SyncError> {
        self.command(Command::Wake).await
    }

    /// The device went from offline to online.
    pub async fn notify_online(&self) -> Result<(), SyncError> {
        self.command(Command::Wake).await
    }

    /// Replace the bearer credential; lifts an authentication block.
    pub async fn set_credential(&self, credential: impl Into<String>) -> Result<(), SyncError> {
        self.command(Command::SetCredential(credential.into())).await
    }

    /// Send any outbound event, queueing it while offline.
    pub async fn send(&self, event: ClientEvent) -> Result<Delivery, SyncError> {
        self.ask(|reply| Command::Send { event, reply }).await?
    }

    pub async fn send_message(
        &self,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        reply_to_id: Option<String>,
    ) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::SendMessage(SendMessage {
            conversation_id: conversation_id.into(),
            content: content.into(),
            reply_to_id,
        }))
        .await
    }

    pub async fn edit_message(
        &self,
        message_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::EditMessage(EditMessage {
            message_id: message_id.into(),
            content: content.into(),
        }))
        .await
    }

    pub async fn delete_message(&self, message_id: impl Into<String>) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::DeleteMessage(MessageRef {
            message_id: message_id.into(),
        }))
        .await
    }

    pub async fn add_reaction(
        &self,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::React(ReactionRequest {
            message_id: message_id.into(),
            emoji: emoji.into(),
        }))
        .await
    }

    pub async fn remove_reaction(
        &self,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::Unreact(ReactionRequest {
            message_id: message_id.into(),
            emoji: emoji.into(),
        }))
        .await
    }

    pub async fn start_typing(&self, conversation_id: impl Into<String>) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::TypingStart(ConversationRef {
            conversation_id: conversation_id.into(),
        }))
        .await
    }

    pub async fn stop_typing(&self, conversation_id: impl Into<String>) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::TypingStop(ConversationRef {
            conversation_id: conversation_id.into(),
        }))
        .await
    }

    pub async fn update_presence(
        &self,
        status: PresenceStatus,
        status_message: Option<String>,
    ) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::PresenceUpdate(PresenceUpdateRequest {
            status,
            status_message,
        }))
        .await
    }

    pub async fn send_test_alert(
        &self,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::SendTestAlert(TestAlertRequest {
            title: title.into(),
            body: body.into(),
        }))
        .await
    }

    /// Clear a test alert here and tell the other sessions.
    pub async fn acknowledge_alert(&self, id: impl Into<String>) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::AcknowledgeTestAlert(IdRef { id: id.into() }))
            .await
    }

    pub async fn mark_notification_read(&self, id: impl Into<String>) -> Result<Delivery, SyncError> {
        self.send(ClientEvent::MarkNotificationRead(IdRef { id: id.into() }))
            .await
    }

    /// Make a conversation the open one: resets its unread count and joins
    /// its room, leaving the previous one.
    pub async fn open_conversation(&self, conversation_id: impl Into<String>) -> Result<(), SyncError> {
        self.command(Command::OpenConversation(Some(conversation_id.into())))
            .await
    }

    pub async fn close_conversation(&self) -> Result<(), SyncError> {
        self.command(Command::OpenConversation(None)).await
    }

    pub async fn set_notification_prefs(&self, prefs: NotificationPrefs) -> Result<(), SyncError> {
        self.command(Command::SetPrefs(prefs)).await
    }

    /// Seed the conversation list, e.g. from an HTTP fetch.
    pub async fn load_conversations(&self, conversations: Vec<Conversation>) -> Result<(), SyncError> {
        self.command(Command::LoadConversations(conversations)).await
    }

    /// Seed a conversation's message history.
    pub async fn load_history(
        &self,
        conversation_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> Result<(), SyncError> {
        self.command(Command::LoadHistory {
            conversation_id: conversation_id.into(),
            messages,
        })
        .await
    }

    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        self.query(Query::Status).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        self.query(Query::Conversations).await
    }

    pub async fn messages(&self, conversation_id: impl Into<String>) -> Result<Vec<Message>, SyncError> {
        let conversation_id = conversation_id.into();
        self.query(|tx| Query::Messages(conversation_id, tx)).await
    }

    pub async fn presence(&self, user_id: impl Into<String>) -> Result<Option<PresenceRecord>, SyncError> {
        let user_id = user_id.into();
        self.query(|tx| Query::Presence(user_id, tx)).await
    }

    pub async fn is_active(&self, user_id: impl Into<String>) -> Result<bool, SyncError> {
        let user_id = user_id.into();
        self.query(|tx| Query::IsActive(user_id, tx)).await
    }

    pub async fn typing_in(&self, conversation_id: impl Into<String>) -> Result<Vec<TypingRecord>, SyncError> {
        let conversation_id = conversation_id.into();
        self.query(|tx| Query::Typing(conversation_id, tx)).await
    }

    pub async fn queued_operations(&self) -> Result<Vec<QueuedOperation>, SyncError> {
        self.query(Query::Queued).await
    }

    pub async fn active_alerts(&self) -> Result<Vec<TestAlert>, SyncError> {
        self.query(Query::Alerts).await
    }

    /// Disconnect and drop all session state: queue, stores, alerts.
    pub async fn logout(&self) -> Result<(), SyncError> {
        self.ask(Command::Logout).await
    }

    /// Cancel all timers, close the channel and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.ask(Command::Shutdown).await
    }
}

// ─── Engine ────────────────────────────────────────────────

pub struct SyncEngine<T, C> {
    config: EngineConfig,
    local_user_id: String,
    credential: String,
    transport: T,
    credentials: C,

    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SyncEvent>,

    connection: ConnectionMachine,
    scheduler: ReconnectScheduler,
    heartbeat: HeartbeatMonitor,
    queue: OfflineQueue,
    presence: PresenceAggregator,
    store: ConversationStore,
    alerts: AlertBoard,
    prefs: NotificationPrefs,
    active_conversation: Option<String>,

    channel: Option<Channel>,
    /// Dial in flight while `Connecting`.
    dialing: Option<BoxFuture<'static, Result<Channel, OpenError>>>,
    /// Credential refresh in flight after a rejected handshake.
    refreshing: Option<BoxFuture<'static, Result<String, AuthError>>>,
    reconnect_at: Option<Instant>,
    rng: StdRng,
}

impl<T: Transport, C: CredentialSource> SyncEngine<T, C> {
    /// Build an engine. Nothing happens until it is run and `connect` is
    /// called.
    pub fn new(
        config: EngineConfig,
        local_user_id: impl Into<String>,
        credential: impl Into<String>,
        transport: T,
        credentials: C,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let local_user_id = local_user_id.into();

        let engine = Self {
            scheduler: ReconnectScheduler::from_config(&config),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.stale_timeout),
            queue: OfflineQueue::new(config.queue_capacity),
            presence: PresenceAggregator::new(
                local_user_id.clone(),
                config.typing_ttl,
                config.presence_freshness,
            ),
            local_user_id,
            credential: credential.into(),
            transport,
            credentials,
            commands: command_rx,
            events: event_tx,
            connection: ConnectionMachine::new(),
            store: ConversationStore::new(),
            alerts: AlertBoard::new(),
            prefs: NotificationPrefs::default(),
            active_conversation: None,
            channel: None,
            dialing: None,
            refreshing: None,
            reconnect_at: None,
            rng: StdRng::from_entropy(),
            config,
        };
        (engine, EngineHandle { commands: command_tx }, event_rx)
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// The actor loop. Ends on `shutdown` or when every handle is dropped.
    pub async fn run(mut self) {
        log::info!(
            "Sync engine started for user {} ({})",
            self.local_user_id,
            self.config.endpoint
        );

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Orphaned,
                },
                frame = next_frame(&mut self.channel) => Wake::Frame(frame),
                opened = in_flight(&mut self.dialing) => Wake::Opened(opened),
                refreshed = in_flight(&mut self.refreshing) => Wake::Refreshed(refreshed),
                _ = sleep_until(self.reconnect_at) => Wake::Reconnect,
                _ = sleep_until(self.heartbeat.next_deadline()) => Wake::Heartbeat,
                _ = sleep_until(self.presence.next_typing_expiry()) => Wake::TypingExpiry,
            };

            match wake {
                Wake::Command(Command::Shutdown(done)) => {
                    self.disconnect("engine shut down");
                    let _ = done.send(());
                    break;
                }
                Wake::Command(command) => self.handle_command(command),
                Wake::Orphaned => {
                    self.disconnect("all handles dropped");
                    break;
                }
                Wake::Frame(frame) => self.handle_frame(frame),
                Wake::Opened(opened) => {
                    self.dialing = None;
                    self.on_dialed(opened);
                }
                Wake::Refreshed(refreshed) => {
                    self.refreshing = None;
                    self.on_refreshed(refreshed);
                }
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    self.try_connect();
                }
                Wake::Heartbeat => self.handle_heartbeat(),
                Wake::TypingExpiry => self.expire_typing(),
            }
        }

        log::info!("Sync engine stopped");
    }

    fn emit(&self, event: SyncEvent) {
        // The host may have dropped its receiver; the engine keeps running.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.connection.clear_explicit();
                self.try_connect();
            }
            Command::Disconnect => self.disconnect("disconnected by client"),
            Command::Reconnect => {
                self.connection.clear_explicit();
                self.scheduler.reset();
                self.try_connect();
            }
            Command::Wake => self.try_connect(),
            Command::SetCredential(credential) => {
                self.credential = credential;
                let was_blocked = self.connection.is_auth_blocked();
                // A supplied credential supersedes one still being refreshed.
                let was_refreshing = self.refreshing.take().is_some();
                self.connection.credential_supplied();
                if was_blocked || was_refreshing {
                    log::info!("New credential supplied; resuming connection attempts");
                    self.try_connect();
                }
            }
            Command::Send { event, reply } => {
                let result = self.handle_send(event);
                let _ = reply.send(result);
            }
            Command::OpenConversation(next) => self.open_conversation(next),
            Command::SetPrefs(prefs) => self.prefs = prefs,
            Command::LoadConversations(conversations) => {
                for conversation in conversations {
                    self.store.commit(StoreDelta::UpsertConversation(conversation));
                }
                self.emit(SyncEvent::ConversationsChanged);
            }
            Command::LoadHistory {
                conversation_id,
                messages,
            } => {
                self.store.load_history(&conversation_id, messages);
                self.emit(SyncEvent::ConversationsChanged);
            }
            Command::Query(query) => self.answer(query),
            Command::Logout(done) => {
                self.disconnect("logged out");
                self.queue.clear();
                self.store.clear();
                self.presence.clear();
                self.alerts.reset();
                self.active_conversation = None;
                log::info!("Session state cleared");
                let _ = done.send(());
            }
            // handled by the run loop
            Command::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn answer(&mut self, query: Query) {
        match query {
            Query::Status(tx) => {
                let status = EngineStatus {
                    state: self.connection.state(),
                    attempt_count: self.scheduler.attempt_count(),
                    attempts_in_window: self.scheduler.attempts_in_window(Instant::now()),
                    queued: self.queue.len(),
                    auth_blocked: self.connection.is_auth_blocked(),
                    reconnect_pending: self.reconnect_at.is_some(),
                    heartbeat_running: self.heartbeat.is_running(),
                    active_conversation: self.active_conversation.clone(),
                };
                let _ = tx.send(status);
            }
            Query::Conversations(tx) => {
                let _ = tx.send(self.store.conversations().to_vec());
            }
            Query::Messages(conversation_id, tx) => {
                let _ = tx.send(self.store.messages(&conversation_id).to_vec());
            }
            Query::Presence(user_id, tx) => {
                let _ = tx.send(self.presence.presence(&user_id).cloned());
            }
            Query::IsActive(user_id, tx) => {
                let _ = tx.send(self.presence.is_active(&user_id, Utc::now()));
            }
            Query::Typing(conversation_id, tx) => {
                let _ = tx.send(self.presence.typing_in(&conversation_id, Instant::now()));
            }
            Query::Queued(tx) => {
                let _ = tx.send(self.queue.iter().cloned().collect());
            }
            Query::Alerts(tx) => {
                let _ = tx.send(self.alerts.active());
            }
        }
    }

    // ─── Connection lifecycle ──────────────────────────────

    /// Start an attempt if the machine and the rate window allow it. The
    /// dial runs in the background; its outcome arrives as `Wake::Opened`.
    fn try_connect(&mut self) {
        if !self.connection.can_auto_connect() || self.refreshing.is_some() {
            return;
        }
        let now = Instant::now();
        if let Err(defer) = self.scheduler.begin_attempt(now) {
            log::debug!("Reconnect rate limit reached; next check in {:?}", defer);
            self.arm_reconnect(ReconnectPlan::Throttled(defer));
            return;
        }
        self.reconnect_at = None;
        self.connection.begin_attempt();
        log::info!(
            "Connecting to {} (attempt {})",
            self.config.endpoint,
            self.scheduler.attempt_count()
        );

        let open = self.transport.open(&self.config.endpoint, &self.credential);
        let connect_timeout = self.config.connect_timeout;
        self.dialing = Some(
            async move {
                tokio::time::timeout(connect_timeout, open)
                    .await
                    .unwrap_or(Err(OpenError::Timeout))
            }
            .boxed(),
        );
    }

    fn on_dialed(&mut self, opened: Result<Channel, OpenError>) {
        match opened {
            Ok(channel) => self.on_open(channel),
            Err(OpenError::Unauthorized(reason)) => {
                log::warn!("Handshake rejected: {}", reason);
                self.on_failure(CloseCause::Unauthorized(reason));
            }
            Err(err) => {
                log::info!("Connection attempt failed: {}", err);
                self.on_failure(CloseCause::Network(err.to_string()));
            }
        }
    }

    fn on_open(&mut self, channel: Channel) {
        if !self.connection.opened() {
            return;
        }
        self.channel = Some(channel);
        self.scheduler.reset();
        log::info!("Connected to {}", self.config.endpoint);

        // Replay before reading anything inbound.
        if !self.flush_queue() {
            self.on_failure(CloseCause::Network("channel lost during replay".into()));
            return;
        }
        if let Some(conversation_id) = self.active_conversation.clone() {
            if !self.transmit(&ClientEvent::JoinConversation(ConversationRef { conversation_id })) {
                self.on_failure(CloseCause::Network("channel lost during rejoin".into()));
                return;
            }
        }
        self.heartbeat.start(Instant::now());
        self.emit(SyncEvent::Connected);
    }

    /// Drop the channel and decide what comes next.
    fn on_failure(&mut self, cause: CloseCause) {
        let was_connected = self.connection.is_connected();
        self.release_channel();

        match self.connection.failed(&cause) {
            Recovery::Ignore => {}
            Recovery::Reconnect => {
                if was_connected {
                    self.emit(SyncEvent::Disconnected {
                        reason: describe(&cause),
                    });
                }
                self.schedule_reconnect();
            }
            Recovery::RefreshCredential => {
                log::info!("Refreshing credential");
                self.refreshing = Some(self.credentials.refresh());
            }
            Recovery::Fatal => {
                log::warn!("Credential rejected after refresh; waiting for a new one");
                self.emit(SyncEvent::AuthenticationFailed {
                    reason: describe(&cause),
                });
            }
        }
    }

    fn on_refreshed(&mut self, refreshed: Result<String, AuthError>) {
        match refreshed {
            Ok(credential) => {
                self.credential = credential;
                self.schedule_reconnect();
            }
            Err(err) => {
                log::warn!("{}", err);
                self.connection.refresh_failed();
                self.emit(SyncEvent::AuthenticationFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let plan = self.scheduler.plan(Instant::now(), &mut self.rng);
        self.arm_reconnect(plan);
    }

    /// Arm the reconnect deadline, keeping an earlier one if already set.
    fn arm_reconnect(&mut self, plan: ReconnectPlan) {
        let delay = plan.delay();
        let at = Instant::now() + delay;
        self.reconnect_at = Some(match self.reconnect_at {
            Some(existing) if existing < at => existing,
            _ => at,
        });
        log::info!("Reconnecting in {:?}", delay);
        self.emit(SyncEvent::ReconnectScheduled {
            attempt: self.scheduler.attempt_count(),
            delay,
            throttled: matches!(plan, ReconnectPlan::Throttled(_)),
        });
    }

    /// Explicit teardown: no reconnect follows, and a dial or refresh in
    /// flight is abandoned.
    fn disconnect(&mut self, reason: &str) {
        let previous = self.connection.disconnect();
        self.reconnect_at = None;
        self.dialing = None;
        self.refreshing = None;
        self.release_channel();
        if previous != ConnectionState::Disconnected {
            log::info!("Disconnected: {}", reason);
            self.emit(SyncEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn release_channel(&mut self) {
        self.channel = None;
        self.heartbeat.stop();
        let typing = self.presence.typing_conversations();
        self.presence.clear_typing();
        for conversation_id in typing {
            self.emit(SyncEvent::TypingChanged { conversation_id });
        }
    }

    // ─── Outbound ──────────────────────────────────────────

    /// Hand one event to the open channel. `false` if there is none or it
    /// has gone away.
    fn transmit(&self, event: &ClientEvent) -> bool {
        let Some(channel) = self.channel.as_ref() else {
            return false;
        };
        match event.encode() {
            Ok(text) => channel.send(text).is_ok(),
            Err(err) => {
                log::warn!("Dropping unencodable {}: {}", event.name(), err);
                true
            }
        }
    }

    /// Replay the offline queue in order. `false` if the channel went away.
    fn flush_queue(&mut self) -> bool {
        if self.queue.is_empty() {
            return true;
        }
        let Some(channel) = self.channel.as_ref() else {
            return false;
        };
        let store = &self.store;
        let report = self.queue.flush(|op| {
            if let Some(conflict) = store.replay_conflict(&op.event) {
                return Replay::Discard(conflict);
            }
            match op.event.encode() {
                Ok(text) => match channel.send(text) {
                    Ok(()) => Replay::Sent,
                    Err(_) => Replay::Interrupted,
                },
                Err(err) => Replay::Discard(err.into()),
            }
        });

        for (operation, reason) in report.discarded {
            log::warn!(
                "Discarding queued {} ({}): {}",
                operation.event.name(),
                operation.id,
                reason
            );
            self.emit(SyncEvent::ReplayFailed { operation, reason });
        }
        if report.sent > 0 {
            log::info!("Replayed {} queued operations", report.sent);
            self.emit(SyncEvent::QueueFlushed { sent: report.sent });
        }
        !report.interrupted
    }

    fn handle_send(&mut self, event: ClientEvent) -> Result<Delivery, SyncError> {
        event.encode()?;
        self.apply_local(&event);

        if self.connection.is_connected() {
            if self.transmit(&event) {
                return Ok(Delivery::Sent);
            }
            // Live send failed: keep the operation, then treat it as a drop.
            let queued = self.queue.enqueue(event, Instant::now());
            self.on_failure(CloseCause::Network("send failed".into()));
            return queued.map(Delivery::Queued);
        }

        let id = self.queue.enqueue(event, Instant::now())?;
        log::debug!("Queued operation {} ({} pending)", id, self.queue.len());
        Ok(Delivery::Queued(id))
    }

    /// Local effects of an outbound event that do not wait for the server.
    fn apply_local(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::AcknowledgeTestAlert(IdRef { id }) => {
                if self.alerts.clear(id) {
                    self.emit(SyncEvent::TestAlertCleared { id: id.clone() });
                }
            }
            ClientEvent::PresenceUpdate(update) => {
                self.presence.upsert(
                    self.local_user_id.clone(),
                    update.status,
                    update.status_message.clone(),
                    None,
                    Utc::now(),
                );
                self.emit(SyncEvent::PresenceChanged(vec![self.local_user_id.clone()]));
            }
            _ => {}
        }
    }

    fn open_conversation(&mut self, next: Option<String>) {
        if let Some(id) = next.as_deref() {
            if self.store.mark_read(id) {
                self.emit(SyncEvent::ConversationsChanged);
            }
        }
        if next == self.active_conversation {
            return;
        }
        let previous = std::mem::replace(&mut self.active_conversation, next.clone());
        if !self.connection.is_connected() {
            // joined on the next connect
            return;
        }

        let mut membership = Vec::new();
        if let Some(conversation_id) = previous {
            membership.push(ClientEvent::LeaveConversation(ConversationRef { conversation_id }));
        }
        if let Some(conversation_id) = next {
            membership.push(ClientEvent::JoinConversation(ConversationRef { conversation_id }));
        }
        for event in &membership {
            if !self.transmit(event) {
                self.on_failure(CloseCause::Network("send failed".into()));
                return;
            }
        }
    }

    // ─── Inbound ───────────────────────────────────────────

    fn handle_frame(&mut self, frame: ChannelFrame) {
        match frame {
            ChannelFrame::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                log::info!("Channel closed: {}", reason);
                self.on_failure(CloseCause::Network(reason));
            }
            ChannelFrame::Text(text) => match ServerEvent::decode(&text) {
                Ok(event) => self.dispatch(event),
                Err(ProtocolError::UnknownEvent(name)) => {
                    log::debug!("Ignoring unknown event {}", name);
                }
                Err(err) => log::debug!("Dropping malformed frame: {}", err),
            },
        }
    }

    fn dispatch(&mut self, event: ServerEvent) {
        match event.class() {
            EventClass::Heartbeat => self.heartbeat.on_pong(Instant::now()),
            EventClass::Presence => self.apply_presence(&event),
            EventClass::Conversation => self.apply_conversation(&event),
            EventClass::Alert => self.apply_alert(event),
        }
    }

    fn apply_presence(&mut self, event: &ServerEvent) {
        let Some(delta) = self.presence.plan(event, Instant::now(), Utc::now()) else {
            return;
        };
        let change = match &delta {
            PresenceDelta::Upsert(records) => {
                SyncEvent::PresenceChanged(records.iter().map(|(user, _)| user.clone()).collect())
            }
            PresenceDelta::TypingStarted(record) => SyncEvent::TypingChanged {
                conversation_id: record.conversation_id.clone(),
            },
            PresenceDelta::TypingStopped { conversation_id, .. } => SyncEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
            },
        };
        self.presence.commit(delta);
        self.emit(change);
    }

    fn apply_conversation(&mut self, event: &ServerEvent) {
        let ctx = ReconcileContext {
            local_user_id: &self.local_user_id,
            active_conversation: self.active_conversation.as_deref(),
            prefs: &self.prefs,
            now: Utc::now(),
        };
        let Some(Reconciliation {
            delta,
            notice,
            unknown_conversation,
        }) = Reconciler::plan(&self.store, event, &ctx)
        else {
            log::trace!("No-op {}", event.name());
            return;
        };

        let change = match &delta {
            StoreDelta::AppendMessage { message, .. } => SyncEvent::MessageReceived(message.clone()),
            StoreDelta::EditMessage {
                conversation_id,
                message_id,
                ..
            }
            | StoreDelta::RemoveMessage {
                conversation_id,
                message_id,
            }
            | StoreDelta::AddReaction {
                conversation_id,
                message_id,
                ..
            }
            | StoreDelta::RemoveReaction {
                conversation_id,
                message_id,
                ..
            } => SyncEvent::MessageChanged {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
            },
            StoreDelta::UpsertConversation(_) => SyncEvent::ConversationsChanged,
        };

        // A message from someone ends their typing indicator.
        let typed = match &delta {
            StoreDelta::AppendMessage { message, .. } => self
                .presence
                .stop_typing(&message.conversation_id, &message.sender_id)
                .then(|| message.conversation_id.clone()),
            _ => None,
        };

        self.store.commit(delta);
        self.emit(change);
        if let Some(conversation_id) = typed {
            self.emit(SyncEvent::TypingChanged { conversation_id });
        }
        if unknown_conversation {
            if let ServerEvent::MessageReceived(message) = event {
                log::debug!("Message for unknown conversation {}", message.conversation_id);
                self.emit(SyncEvent::UnknownConversation(message.conversation_id.clone()));
            }
        }
        if let Some(notice) = notice {
            self.emit(SyncEvent::IncomingMessage(notice));
        }
    }

    fn apply_alert(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Notification(notification) => {
                self.emit(SyncEvent::Notification(notification));
            }
            ServerEvent::TestAlert(alert) => {
                if self.alerts.receive(alert.clone()) {
                    log::info!("Test alert {} received", alert.id);
                    self.emit(SyncEvent::TestAlert(alert));
                }
            }
            ServerEvent::TestAlertAcknowledged(ack) => {
                if self.alerts.clear(&ack.id) {
                    log::info!(
                        "Test alert {} acknowledged by {}",
                        ack.id,
                        ack.acknowledged_by.as_deref().unwrap_or("another session")
                    );
                    self.emit(SyncEvent::TestAlertCleared { id: ack.id });
                }
            }
            _ => {}
        }
    }

    // ─── Timers ────────────────────────────────────────────

    fn handle_heartbeat(&mut self) {
        match self.heartbeat.poll(Instant::now()) {
            Some(HeartbeatAction::Probe) => {
                if !self.transmit(&ClientEvent::Ping) {
                    self.on_failure(CloseCause::Network("probe failed".into()));
                }
            }
            Some(HeartbeatAction::Stale) => {
                log::warn!(
                    "No pong for {:?}; closing stale connection",
                    self.config.stale_timeout
                );
                self.on_failure(CloseCause::Stale);
            }
            None => {}
        }
    }

    fn expire_typing(&mut self) {
        for conversation_id in self.presence.expire_typing(Instant::now()) {
            self.emit(SyncEvent::TypingChanged { conversation_id });
        }
    }
}

fn describe(cause: &CloseCause) -> String {
    match cause {
        CloseCause::Network(reason) | CloseCause::Unauthorized(reason) => reason.clone(),
        CloseCause::Stale => "heartbeat timed out".to_string(),
    }
}

async fn in_flight<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(channel: &mut Option<Channel>) -> ChannelFrame {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
