//! End-to-end engine scenarios over a scripted in-memory transport.
//!
//! Time is paused: every timer (backoff, heartbeat, typing expiry) fires
//! as soon as the runtime goes idle, so the scenarios run instantly and
//! deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parley_sync::protocol::{
    AlertAcknowledged, ConversationChange, ConversationRef, EditMessage, IdRef, MessageDeleted,
    PresenceBatch, PresenceChange, SendMessage, TypingIndicator,
};
use parley_sync::{
    AuthError, Channel, ChannelPeer, ClientEvent, ConnectionState, Conversation,
    ConversationKind, CredentialSource, Delivery, EngineConfig, EngineHandle, Message, NoRefresh,
    OpenError, PresenceStatus, RefreshWith, ReplayError, ServerEvent, SyncEngine, SyncError,
    SyncEvent, TestAlert, Transport,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum Step {
    Accept,
    Fail,
    Reject,
}

type AttemptLog = Arc<Mutex<Vec<(Instant, String)>>>;

/// Plays back a script of open outcomes; accepts once the script runs out.
/// Each dial takes `dial_delay` before it resolves.
struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Step>>>,
    peers: mpsc::UnboundedSender<ChannelPeer>,
    attempts: AttemptLog,
    dial_delay: Duration,
}

impl Transport for ScriptedTransport {
    fn open(
        &mut self,
        _endpoint: &str,
        credential: &str,
    ) -> BoxFuture<'static, Result<Channel, OpenError>> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), credential.to_string()));
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);
        let peers = self.peers.clone();
        let dial_delay = self.dial_delay;
        async move {
            if !dial_delay.is_zero() {
                tokio::time::sleep(dial_delay).await;
            }
            match step {
                Step::Accept => {
                    let (channel, peer) = Channel::in_memory();
                    let _ = peers.send(peer);
                    Ok(channel)
                }
                Step::Fail => Err(OpenError::Network("connection refused".into())),
                Step::Reject => Err(OpenError::Unauthorized("HTTP 401 Unauthorized".into())),
            }
        }
        .boxed()
    }
}

struct Harness {
    handle: EngineHandle,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    peers: mpsc::UnboundedReceiver<ChannelPeer>,
    attempts: AttemptLog,
}

fn test_config() -> EngineConfig {
    EngineConfig::with_endpoint("ws://parley.test/socket")
}

fn start(script: Vec<Step>) -> Harness {
    start_with(script, test_config(), NoRefresh)
}

fn start_with<C: CredentialSource>(script: Vec<Step>, config: EngineConfig, credentials: C) -> Harness {
    start_dialing(script, config, credentials, Duration::ZERO)
}

fn start_dialing<C: CredentialSource>(
    script: Vec<Step>,
    config: EngineConfig,
    credentials: C,
    dial_delay: Duration,
) -> Harness {
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let attempts = AttemptLog::default();
    let transport = ScriptedTransport {
        script: Arc::new(Mutex::new(script.into())),
        peers: peer_tx,
        attempts: attempts.clone(),
        dial_delay,
    };
    let (engine, handle, events) = SyncEngine::new(config, "me", "token-0", transport, credentials);
    engine.spawn();
    Harness {
        handle,
        events,
        peers: peer_rx,
        attempts,
    }
}

impl Harness {
    async fn next_event(&mut self) -> SyncEvent {
        timeout(Duration::from_secs(3600), self.events.recv())
            .await
            .expect("no engine event within an hour")
            .expect("engine stopped")
    }

    async fn wait_for(&mut self, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Wait for the next `Connected` and return the server end of that channel.
    async fn wait_connected(&mut self) -> ChannelPeer {
        self.wait_for(|e| matches!(e, SyncEvent::Connected)).await;
        self.peers.recv().await.expect("accepted channel")
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn credentials_used(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }
}

fn send_event(conversation_id: &str, content: &str) -> ClientEvent {
    ClientEvent::SendMessage(SendMessage {
        conversation_id: conversation_id.into(),
        content: content.into(),
        reply_to_id: None,
    })
}

fn message(id: &str, conversation_id: &str, sender_id: &str) -> Message {
    Message {
        id: id.into(),
        conversation_id: conversation_id.into(),
        sender_id: sender_id.into(),
        sender_name: Some("Bo".into()),
        content: format!("hello from {sender_id}"),
        created_at: Utc::now(),
        edited_at: None,
        reply_to_id: None,
        reactions: Vec::new(),
        attachments: Vec::new(),
    }
}

fn conversation(id: &str) -> Conversation {
    Conversation {
        id: id.into(),
        kind: ConversationKind::Group,
        name: Some(format!("#{id}")),
        participants: Vec::new(),
        last_message: None,
        unread_count: 0,
        updated_at: Utc::now() - TimeDelta::hours(1),
    }
}

// ─── Reconnection ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_backoff_reconnect_flushes_queue_and_resumes_heartbeat() {
    let mut h = start(vec![
        Step::Accept,
        Step::Fail,
        Step::Fail,
        Step::Fail,
        Step::Accept,
    ]);
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    // Network drop
    assert!(peer.close(Some("network lost")).await);
    drop(peer);
    h.wait_for(|e| matches!(e, SyncEvent::Disconnected { .. })).await;

    // Two messages while offline
    let first = h.handle.send_message("c1", "first", None).await.unwrap();
    let second = h.handle.send_message("c1", "second", None).await.unwrap();
    assert!(matches!(first, Delivery::Queued(_)));
    assert!(matches!(second, Delivery::Queued(_)));
    assert_eq!(h.handle.status().await.unwrap().queued, 2);

    let mut delays = Vec::new();
    let mut flushed = None;
    loop {
        match h.next_event().await {
            SyncEvent::ReconnectScheduled { delay, throttled, .. } => {
                assert!(!throttled);
                delays.push(delay);
            }
            SyncEvent::QueueFlushed { sent } => flushed = Some(sent),
            SyncEvent::Connected => break,
            _ => {}
        }
    }

    // One delay after the drop, one after each of the three failures
    assert_eq!(delays.len(), 4);
    for (n, delay) in delays.iter().enumerate() {
        let backoff = Duration::from_secs(1 << n);
        assert!(*delay >= backoff, "delay {n} = {delay:?}");
        assert!(*delay <= backoff.mul_f64(1.31), "delay {n} = {delay:?}");
    }
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(h.attempt_count(), 5);
    assert_eq!(flushed, Some(2));

    // Replayed in order, exactly once
    let mut peer = h.peers.recv().await.unwrap();
    assert_eq!(peer.next_event().await, Some(send_event("c1", "first")));
    assert_eq!(peer.next_event().await, Some(send_event("c1", "second")));

    // Heartbeat resumes on the new channel
    assert_eq!(peer.next_event().await, Some(ClientEvent::Ping));

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.queued, 0);
    assert_eq!(status.attempt_count, 0);
    assert!(status.heartbeat_running);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_is_transmitted_once() {
    let mut h = start(vec![]);

    let delivery = h.handle.send_message("c1", "hello", None).await.unwrap();
    let Delivery::Queued(id) = delivery else {
        panic!("expected the message to be queued, got {delivery:?}");
    };
    let queued = h.handle.queued_operations().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, id);

    h.handle.connect().await.unwrap();
    let mut peer = h.wait_connected().await;
    assert_eq!(peer.drain_events(), vec![send_event("c1", "hello")]);

    // Drop and come back: nothing is replayed a second time
    peer.close(None).await;
    drop(peer);
    let mut peer = h.wait_connected().await;
    assert!(peer.drain_events().is_empty());
    assert!(h.handle.queued_operations().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_live_send_goes_straight_out() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let mut peer = h.wait_connected().await;

    let delivery = h.handle.send_message("c1", "now", Some("m0".into())).await.unwrap();
    assert_eq!(delivery, Delivery::Sent);
    assert_eq!(
        peer.next_event().await,
        Some(ClientEvent::SendMessage(SendMessage {
            conversation_id: "c1".into(),
            content: "now".into(),
            reply_to_id: Some("m0".into()),
        }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_window_throttles_attempts() {
    let config = EngineConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        jitter_factor: 0.0,
        max_attempts_per_window: 3,
        rate_window: Duration::from_secs(60),
        ..test_config()
    };
    let mut h = start_with(vec![Step::Fail; 20], config, NoRefresh);
    h.handle.connect().await.unwrap();

    let throttle = h
        .wait_for(|e| matches!(e, SyncEvent::ReconnectScheduled { throttled: true, .. }))
        .await;
    let SyncEvent::ReconnectScheduled { delay, .. } = throttle else {
        unreachable!()
    };
    assert_eq!(delay, Duration::from_secs(20));
    assert_eq!(h.attempt_count(), 3);

    // Still saturated 20 s later: no extra attempt
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(h.attempt_count(), 3);
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.attempts_in_window, 3);
    assert!(status.reconnect_pending);
}

#[tokio::test(start_paused = true)]
async fn test_wake_signals_respect_rate_window() {
    let config = EngineConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        jitter_factor: 0.0,
        max_attempts_per_window: 3,
        rate_window: Duration::from_secs(60),
        ..test_config()
    };
    let mut h = start_with(vec![Step::Fail; 20], config, NoRefresh);
    h.handle.connect().await.unwrap();
    h.wait_for(|e| matches!(e, SyncEvent::ReconnectScheduled { throttled: true, .. }))
        .await;
    assert_eq!(h.attempt_count(), 3);

    h.handle.notify_online().await.unwrap();
    h.handle.notify_foreground().await.unwrap();
    for _ in 0..2 {
        let event = h.next_event().await;
        assert!(
            matches!(event, SyncEvent::ReconnectScheduled { throttled: true, .. }),
            "got {event:?}"
        );
    }
    assert_eq!(h.attempt_count(), 3);
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.attempts_in_window, 3);
    assert!(status.reconnect_pending);
}

#[tokio::test(start_paused = true)]
async fn test_foreground_skips_pending_backoff() {
    let config = EngineConfig {
        base_delay: Duration::from_secs(10),
        ..test_config()
    };
    let mut h = start_with(vec![], config, NoRefresh);
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    peer.close(None).await;
    drop(peer);
    let scheduled = h
        .wait_for(|e| matches!(e, SyncEvent::ReconnectScheduled { .. }))
        .await;
    let SyncEvent::ReconnectScheduled { delay, .. } = scheduled else {
        unreachable!()
    };
    assert!(delay >= Duration::from_secs(10));

    let dropped_at = Instant::now();
    h.handle.notify_foreground().await.unwrap();
    let _peer = h.wait_connected().await;
    assert!(dropped_at.elapsed() < Duration::from_secs(10));
    assert_eq!(h.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_stops_reconnecting() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let _peer = h.wait_connected().await;

    h.handle.disconnect().await.unwrap();
    let event = h
        .wait_for(|e| matches!(e, SyncEvent::Disconnected { .. }))
        .await;
    assert!(matches!(event, SyncEvent::Disconnected { reason } if reason == "disconnected by client"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    h.handle.notify_online().await.unwrap();
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.reconnect_pending);
    assert!(!status.heartbeat_running);
    assert_eq!(h.attempt_count(), 1);

    // connect() clears the explicit flag
    h.handle.connect().await.unwrap();
    let _peer = h.wait_connected().await;
    assert_eq!(h.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_noop_when_connected() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let _peer = h.wait_connected().await;
    h.handle.connect().await.unwrap();
    h.handle.connect().await.unwrap();
    assert_eq!(h.handle.status().await.unwrap().state, ConnectionState::Connected);
    assert_eq!(h.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dial_in_progress_is_visible_and_queues_sends() {
    let mut h = start_dialing(vec![], test_config(), NoRefresh, Duration::from_secs(8));
    h.handle.connect().await.unwrap();

    // The engine keeps serving the handle while the dial is pending
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Connecting);
    h.handle.connect().await.unwrap();
    h.handle.reconnect().await.unwrap();
    assert_eq!(h.attempt_count(), 1);

    let delivery = h.handle.send_message("c1", "during dial", None).await.unwrap();
    assert!(matches!(delivery, Delivery::Queued(_)));

    let mut peer = h.wait_connected().await;
    assert_eq!(peer.drain_events(), vec![send_event("c1", "during dial")]);
    assert_eq!(h.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_dial_abandons_it() {
    let mut h = start_dialing(vec![], test_config(), NoRefresh, Duration::from_secs(8));
    h.handle.send_message("c1", "held", None).await.unwrap();
    h.handle.connect().await.unwrap();
    assert_eq!(
        h.handle.status().await.unwrap().state,
        ConnectionState::Connecting
    );

    h.handle.disconnect().await.unwrap();
    let event = h.next_event().await;
    assert!(matches!(event, SyncEvent::Disconnected { reason } if reason == "disconnected by client"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, SyncEvent::Connected), "abandoned dial connected");
    }
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.reconnect_pending);
    assert_eq!(status.queued, 1);
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.attempt_count(), 1);
}

// ─── Heartbeat ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_missing_pongs_close_stale_connection() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let mut peer = h.wait_connected().await;
    let connected_at = Instant::now();

    assert_eq!(peer.next_event().await, Some(ClientEvent::Ping));
    assert_eq!(peer.next_event().await, Some(ClientEvent::Ping));

    let event = h
        .wait_for(|e| matches!(e, SyncEvent::Disconnected { .. }))
        .await;
    assert!(matches!(event, SyncEvent::Disconnected { reason } if reason == "heartbeat timed out"));
    assert!(connected_at.elapsed() >= Duration::from_secs(59));

    // Treated as a network failure: reconnects on its own
    let _peer = h.wait_connected().await;
    assert_eq!(h.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pongs_keep_connection_alive() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let mut peer = h.wait_connected().await;

    for _ in 0..5 {
        assert_eq!(peer.next_event().await, Some(ClientEvent::Ping));
        assert!(peer.push(&ServerEvent::Pong).await);
    }

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, SyncEvent::Disconnected { .. }));
    }
    assert_eq!(h.attempt_count(), 1);
}

// ─── Authentication ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_rejected_handshake_refreshes_credential_once() {
    let refresh = RefreshWith(|| async { Ok::<_, AuthError>("token-1".to_string()) });
    let mut h = start_with(vec![Step::Reject, Step::Accept], test_config(), refresh);
    h.handle.connect().await.unwrap();
    let _peer = h.wait_connected().await;
    assert_eq!(h.credentials_used(), vec!["token-0", "token-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_second_rejection_is_fatal() {
    let refresh = RefreshWith(|| async { Ok::<_, AuthError>("token-1".to_string()) });
    let mut h = start_with(vec![Step::Reject, Step::Reject], test_config(), refresh);
    h.handle.connect().await.unwrap();
    h.wait_for(|e| matches!(e, SyncEvent::AuthenticationFailed { .. }))
        .await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.attempt_count(), 2);
    let status = h.handle.status().await.unwrap();
    assert!(status.auth_blocked);
    assert!(!status.reconnect_pending);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_waits_for_new_credential() {
    let mut h = start(vec![Step::Reject]);
    h.handle.connect().await.unwrap();
    h.wait_for(|e| matches!(e, SyncEvent::AuthenticationFailed { .. }))
        .await;

    // Background triggers do nothing while blocked
    h.handle.notify_foreground().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.attempt_count(), 1);

    h.handle.set_credential("token-new").await.unwrap();
    let _peer = h.wait_connected().await;
    assert_eq!(h.credentials_used(), vec!["token-0", "token-new"]);
    assert!(!h.handle.status().await.unwrap().auth_blocked);
}

// ─── Alerts ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_alert_first_acknowledge_wins_across_devices() {
    let mut device_a = start(vec![]);
    let mut device_b = start(vec![]);
    device_a.handle.connect().await.unwrap();
    device_b.handle.connect().await.unwrap();
    let mut peer_a = device_a.wait_connected().await;
    let peer_b = device_b.wait_connected().await;

    let alert = TestAlert {
        id: "alert-1".into(),
        title: "Drill".into(),
        body: "This is only a test".into(),
        sender_id: Some("admin".into()),
        created_at: Utc::now(),
    };
    peer_a.push(&ServerEvent::TestAlert(alert.clone())).await;
    peer_b.push(&ServerEvent::TestAlert(alert.clone())).await;
    device_a.wait_for(|e| matches!(e, SyncEvent::TestAlert(_))).await;
    device_b.wait_for(|e| matches!(e, SyncEvent::TestAlert(_))).await;
    assert_eq!(device_b.handle.active_alerts().await.unwrap(), vec![alert]);

    // A acknowledges
    let delivery = device_a.handle.acknowledge_alert("alert-1").await.unwrap();
    assert_eq!(delivery, Delivery::Sent);
    device_a
        .wait_for(|e| matches!(e, SyncEvent::TestAlertCleared { id } if id == "alert-1"))
        .await;
    assert_eq!(
        peer_a.next_event().await,
        Some(ClientEvent::AcknowledgeTestAlert(IdRef {
            id: "alert-1".into()
        }))
    );

    // Server relays to B
    peer_b
        .push(&ServerEvent::TestAlertAcknowledged(AlertAcknowledged {
            id: "alert-1".into(),
            acknowledged_by: Some("me".into()),
        }))
        .await;
    device_b
        .wait_for(|e| matches!(e, SyncEvent::TestAlertCleared { id } if id == "alert-1"))
        .await;
    assert!(device_a.handle.active_alerts().await.unwrap().is_empty());
    assert!(device_b.handle.active_alerts().await.unwrap().is_empty());
}

// ─── Conversations ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_background_message_bumps_unread_and_notifies() {
    let mut h = start(vec![]);
    h.handle
        .load_conversations(vec![conversation("c1"), conversation("c2")])
        .await
        .unwrap();
    h.handle.open_conversation("c1").await.unwrap();
    h.handle.connect().await.unwrap();
    let mut peer = h.wait_connected().await;

    // Open conversation is joined on connect
    assert_eq!(
        peer.next_event().await,
        Some(ClientEvent::JoinConversation(ConversationRef {
            conversation_id: "c1".into()
        }))
    );

    // Background conversation
    let m1 = message("m1", "c2", "u2");
    peer.push(&ServerEvent::MessageReceived(m1.clone())).await;
    let notice = h
        .wait_for(|e| matches!(e, SyncEvent::IncomingMessage(_)))
        .await;
    let SyncEvent::IncomingMessage(notice) = notice else {
        unreachable!()
    };
    assert_eq!(notice.conversation_id, "c2");
    assert!(notice.sound && notice.banner);

    // Duplicate delivery is absorbed
    peer.push(&ServerEvent::MessageReceived(m1)).await;
    // Open conversation: no unread, no notice
    let mut m2 = message("m2", "c1", "u2");
    m2.created_at = Utc::now() + TimeDelta::minutes(1);
    peer.push(&ServerEvent::MessageReceived(m2)).await;
    h.wait_for(|e| matches!(e, SyncEvent::MessageReceived(m) if m.id == "m2"))
        .await;

    let conversations = h.handle.conversations().await.unwrap();
    let unread = |id: &str| {
        conversations
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.unread_count)
    };
    assert_eq!(unread("c2"), Some(1));
    assert_eq!(unread("c1"), Some(0));
    assert_eq!(conversations[0].id, "c1");
    assert_eq!(h.handle.messages("c2").await.unwrap().len(), 1);

    // Opening c2 resets its count and moves the room membership
    h.handle.open_conversation("c2").await.unwrap();
    assert_eq!(
        peer.next_event().await,
        Some(ClientEvent::LeaveConversation(ConversationRef {
            conversation_id: "c1".into()
        }))
    );
    assert_eq!(
        peer.next_event().await,
        Some(ClientEvent::JoinConversation(ConversationRef {
            conversation_id: "c2".into()
        }))
    );
    let conversations = h.handle.conversations().await.unwrap();
    assert!(conversations.iter().all(|c| c.unread_count == 0));
}

#[tokio::test(start_paused = true)]
async fn test_conversation_events_upsert_and_resort() {
    let mut h = start(vec![]);
    h.handle
        .load_conversations(vec![conversation("c1"), conversation("c2")])
        .await
        .unwrap();
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    peer.push(&ServerEvent::MessageReceived(message("m1", "c2", "u2")))
        .await;
    h.wait_for(|e| matches!(e, SyncEvent::MessageReceived(_))).await;

    let order = |conversations: Vec<Conversation>| -> Vec<String> {
        conversations.into_iter().map(|c| c.id).collect()
    };

    // A new conversation lands in timestamp order
    let mut created = conversation("c3");
    created.updated_at = Utc::now() + TimeDelta::minutes(5);
    peer.push(&ServerEvent::ConversationCreated(ConversationChange::from(created)))
        .await;
    h.wait_for(|e| matches!(e, SyncEvent::ConversationsChanged)).await;
    assert_eq!(
        order(h.handle.conversations().await.unwrap()),
        vec!["c3", "c2", "c1"]
    );

    // A rename without counters keeps the local unread count and last message
    peer.push_raw(
        r#"{"event":"conversation:updated","data":{"id":"c2","type":"group","name":"renamed","updatedAt":"2020-01-01T00:00:00Z"}}"#,
    )
    .await;
    h.wait_for(|e| matches!(e, SyncEvent::ConversationsChanged)).await;
    let conversations = h.handle.conversations().await.unwrap();
    let c2 = conversations.iter().find(|c| c.id == "c2").unwrap();
    assert_eq!(c2.name.as_deref(), Some("renamed"));
    assert_eq!(c2.unread_count, 1);
    assert_eq!(c2.last_message.as_ref().map(|m| m.id.as_str()), Some("m1"));
    assert_eq!(order(conversations), vec!["c3", "c2", "c1"]);

    // A newer update time moves a conversation to the top
    let mut bumped = conversation("c1");
    bumped.updated_at = Utc::now() + TimeDelta::minutes(10);
    peer.push(&ServerEvent::ConversationUpdated(ConversationChange::from(bumped)))
        .await;
    h.wait_for(|e| matches!(e, SyncEvent::ConversationsChanged)).await;
    assert_eq!(
        order(h.handle.conversations().await.unwrap()),
        vec!["c1", "c3", "c2"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_message_for_unknown_conversation_is_kept() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    peer.push(&ServerEvent::MessageReceived(message("m9", "c9", "u2")))
        .await;
    let event = h
        .wait_for(|e| matches!(e, SyncEvent::UnknownConversation(_)))
        .await;
    assert!(matches!(event, SyncEvent::UnknownConversation(id) if id == "c9"));
    assert_eq!(h.handle.messages("c9").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_edit_of_deleted_message_is_discarded() {
    let mut h = start(vec![]);
    h.handle.load_conversations(vec![conversation("c1")]).await.unwrap();
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    peer.push(&ServerEvent::MessageReceived(message("m1", "c1", "u2")))
        .await;
    peer.push(&ServerEvent::MessageDeleted(MessageDeleted {
        message_id: "m1".into(),
        conversation_id: "c1".into(),
    }))
    .await;
    h.wait_for(|e| matches!(e, SyncEvent::MessageChanged { message_id, .. } if message_id == "m1"))
        .await;
    peer.close(None).await;
    drop(peer);
    h.wait_for(|e| matches!(e, SyncEvent::Disconnected { .. })).await;

    let delivery = h.handle.edit_message("m1", "too late").await.unwrap();
    assert!(matches!(delivery, Delivery::Queued(_)));
    h.handle.send_message("c1", "still fine", None).await.unwrap();

    let failed = h
        .wait_for(|e| matches!(e, SyncEvent::ReplayFailed { .. }))
        .await;
    let SyncEvent::ReplayFailed { operation, reason } = failed else {
        unreachable!()
    };
    assert_eq!(reason, ReplayError::TargetDeleted("m1".into()));
    assert_eq!(
        operation.event,
        ClientEvent::EditMessage(EditMessage {
            message_id: "m1".into(),
            content: "too late".into(),
        })
    );

    let mut peer = h.wait_connected().await;
    assert_eq!(peer.drain_events(), vec![send_event("c1", "still fine")]);
}

// ─── Presence & typing ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_expires() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    // Own echo is ignored
    peer.push(&ServerEvent::TypingIndicator(TypingIndicator {
        conversation_id: "c1".into(),
        user_id: "me".into(),
        display_name: "Me".into(),
        is_typing: true,
    }))
    .await;
    peer.push(&ServerEvent::TypingIndicator(TypingIndicator {
        conversation_id: "c1".into(),
        user_id: "u2".into(),
        display_name: "Bo".into(),
        is_typing: true,
    }))
    .await;
    h.wait_for(|e| matches!(e, SyncEvent::TypingChanged { .. })).await;
    let typing = h.handle.typing_in("c1").await.unwrap();
    assert_eq!(typing.len(), 1);
    assert_eq!(typing[0].user_id, "u2");

    let started = Instant::now();
    h.wait_for(|e| matches!(e, SyncEvent::TypingChanged { .. })).await;
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(h.handle.typing_in("c1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_presence_updates_and_batches() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let peer = h.wait_connected().await;

    let now = Utc::now();
    peer.push(&ServerEvent::PresenceBatch(PresenceBatch {
        users: vec![
            PresenceChange {
                user_id: "u2".into(),
                status: PresenceStatus::Online,
                status_message: None,
                last_seen: Some(now - TimeDelta::minutes(4)),
            },
            PresenceChange {
                user_id: "u3".into(),
                status: PresenceStatus::Online,
                status_message: None,
                last_seen: Some(now - TimeDelta::minutes(6)),
            },
        ],
    }))
    .await;
    let event = h
        .wait_for(|e| matches!(e, SyncEvent::PresenceChanged(_)))
        .await;
    assert!(matches!(event, SyncEvent::PresenceChanged(users) if users.len() == 2));
    assert!(h.handle.is_active("u2").await.unwrap());
    assert!(!h.handle.is_active("u3").await.unwrap());

    peer.push(&ServerEvent::PresenceUpdate(PresenceChange {
        user_id: "u2".into(),
        status: PresenceStatus::Busy,
        status_message: Some("in a meeting".into()),
        last_seen: None,
    }))
    .await;
    h.wait_for(|e| matches!(e, SyncEvent::PresenceChanged(_))).await;
    let record = h.handle.presence("u2").await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Busy);
    assert_eq!(record.status_message.as_deref(), Some("in a meeting"));
    assert!(!h.handle.is_active("u2").await.unwrap());
}

// ─── Lifecycle ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_logout_clears_session_state() {
    let h = start(vec![]);
    h.handle.load_conversations(vec![conversation("c1")]).await.unwrap();
    h.handle.send_message("c1", "unsent", None).await.unwrap();
    assert_eq!(h.handle.status().await.unwrap().queued, 1);

    h.handle.logout().await.unwrap();
    assert!(h.handle.queued_operations().await.unwrap().is_empty());
    assert!(h.handle.conversations().await.unwrap().is_empty());
    assert_eq!(h.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_engine() {
    let mut h = start(vec![]);
    h.handle.connect().await.unwrap();
    let mut peer = h.wait_connected().await;

    h.handle.shutdown().await.unwrap();
    // Channel closed from our side
    assert!(peer.next_raw().await.is_none());
    assert_eq!(h.handle.status().await, Err(SyncError::EngineStopped));
    assert_eq!(
        h.handle.send_message("c1", "late", None).await,
        Err(SyncError::EngineStopped)
    );
}

#[tokio::test(start_paused = true)]
async fn test_membership_events_are_not_queued() {
    let h = start(vec![]);
    let result = h
        .handle
        .send(ClientEvent::JoinConversation(ConversationRef {
            conversation_id: "c1".into(),
        }))
        .await;
    assert_eq!(result, Err(SyncError::NotQueueable("conversation:join")));
}
