//! parley — terminal client for the Parley real-time sync engine.
//!
//! Connects with a bearer credential, opens one conversation, prints every
//! engine event and posts each stdin line as a message. Lines starting with
//! `/` are commands:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `/typing` | send `typing:start` |
//! | `/status online\|away\|busy\|offline [message]` | update own presence |
//! | `/react <message-id> <emoji>` | add a reaction |
//! | `/alert <title>` | broadcast a test alert |
//! | `/ack <alert-id>` | acknowledge a test alert |
//! | `/reconnect` | reconnect now |
//! | `/quit` | shut down |

use clap::Parser;
use log::info;
use parley_sync::{
    resolve_endpoint, EngineConfig, EngineHandle, NoRefresh, PresenceStatus, SyncEngine,
    SyncEvent, WsTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal client for Parley real-time sync")]
struct Args {
    /// WebSocket endpoint; defaults to $PARLEY_SOCKET_URL, then ws://localhost:3001
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer credential
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: String,

    /// Id of the signed-in user
    #[arg(long)]
    user: String,

    /// Conversation to open and post into
    #[arg(long)]
    conversation: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig::with_endpoint(resolve_endpoint(args.endpoint.as_deref()));
    info!("Using endpoint {}", config.endpoint);

    let (engine, handle, mut events) =
        SyncEngine::new(config, args.user, args.token, WsTransport::new(), NoRefresh);
    let engine_task = engine.spawn();

    handle.open_conversation(args.conversation.clone()).await?;
    handle.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_line(&handle, &args.conversation, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await?;
    engine_task.await?;
    Ok(())
}

/// Handle one input line. Returns `false` to quit.
async fn run_line(
    handle: &EngineHandle,
    conversation: &str,
    line: &str,
) -> Result<bool, Box<dyn std::error::Error>> {
    if line.is_empty() {
        return Ok(true);
    }
    let Some(command) = line.strip_prefix('/') else {
        let delivery = handle.send_message(conversation, line, None).await?;
        info!("Message {:?}", delivery);
        return Ok(true);
    };

    let mut words = command.splitn(2, ' ');
    let name = words.next().unwrap_or_default();
    let rest = words.next().unwrap_or_default().trim();
    match name {
        "quit" | "exit" => return Ok(false),
        "typing" => {
            handle.start_typing(conversation).await?;
        }
        "status" => {
            let mut parts = rest.splitn(2, ' ');
            let status = match parts.next().unwrap_or_default() {
                "online" => PresenceStatus::Online,
                "away" => PresenceStatus::Away,
                "busy" => PresenceStatus::Busy,
                "offline" => PresenceStatus::Offline,
                other => {
                    eprintln!("unknown status {other:?}");
                    return Ok(true);
                }
            };
            let message = parts.next().map(str::to_string).filter(|m| !m.is_empty());
            handle.update_presence(status, message).await?;
        }
        "react" => match rest.split_once(' ') {
            Some((message_id, emoji)) => {
                handle.add_reaction(message_id, emoji.trim()).await?;
            }
            None => eprintln!("usage: /react <message-id> <emoji>"),
        },
        "alert" => {
            handle.send_test_alert(rest, "Test alert from the terminal client").await?;
        }
        "ack" => {
            handle.acknowledge_alert(rest).await?;
        }
        "reconnect" => handle.reconnect().await?,
        other => eprintln!("unknown command /{other}"),
    }
    Ok(true)
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Connected => println!("* connected"),
        SyncEvent::Disconnected { reason } => println!("* disconnected: {reason}"),
        SyncEvent::ReconnectScheduled {
            attempt,
            delay,
            throttled,
        } => {
            let note = if *throttled { " (rate limited)" } else { "" };
            println!("* reconnecting in {delay:.1?} after attempt {attempt}{note}");
        }
        SyncEvent::AuthenticationFailed { reason } => {
            println!("* authentication failed: {reason}; restart with a new token");
        }
        SyncEvent::ReplayFailed { operation, reason } => {
            println!("* dropped queued {}: {reason}", operation.event.name());
        }
        SyncEvent::QueueFlushed { sent } => println!("* sent {sent} queued operations"),
        SyncEvent::MessageReceived(message) => {
            let sender = message.sender_name.as_deref().unwrap_or(&message.sender_id);
            println!("[{}] {}: {}", message.conversation_id, sender, message.content);
        }
        SyncEvent::MessageChanged {
            conversation_id,
            message_id,
        } => println!("[{conversation_id}] message {message_id} changed"),
        SyncEvent::ConversationsChanged => {}
        SyncEvent::UnknownConversation(id) => println!("* new conversation {id}"),
        SyncEvent::IncomingMessage(notice) => {
            if notice.banner {
                let sender = notice.sender_name.as_deref().unwrap_or(&notice.sender_id);
                println!("! {} in {}: {}", sender, notice.conversation_id, notice.preview);
            }
            if notice.sound {
                print!("\x07");
            }
        }
        SyncEvent::PresenceChanged(users) => println!("* presence: {}", users.join(", ")),
        SyncEvent::TypingChanged { conversation_id } => {
            println!("* typing changed in {conversation_id}");
        }
        SyncEvent::Notification(notification) => {
            println!("! {}", notification.title);
        }
        SyncEvent::TestAlert(alert) => {
            println!("! TEST ALERT {}: {} ({})", alert.id, alert.title, alert.body);
        }
        SyncEvent::TestAlertCleared { id } => println!("* test alert {id} cleared"),
    }
}
