//! Bidirectional text channel to the sync server.
//!
//! The engine never touches a socket directly. A [`Transport`] opens a
//! [`Channel`]: a pair of queues fed by background reader/writer tasks.
//!
//! ```text
//!  SyncEngine ──send()──► outgoing (unbounded) ──► writer task ──► WebSocket
//!  SyncEngine ◄─recv()─── incoming (bounded)   ◄── reader task ◄── WebSocket
//! ```
//!
//! Outgoing sends are synchronous so the offline queue can be flushed in
//! one uninterrupted pass. Dropping a `Channel` stops the reader at once;
//! the writer drains what was already handed to it and then closes the
//! socket.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::error::OpenError;
use crate::protocol::{ClientEvent, ServerEvent};

/// Inbound frame buffer per channel.
const INCOMING_CAPACITY: usize = 256;

/// Something received on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    /// The peer closed the channel or the socket failed.
    Closed(Option<String>),
}

/// The outgoing side has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

/// An open channel to the server.
pub struct Channel {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::Receiver<ChannelFrame>,
    reader: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::Receiver<ChannelFrame>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            reader: None,
        }
    }

    /// Attach the task feeding `incoming`; it is aborted when the channel drops.
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// An in-process channel and the server end of it.
    pub fn in_memory() -> (Channel, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INCOMING_CAPACITY);
        (
            Channel::new(out_tx, in_rx),
            ChannelPeer {
                sent: out_rx,
                inbound: in_tx,
            },
        )
    }

    pub fn send(&self, text: String) -> Result<(), ChannelClosed> {
        self.outgoing.send(text).map_err(|_| ChannelClosed)
    }

    /// Next frame. A channel whose feeder has gone away reports `Closed`.
    pub async fn recv(&mut self) -> ChannelFrame {
        self.incoming
            .recv()
            .await
            .unwrap_or(ChannelFrame::Closed(None))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("open", &!self.outgoing.is_closed())
            .finish()
    }
}

/// Server end of an in-memory channel.
#[derive(Debug)]
pub struct ChannelPeer {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::Sender<ChannelFrame>,
}

impl ChannelPeer {
    /// Deliver a server event to the client.
    pub async fn push(&self, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(text) => self.push_raw(text).await,
            Err(_) => false,
        }
    }

    pub async fn push_raw(&self, text: impl Into<String>) -> bool {
        self.inbound.send(ChannelFrame::Text(text.into())).await.is_ok()
    }

    /// Close from the server side.
    pub async fn close(&self, reason: Option<&str>) -> bool {
        self.inbound
            .send(ChannelFrame::Closed(reason.map(str::to_string)))
            .await
            .is_ok()
    }

    /// Next raw frame the client sent. `None` once the client dropped the channel.
    pub async fn next_raw(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Next decodable event the client sent.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            let text = self.sent.recv().await?;
            if let Ok(event) = ClientEvent::decode(&text) {
                return Some(event);
            }
        }
    }

    /// Everything sent so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            if let Ok(event) = ClientEvent::decode(&text) {
                events.push(event);
            }
        }
        events
    }
}

/// Opens channels to an endpoint.
pub trait Transport: Send + 'static {
    /// Start dialing. The future must not borrow from `self`; dropping it
    /// abandons the dial.
    fn open(
        &mut self,
        endpoint: &str,
        credential: &str,
    ) -> BoxFuture<'static, Result<Channel, OpenError>>;
}

// ─── WebSocket transport ───────────────────────────────────

/// tokio-tungstenite transport. The credential travels in the
/// `Authorization: Bearer` header of the upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(
        &mut self,
        endpoint: &str,
        credential: &str,
    ) -> BoxFuture<'static, Result<Channel, OpenError>> {
        let endpoint = endpoint.to_owned();
        let credential = credential.to_owned();
        async move { dial(&endpoint, &credential).await }.boxed()
    }
}

async fn dial(endpoint: &str, credential: &str) -> Result<Channel, OpenError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| OpenError::Network(format!("Invalid endpoint {endpoint}: {e}")))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
        .map_err(|_| OpenError::Unauthorized("Credential is not a valid header value".into()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(classify)?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    // Writer task: forward outgoing queue to the socket
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = ws_writer.send(WsMessage::Text(text.into())).await {
                log::debug!("Channel writer stopped: {}", e);
                return;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: forward text frames, report the close reason last
    let (in_tx, in_rx) = mpsc::channel(INCOMING_CAPACITY);
    let reader = tokio::spawn(async move {
        let reason = loop {
            match ws_reader.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = ChannelFrame::Text(text.as_str().to_owned());
                    if in_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map(|f| f.reason.as_str().to_owned());
                }
                // Binary frames are not part of the protocol; control
                // frames are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            }
        };
        let _ = in_tx.send(ChannelFrame::Closed(reason)).await;
    });

    Ok(Channel::new(out_tx, in_rx).with_reader(reader))
}

fn classify(err: WsError) -> OpenError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                OpenError::Unauthorized(format!("HTTP {status}"))
            } else {
                OpenError::Network(format!("HTTP {status}"))
            }
        }
        other => OpenError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientEvent;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let (mut channel, mut peer) = Channel::in_memory();
        channel.send(ClientEvent::Ping.encode().unwrap()).unwrap();
        assert_eq!(peer.next_event().await, Some(ClientEvent::Ping));

        assert!(peer.push(&ServerEvent::Pong).await);
        let frame = channel.recv().await;
        assert_eq!(frame, ChannelFrame::Text(ServerEvent::Pong.encode().unwrap()));
    }

    #[tokio::test]
    async fn test_peer_gone_reads_as_closed() {
        let (mut channel, peer) = Channel::in_memory();
        drop(peer);
        assert_eq!(channel.recv().await, ChannelFrame::Closed(None));
        assert_eq!(channel.send("x".into()), Err(ChannelClosed));
    }

    #[tokio::test]
    async fn test_dropping_channel_ends_peer_stream() {
        let (channel, mut peer) = Channel::in_memory();
        channel.send("{\"event\":\"ping\"}".into()).unwrap();
        drop(channel);
        assert!(peer.next_raw().await.is_some());
        assert!(peer.next_raw().await.is_none());
    }
}
