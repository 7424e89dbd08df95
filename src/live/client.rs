//! WebSocket transport for the realtime session
//!
//! Opens the socket, sends the setup message on the unsplit stream, waits
//! for `setupComplete`, then splits into an outbound and an inbound task.
//! The server may deliver JSON in binary frames, so any binary frame that
//! starts with `{` is parsed as a message.
//!
//! The outbound task owns the session's lifetime: it sends a close frame
//! when asked to or when the controller drops its senders, and on exit it
//! stops the inbound task.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connector, LiveConnection, Outbound, ServerEvent, SetupMessage, parse_server_message};
use crate::config::LiveConfig;
use crate::voice::PcmPacket;
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the audio queue (about 30 s of 2048-sample frames at 48kHz)
const AUDIO_CAPACITY: usize = 256;

/// Capacity of the inbound event queue
const EVENT_CAPACITY: usize = 256;

/// Connects to the realtime endpoint over `tokio-tungstenite`
#[derive(Clone)]
pub struct WsConnector {
    endpoint: String,
    api_key: String,
    setup_timeout: Duration,
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("endpoint", &self.endpoint)
            .field("setup_timeout", &self.setup_timeout)
            .finish_non_exhaustive()
    }
}

impl WsConnector {
    /// Create a connector for `endpoint`, authenticating with `api_key`
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            setup_timeout: Duration::from_secs(15),
        }
    }

    /// Create a connector from session configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no API key is configured
    pub fn from_config(config: &LiveConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("no API key configured".to_string()))?;
        Ok(Self::new(config.endpoint.clone(), api_key).with_setup_timeout(config.setup_timeout))
    }

    /// Bound the wait for `setupComplete`
    #[must_use]
    pub const fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    fn url(&self) -> String {
        if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?key={}", self.endpoint, self.api_key)
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, setup: SetupMessage) -> Result<LiveConnection> {
        tracing::info!(
            endpoint = %self.endpoint,
            model = %setup.setup.model,
            "connecting to realtime session"
        );

        let (mut socket, _response) = tokio_tungstenite::connect_async(self.url())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect: {e}")))?;

        let setup_json = serde_json::to_string(&setup)?;
        socket
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| Error::Transport(format!("failed to send setup message: {e}")))?;

        tokio::time::timeout(self.setup_timeout, wait_for_setup(&mut socket))
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "setupComplete timeout ({}s)",
                    self.setup_timeout.as_secs()
                ))
            })??;

        tracing::info!("realtime session ready");

        let (sink, stream) = socket.split();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let queues = OutboundQueues {
            audio: audio_rx,
            control: control_rx,
        };
        drop(tokio::spawn(outbound_loop(
            queues,
            sink,
            event_tx.clone(),
            shutdown_tx,
        )));
        drop(tokio::spawn(inbound_loop(stream, event_tx, shutdown_rx)));

        Ok(LiveConnection {
            audio: audio_tx,
            control: control_tx,
            events: event_rx,
        })
    }
}

/// Extract JSON text from a frame, if it carries any
fn frame_text(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

async fn wait_for_setup(socket: &mut Socket) -> Result<()> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| Error::Transport(format!("error before setupComplete: {e}")))?;

        if let WsMessage::Close(frame) = &msg {
            return Err(Error::Transport(format!(
                "connection closed before setupComplete: {frame:?}"
            )));
        }

        let Some(text) = frame_text(&msg) else {
            tracing::debug!("setup phase: skipping non-JSON frame");
            continue;
        };

        for event in parse_server_message(text)? {
            match event {
                ServerEvent::SetupComplete => return Ok(()),
                ServerEvent::Error(message) => {
                    return Err(Error::Transport(format!("setup rejected: {message}")));
                }
                other => tracing::debug!(event = ?other, "setup phase: ignoring event"),
            }
        }
    }

    Err(Error::Transport("stream ended before setupComplete".to_string()))
}

struct OutboundQueues {
    audio: mpsc::Receiver<PcmPacket>,
    control: mpsc::UnboundedReceiver<Outbound>,
}

impl OutboundQueues {
    /// Next message to send, control first
    ///
    /// A closed control queue means the controller let go of the session,
    /// which is treated as a close request.
    async fn next(&mut self) -> Outbound {
        tokio::select! {
            biased;
            msg = self.control.recv() => msg.unwrap_or(Outbound::Close),
            Some(packet) = self.audio.recv() => Outbound::Audio(packet),
        }
    }
}

/// Drain the queues into the socket until closed
///
/// Dropping `_shutdown` on return stops the inbound loop.
async fn outbound_loop(
    mut queues: OutboundQueues,
    mut sink: SplitSink<Socket, WsMessage>,
    events: mpsc::Sender<ServerEvent>,
    _shutdown: oneshot::Sender<()>,
) {
    let mut audio_chunks: u64 = 0;

    loop {
        let msg = queues.next().await;
        if matches!(msg, Outbound::Audio(_)) {
            audio_chunks += 1;
            if audio_chunks == 1 || audio_chunks.is_multiple_of(50) {
                tracing::debug!(chunk = audio_chunks, "sending audio");
            }
        }

        let json = match msg.to_json() {
            Ok(Some(json)) => json,
            Ok(None) => {
                if let Err(e) = sink.send(WsMessage::Close(None)).await {
                    tracing::debug!(error = %e, "close frame not delivered");
                }
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound message");
                continue;
            }
        };

        if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
            tracing::warn!(error = %e, "websocket send failed, closing outbound loop");
            // receiver may already be gone after teardown
            let _ = events.send(ServerEvent::Error(format!("send failed: {e}"))).await;
            break;
        }
    }

    tracing::debug!(audio_chunks, "outbound loop terminated");
}

async fn inbound_loop(
    mut stream: SplitStream<Socket>,
    events: mpsc::Sender<ServerEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = &mut shutdown => {
                tracing::debug!("session closed locally, stopping inbound loop");
                return;
            }
        };
        let Some(msg) = next else {
            break;
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                let _ = events.send(ServerEvent::Error(format!("receive failed: {e}"))).await;
                return;
            }
        };

        if let WsMessage::Close(frame) = &msg {
            tracing::info!(frame = ?frame, "remote closed session");
            let _ = events.send(ServerEvent::Closed).await;
            return;
        }

        let Some(text) = frame_text(&msg) else {
            continue;
        };

        let parsed = match parse_server_message(text) {
            Ok(parsed) => parsed,
            Err(e) => vec![ServerEvent::Error(format!("malformed server message: {e}"))],
        };

        for event in parsed {
            if events.send(event).await.is_err() {
                tracing::debug!("event receiver dropped, stopping inbound loop");
                return;
            }
        }
    }

    let _ = events.send(ServerEvent::Closed).await;
}
