//! Session controller
//!
//! Owns the microphone, the playback scheduler and the remote session
//! handle, and routes every event between them from a single task. Device
//! callbacks and transport tasks only push into channels; the controller
//! drains them in [`SessionController::process_next`].
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake--> Connected
//!      ^                        |                        |
//!      +------ disconnect ------+------------------------+
//!                               +--failure--> Error <----+
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::actions::{ActionEvent, dispatch};
use crate::config::Config;
use crate::live::{Connector, LiveConnection, Outbound, ServerEvent, build_setup_message};
use crate::voice::codec::build_outbound_packet;
use crate::voice::{
    AudioBackend, CapturedFrame, ChunkId, InputStream, MeterState, OUTPUT_SAMPLE_RATE, PcmPacket,
    PlaybackScheduler,
};
use crate::{Error, Result, prompt};

/// Lifecycle of the remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot published to observers on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Microphone volume (0..=255)
    pub volume: u8,
    pub is_agent_talking: bool,
}

impl SessionStatus {
    /// Meter inputs for this status
    #[must_use]
    pub fn meter(&self) -> MeterState {
        MeterState {
            is_active: self.state == ConnectionState::Connected,
            volume: self.volume,
            is_agent_talking: self.is_agent_talking,
        }
    }
}

/// User-facing controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    /// Connect when idle, disconnect otherwise
    Toggle,
    /// Disconnect and stop the event loop
    Shutdown,
}

type Handshake = BoxFuture<'static, Result<LiveConnection>>;

/// Coordinates capture, transport, playback and tool dispatch
pub struct SessionController {
    config: Config,
    connector: Arc<dyn Connector>,
    audio: Box<dyn AudioBackend>,
    actions: mpsc::UnboundedSender<ActionEvent>,
    status: watch::Sender<SessionStatus>,

    input: Option<Box<dyn InputStream>>,
    frames: Option<mpsc::UnboundedReceiver<CapturedFrame>>,
    playback: Option<PlaybackScheduler>,
    ended: Option<mpsc::UnboundedReceiver<ChunkId>>,
    handshake: Option<Handshake>,
    audio_out: Option<mpsc::Sender<PcmPacket>>,
    control: Option<mpsc::UnboundedSender<Outbound>>,
    events: Option<mpsc::Receiver<ServerEvent>>,
}

impl SessionController {
    /// Create a controller; produced actions are sent on `actions`
    #[must_use]
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        audio: Box<dyn AudioBackend>,
        actions: mpsc::UnboundedSender<ActionEvent>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            connector,
            audio,
            actions,
            status,
            input: None,
            frames: None,
            playback: None,
            ended: None,
            handshake: None,
            audio_out: None,
            control: None,
            events: None,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Acquire audio devices and start the remote handshake
    ///
    /// Accepted from `Disconnected` and, as an explicit reconnect, from
    /// `Error`. The handshake completes later in [`Self::process_next`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while connecting or connected, or
    /// the device error (e.g. [`Error::Permission`]) that moved the
    /// session to `Error`
    pub fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Err(Error::InvalidState(format!("cannot connect while {state}")));
        }

        self.release();
        self.set_state(ConnectionState::Connecting);
        tracing::info!(model = %self.config.live.model, voice = %self.config.live.voice, "connecting");

        if let Err(e) = self.acquire() {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    fn acquire(&mut self) -> Result<()> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let sink = self.audio.open_output(ended_tx)?;
        self.playback = Some(PlaybackScheduler::new(sink, OUTPUT_SAMPLE_RATE));
        self.ended = Some(ended_rx);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let input = self.audio.open_input(frames_tx)?;
        tracing::debug!(sample_rate = input.sample_rate(), "microphone open");
        self.input = Some(input);
        self.frames = Some(frames_rx);

        let instruction = prompt::system_instruction(&self.config.notifications.support_email);
        let setup = build_setup_message(&self.config.live, instruction);
        let connector = Arc::clone(&self.connector);
        self.handshake = Some(async move { connector.open(setup).await }.boxed());

        Ok(())
    }

    /// Tear everything down and return to `Disconnected`
    ///
    /// Valid from any state, including mid-handshake; calling it twice is a
    /// no-op the second time.
    pub fn disconnect(&mut self) {
        if self.state() != ConnectionState::Disconnected {
            tracing::info!(from = %self.state(), "disconnecting");
        }
        self.release();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Connect when idle or failed, otherwise disconnect
    pub fn toggle(&mut self) {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Error => {
                if let Err(e) = self.connect() {
                    tracing::warn!(error = %e, "connect failed");
                }
            }
            ConnectionState::Connecting | ConnectionState::Connected => self.disconnect(),
        }
    }

    fn fail(&mut self, error: &Error) {
        tracing::error!(error = %error, "session failed");
        self.release();
        self.set_state(ConnectionState::Error);
    }

    /// Release every resource; each step is attempted independently
    fn release(&mut self) {
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        self.ended = None;

        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.stop() {
                tracing::warn!(error = %e, "failed to stop microphone");
            }
        }
        self.frames = None;

        if self.handshake.take().is_some() {
            tracing::debug!("abandoned pending handshake");
        }

        self.audio_out = None;
        if let Some(control) = self.control.take() {
            if control.send(Outbound::Close).is_err() {
                tracing::debug!("transport already gone, close not queued");
            }
        }
        self.events = None;

        self.status.send_if_modified(|s| {
            let changed = s.volume != 0 || s.is_agent_talking;
            s.volume = 0;
            s.is_agent_talking = false;
            changed
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    fn set_talking(&self, talking: bool) {
        self.status.send_if_modified(|s| {
            let changed = s.is_agent_talking != talking;
            s.is_agent_talking = talking;
            changed
        });
    }

    /// Finish the handshake started by [`Self::connect`]
    pub fn handle_handshake(&mut self, result: Result<LiveConnection>) {
        self.handshake = None;

        if self.state() != ConnectionState::Connecting {
            if let Ok(conn) = result {
                tracing::debug!("late handshake, closing session");
                let _ = conn.control.send(Outbound::Close);
            }
            return;
        }

        match result {
            Ok(conn) => {
                self.audio_out = Some(conn.audio);
                self.control = Some(conn.control);
                self.events = Some(conn.events);
                self.set_state(ConnectionState::Connected);
                tracing::info!("session connected");
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Route one captured frame
    ///
    /// Updates the meter while capture is open; sends only while connected.
    pub fn handle_frame(&mut self, frame: CapturedFrame) {
        if self.input.is_none() {
            return;
        }

        self.status.send_if_modified(|s| {
            let changed = s.volume != frame.volume;
            s.volume = frame.volume;
            changed
        });

        if self.state() != ConnectionState::Connected {
            return;
        }
        let Some(audio_out) = &self.audio_out else {
            return;
        };

        let packet = match build_outbound_packet(&frame.samples, frame.sample_rate) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable frame");
                return;
            }
        };

        match audio_out.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("audio queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                self.fail(&Error::Transport("session closed while sending".to_string()));
            }
        }
    }

    /// Record that a playback chunk finished
    pub fn handle_chunk_ended(&mut self, id: ChunkId) {
        let Some(playback) = &mut self.playback else {
            return;
        };
        if playback.on_chunk_ended(id) {
            tracing::debug!("agent finished speaking");
            self.set_talking(false);
        }
    }

    /// Handle one event from the remote session
    pub fn handle_server_event(&mut self, event: ServerEvent) {
        if self.state() != ConnectionState::Connected {
            tracing::trace!(?event, "ignoring event outside a session");
            return;
        }

        match event {
            ServerEvent::SetupComplete => tracing::debug!("duplicate setupComplete"),
            ServerEvent::Audio(data) => {
                let scheduled = self
                    .playback
                    .as_mut()
                    .and_then(|playback| playback.enqueue_encoded(&data));
                if scheduled.is_some() {
                    self.set_talking(true);
                }
            }
            ServerEvent::Interrupted => {
                if let Some(playback) = &mut self.playback {
                    playback.interrupt();
                }
                self.set_talking(false);
            }
            ServerEvent::TurnComplete => tracing::debug!("turn complete"),
            ServerEvent::ToolCall(invocations) => {
                for invocation in invocations {
                    let dispatched = dispatch(&invocation, &self.config.notifications.support_email);
                    if let Some(event) = dispatched.event {
                        if self.actions.send(event).is_err() {
                            tracing::warn!("action receiver dropped");
                        }
                    }
                    if !self.send(Outbound::ToolResponse(vec![dispatched.response])) {
                        return;
                    }
                }
            }
            ServerEvent::Closed => {
                tracing::info!("remote closed session");
                self.disconnect();
            }
            ServerEvent::Error(message) => self.fail(&Error::Transport(message)),
        }
    }

    /// Queue a control message; only a closed transport fails the session
    fn send(&mut self, msg: Outbound) -> bool {
        let Some(control) = &self.control else {
            return false;
        };
        if control.send(msg).is_err() {
            self.fail(&Error::Transport("session closed while sending".to_string()));
            return false;
        }
        true
    }

    /// Wait for the next input and handle it
    ///
    /// Returns `false` once a shutdown was requested or the command channel
    /// closed.
    #[allow(clippy::future_not_send)]
    pub async fn process_next(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connect) => {
                    if let Err(e) = self.connect() {
                        tracing::warn!(error = %e, "connect rejected");
                    }
                }
                Some(Command::Disconnect) => self.disconnect(),
                Some(Command::Toggle) => self.toggle(),
                Some(Command::Shutdown) | None => {
                    self.disconnect();
                    return false;
                }
            },
            result = handshake(&mut self.handshake) => self.handle_handshake(result),
            frame = recv_opt(&mut self.frames) => match frame {
                Some(frame) => self.handle_frame(frame),
                None => self.frames = None,
            },
            id = recv_opt(&mut self.ended) => match id {
                Some(id) => self.handle_chunk_ended(id),
                None => self.ended = None,
            },
            event = recv_opt(&mut self.events) => match event {
                Some(event) => self.handle_server_event(event),
                None => self.handle_server_event(ServerEvent::Closed),
            },
        }
        true
    }

    /// Run until [`Command::Shutdown`] or the command channel closes
    #[allow(clippy::future_not_send)]
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while self.process_next(&mut commands).await {}
        tracing::debug!("session loop stopped");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.release();
    }
}

async fn handshake(pending: &mut Option<Handshake>) -> Result<LiveConnection> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Receivers the event loop can poll through an `Option`
trait Inbox<T> {
    fn poll_next_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>>;
}

impl<T> Inbox<T> for mpsc::Receiver<T> {
    fn poll_next_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.poll_recv(cx)
    }
}

impl<T> Inbox<T> for mpsc::UnboundedReceiver<T> {
    fn poll_next_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.poll_recv(cx)
    }
}

/// Receive from `rx`, or wait forever when there is no receiver
async fn recv_opt<T, R: Inbox<T>>(rx: &mut Option<R>) -> Option<T> {
    match rx {
        Some(rx) => std::future::poll_fn(|cx| rx.poll_next_item(cx)).await,
        None => std::future::pending().await,
    }
}
