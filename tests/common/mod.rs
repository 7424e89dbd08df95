//! Shared test utilities
//!
//! Fake audio devices and a fake realtime connector so the session can be
//! exercised without hardware or network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use voicedesk::live::{Connector, LiveConnection, Outbound, ServerEvent, SetupMessage};
use voicedesk::voice::{
    AudioBackend, CapturedFrame, ChunkId, FRAME_SIZE, InputStream, OutputSink, PcmPacket,
};
use voicedesk::{Error, Result};

/// Call recorded by [`FakeSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Start { id: ChunkId, at: f64, len: usize },
    Stop(ChunkId),
    Close,
}

/// Output sink with a manually advanced clock
#[derive(Clone, Default)]
pub struct FakeSink {
    pub clock: Arc<Mutex<f64>>,
    pub calls: Arc<Mutex<Vec<SinkCall>>>,
    /// Added to the next start, as when the device clock moves on between
    /// reading the time and starting the chunk
    pub start_delay: Arc<Mutex<Option<f64>>>,
}

impl FakeSink {
    pub fn set_time(&self, t: f64) {
        *self.clock.lock().unwrap() = t;
    }

    /// Make the next `start` begin `delay` seconds after the requested time
    pub fn delay_next_start(&self, delay: f64) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<(ChunkId, f64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Start { id, at, .. } => Some((id, at)),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<ChunkId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Stop(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl OutputSink for FakeSink {
    fn current_time(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn start(&mut self, id: ChunkId, samples: Vec<f32>, at: f64) -> Result<f64> {
        self.calls.lock().unwrap().push(SinkCall::Start {
            id,
            at,
            len: samples.len(),
        });
        let delay = self.start_delay.lock().unwrap().take().unwrap_or(0.0);
        Ok(at + delay)
    }

    fn stop(&mut self, id: ChunkId) -> Result<()> {
        self.calls.lock().unwrap().push(SinkCall::Stop(id));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(SinkCall::Close);
        Ok(())
    }
}

/// Microphone stand-in; counts stop calls
pub struct FakeInput {
    sample_rate: u32,
    stops: Arc<AtomicUsize>,
}

impl InputStream for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Audio backend handing out [`FakeSink`] and [`FakeInput`]
///
/// Clones share state, so a test keeps one clone and gives the other to
/// the controller.
#[derive(Clone)]
pub struct FakeAudio {
    pub sink: FakeSink,
    pub frames: Arc<Mutex<Option<mpsc::UnboundedSender<CapturedFrame>>>>,
    pub ended: Arc<Mutex<Option<mpsc::UnboundedSender<ChunkId>>>>,
    pub input_stops: Arc<AtomicUsize>,
    pub inputs_opened: Arc<AtomicUsize>,
    pub deny_input: bool,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self {
            sink: FakeSink::default(),
            frames: Arc::new(Mutex::new(None)),
            ended: Arc::new(Mutex::new(None)),
            input_stops: Arc::new(AtomicUsize::new(0)),
            inputs_opened: Arc::new(AtomicUsize::new(0)),
            deny_input: false,
        }
    }

    /// Backend whose microphone refuses to open
    pub fn denied() -> Self {
        Self {
            deny_input: true,
            ..Self::new()
        }
    }

    /// Push a frame as the device callback would
    pub fn push_frame(&self, frame: CapturedFrame) -> bool {
        self.frames
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Report a finished chunk as the device callback would
    pub fn finish_chunk(&self, id: ChunkId) -> bool {
        self.ended
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(id).is_ok())
    }

    pub fn input_stops(&self) -> usize {
        self.input_stops.load(Ordering::SeqCst)
    }

    pub fn output_closed(&self) -> bool {
        self.sink.calls().contains(&SinkCall::Close)
    }
}

impl AudioBackend for FakeAudio {
    fn open_output(&self, ended: mpsc::UnboundedSender<ChunkId>) -> Result<Box<dyn OutputSink>> {
        *self.ended.lock().unwrap() = Some(ended);
        Ok(Box::new(self.sink.clone()))
    }

    fn open_input(
        &self,
        frames: mpsc::UnboundedSender<CapturedFrame>,
    ) -> Result<Box<dyn InputStream>> {
        if self.deny_input {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        *self.frames.lock().unwrap() = Some(frames);
        Ok(Box::new(FakeInput {
            sample_rate: 48000,
            stops: Arc::clone(&self.input_stops),
        }))
    }
}

/// Audio queue capacity of fake sessions
pub const FAKE_AUDIO_CAPACITY: usize = 64;

/// Test side of an accepted session
pub struct RemoteEnd {
    /// Microphone frames the controller queued
    pub audio: mpsc::Receiver<PcmPacket>,
    /// Tool responses and close requests
    pub control: mpsc::UnboundedReceiver<Outbound>,
    /// Inject server events
    pub events: mpsc::Sender<ServerEvent>,
}

impl RemoteEnd {
    /// Drain everything sent so far, audio first
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(packet) = self.audio.try_recv() {
            out.push(Outbound::Audio(packet));
        }
        while let Ok(msg) = self.control.try_recv() {
            out.push(msg);
        }
        out
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    Hang,
    Reject,
}

/// Connector that completes, hangs or rejects the handshake
#[derive(Clone)]
pub struct FakeConnector {
    handshake: Handshake,
    pub remote: Arc<Mutex<Option<RemoteEnd>>>,
    pub setups: Arc<Mutex<Vec<SetupMessage>>>,
}

impl FakeConnector {
    pub fn new(handshake: Handshake) -> Self {
        Self {
            handshake,
            remote: Arc::new(Mutex::new(None)),
            setups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take the remote end of the last accepted session
    pub fn take_remote(&self) -> RemoteEnd {
        self.remote
            .lock()
            .unwrap()
            .take()
            .expect("no session was accepted")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, setup: SetupMessage) -> Result<LiveConnection> {
        self.setups.lock().unwrap().push(setup);

        match self.handshake {
            Handshake::Accept => {
                let (audio_tx, audio_rx) = mpsc::channel(FAKE_AUDIO_CAPACITY);
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                let (ev_tx, ev_rx) = mpsc::channel(64);
                *self.remote.lock().unwrap() = Some(RemoteEnd {
                    audio: audio_rx,
                    control: control_rx,
                    events: ev_tx,
                });
                Ok(LiveConnection {
                    audio: audio_tx,
                    control: control_tx,
                    events: ev_rx,
                })
            }
            Handshake::Hang => std::future::pending().await,
            Handshake::Reject => Err(Error::Transport("handshake rejected".to_string())),
        }
    }
}

/// A captured frame at 48kHz with the given volume
pub fn frame(volume: u8) -> CapturedFrame {
    CapturedFrame {
        samples: vec![0.25; FRAME_SIZE],
        sample_rate: 48000,
        volume,
    }
}

/// Base64 PCM16 of `len` samples at the given amplitude
pub fn encoded_chunk(len: usize, amplitude: f32) -> String {
    let pcm = voicedesk::voice::codec::float_to_pcm16(&vec![amplitude; len]);
    voicedesk::voice::codec::encode_base64(&pcm)
}
