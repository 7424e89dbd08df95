//! Voice processing module
//!
//! Handles microphone capture, the PCM codec, gapless playback and the
//! visual meter. Device access goes through [`AudioBackend`] so the session
//! can run against real hardware or test doubles.

mod capture;
pub mod codec;
pub mod meter;
mod playback;

use tokio::sync::mpsc;

pub use capture::{
    CapturePipeline, CapturedFrame, FRAME_SIZE, INPUT_GAIN, InputStream, Microphone,
    VolumeAnalyser, samples_to_wav,
};
pub use codec::{INPUT_MIME_TYPE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, PcmPacket};
pub use meter::MeterState;
pub use playback::{ChunkId, Mixer, OutputSink, PlaybackScheduler, ScheduledChunk, Speaker};

use crate::Result;

/// Opens the microphone and speaker for one session
pub trait AudioBackend {
    /// Open the output device; finished chunks are reported on `ended`
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened
    fn open_output(&self, ended: mpsc::UnboundedSender<ChunkId>) -> Result<Box<dyn OutputSink>>;

    /// Open the microphone; frames are delivered on `frames`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Permission`] if the device is missing or denied
    fn open_input(
        &self,
        frames: mpsc::UnboundedSender<CapturedFrame>,
    ) -> Result<Box<dyn InputStream>>;
}

/// Default host devices via cpal
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_output(&self, ended: mpsc::UnboundedSender<ChunkId>) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(Speaker::open(ended)?))
    }

    fn open_input(
        &self,
        frames: mpsc::UnboundedSender<CapturedFrame>,
    ) -> Result<Box<dyn InputStream>> {
        Ok(Box::new(Microphone::open(frames)?))
    }
}
