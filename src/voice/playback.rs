//! Gapless playback of streamed model audio
//!
//! Chunks arrive independently but must sound like one utterance. The
//! [`PlaybackScheduler`] keeps a single cursor on the output clock: each
//! chunk starts at the later of "now" and the end of the previous chunk.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::codec::{OUTPUT_SAMPLE_RATE, decode_base64, pcm16_to_float};
use crate::{Error, Result};

/// Identifier of a scheduled playback chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Output device seam: a clock plus start/stop of individual chunks
///
/// Implementations report finished chunks out of band (the cpal speaker
/// uses a channel); the scheduler learns about them through
/// [`PlaybackScheduler::on_chunk_ended`].
pub trait OutputSink {
    /// Current position of the output clock in seconds
    fn current_time(&self) -> f64;

    /// Start playing `samples` at clock time `at`
    ///
    /// Returns the start time actually used, which is later than `at` when
    /// the clock moved past it.
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects the chunk
    fn start(&mut self, id: ChunkId, samples: Vec<f32>, at: f64) -> Result<f64>;

    /// Stop a chunk immediately, discarding its remaining audio
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot stop the chunk
    fn stop(&mut self, id: ChunkId) -> Result<()>;

    /// Release the output device
    ///
    /// # Errors
    ///
    /// Returns error if the device fails to close
    fn close(&mut self) -> Result<()>;
}

/// A chunk accepted by the scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Chunk identifier
    pub id: ChunkId,
    /// Start time on the output clock (seconds)
    pub start: f64,
    /// Duration (seconds)
    pub duration: f64,
}

/// Schedules decoded chunks back to back on the output clock
pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    sample_rate: u32,
    next_start: f64,
    active: BTreeSet<ChunkId>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// Create a scheduler over an output sink
    #[must_use]
    pub fn new(sink: Box<dyn OutputSink>, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            next_start: 0.0,
            active: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// Schedule mono samples at [`Self::sample_rate`]
    ///
    /// # Errors
    ///
    /// Returns error if the sink rejects the chunk; the cursor is left
    /// unchanged in that case
    #[allow(clippy::cast_precision_loss)]
    pub fn schedule(&mut self, samples: Vec<f32>) -> Result<ScheduledChunk> {
        let now = self.sink.current_time();
        let requested = self.next_start.max(now);
        let duration = samples.len() as f64 / f64::from(self.sample_rate);

        self.next_id += 1;
        let id = ChunkId(self.next_id);

        // the sink may have moved the start if its clock advanced meanwhile
        let start = self.sink.start(id, samples, requested)?;
        self.active.insert(id);
        self.next_start = start + duration;

        tracing::trace!(%id, start, duration, active = self.active.len(), "chunk scheduled");

        Ok(ScheduledChunk {
            id,
            start,
            duration,
        })
    }

    /// Decode a base64 PCM16 mono chunk and schedule it
    ///
    /// Decode or device failures drop this chunk only; the scheduler keeps
    /// running.
    pub fn enqueue_encoded(&mut self, data: &str) -> Option<ScheduledChunk> {
        let bytes = match decode_base64(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable audio chunk");
                return None;
            }
        };

        let samples = pcm16_to_float(&bytes, 1).into_iter().next().unwrap_or_default();
        if samples.is_empty() {
            tracing::debug!("skipping empty audio chunk");
            return None;
        }

        match self.schedule(samples) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                tracing::warn!(error = %e, "failed to schedule audio chunk");
                None
            }
        }
    }

    /// Record that a chunk finished playing
    ///
    /// Returns `true` when this was the last active chunk, i.e. the agent
    /// finished speaking. Unknown IDs (already stopped) return `false`.
    pub fn on_chunk_ended(&mut self, id: ChunkId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// Stop every active chunk and reset the cursor (user barge-in)
    ///
    /// Returns the number of chunks that were cut off.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active) {
            if let Err(e) = self.sink.stop(id) {
                tracing::warn!(%id, error = %e, "failed to stop chunk");
            }
        }
        self.next_start = 0.0;

        if stopped > 0 {
            tracing::debug!(stopped, "playback interrupted");
        }
        stopped
    }

    /// Stop all chunks and release the output device
    pub fn close(&mut self) {
        self.interrupt();
        if let Err(e) = self.sink.close() {
            tracing::warn!(error = %e, "failed to close audio output");
        }
    }

    /// Whether any chunk is scheduled or playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    /// Number of chunks in the active set
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Clock time at which the next chunk would start if "now" is earlier
    #[must_use]
    pub const fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Current output clock time
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.sink.current_time()
    }

    /// Sample rate chunks are interpreted at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Sample-accurate mixer whose rendered frame count is the output clock
///
/// Voices are positioned in frames of the source rate. When the device runs
/// at a different rate, each output frame reads the mix at a fractional
/// source position with linear interpolation.
#[derive(Debug)]
pub struct Mixer {
    sample_rate: u32,
    device_rate: u32,
    /// Device frames rendered so far
    rendered: u64,
    voices: Vec<Voice>,
}

#[derive(Debug)]
struct Voice {
    id: ChunkId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample_at(&self, frame: u64) -> f32 {
        if frame >= self.start_frame && frame < self.end_frame() {
            self.samples[(frame - self.start_frame) as usize]
        } else {
            0.0
        }
    }
}

impl Mixer {
    /// Create an empty mixer whose device runs at the source rate
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self::with_device_rate(sample_rate, sample_rate)
    }

    /// Create an empty mixer for `sample_rate` audio on a `device_rate` device
    #[must_use]
    pub const fn with_device_rate(sample_rate: u32, device_rate: u32) -> Self {
        Self {
            sample_rate,
            device_rate,
            rendered: 0,
            voices: Vec::new(),
        }
    }

    /// Playback position in source frames
    fn position(&self) -> f64 {
        self.source_position(self.rendered)
    }

    #[allow(clippy::cast_precision_loss)]
    fn source_position(&self, device_frame: u64) -> f64 {
        if self.sample_rate == self.device_rate {
            device_frame as f64
        } else {
            device_frame as f64 * f64::from(self.sample_rate) / f64::from(self.device_rate.max(1))
        }
    }

    /// Seconds of audio rendered so far
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.position() / f64::from(self.sample_rate)
    }

    /// Add a voice starting at clock time `at`
    ///
    /// Returns the start time actually used: a time already rendered is
    /// moved to the next unrendered frame.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn add(&mut self, id: ChunkId, samples: Vec<f32>, at: f64) -> f64 {
        let rate = f64::from(self.sample_rate);
        let requested = (at.max(0.0) * rate).round() as u64;
        let start_frame = requested.max(self.position().ceil() as u64);
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        start_frame as f64 / rate
    }

    /// Remove a voice; returns whether it was present
    pub fn remove(&mut self, id: ChunkId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Remove every voice
    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Number of voices not yet finished
    #[must_use]
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    fn mix_at(&self, frame: u64) -> f32 {
        self.voices
            .iter()
            .map(|v| v.sample_at(frame))
            .sum::<f32>()
            .clamp(-1.0, 1.0)
    }

    /// Render interleaved output and advance the clock
    ///
    /// Returns the chunks that finished within this block.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<ChunkId> {
        let channels = channels.max(1);

        for (offset, frame) in out.chunks_mut(channels).enumerate() {
            let position = self.source_position(self.rendered + offset as u64);
            let index = position.floor();
            let frac = (position - index) as f32;
            let index = index as u64;

            let current = self.mix_at(index);
            let sample = if frac > 0.0 {
                frac.mul_add(self.mix_at(index + 1) - current, current)
            } else {
                current
            };
            frame.fill(sample);
        }

        self.rendered += (out.len() / channels) as u64;

        let played = self.position().floor() as u64;
        let mut finished = Vec::new();
        self.voices.retain(|v| {
            if v.end_frame() <= played {
                finished.push(v.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Render one device block and report finished chunks
fn render_block(
    mixer: &Mutex<Mixer>,
    data: &mut [f32],
    channels: usize,
    ended: &mpsc::UnboundedSender<ChunkId>,
) {
    let finished = match mixer.lock() {
        Ok(mut mixer) => mixer.render(data, channels),
        Err(_) => {
            data.fill(0.0);
            return;
        }
    };
    for id in finished {
        // Receiver gone means the session is tearing down
        let _ = ended.send(id);
    }
}

/// Plays scheduled chunks on the default output device
pub struct Speaker {
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<Stream>,
}

impl Speaker {
    /// Open the default output device in its default configuration
    ///
    /// Model audio is resampled to the device rate while mixing. Finished
    /// chunks are reported on `ended`.
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available or its sample format
    /// is unsupported
    pub fn open(ended: mpsc::UnboundedSender<ChunkId>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;

        let device_rate = supported.sample_rate().0;
        let channels = usize::from(supported.channels()).max(1);
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();

        let mixer = Arc::new(Mutex::new(Mixer::with_device_rate(
            OUTPUT_SAMPLE_RATE,
            device_rate,
        )));
        let mixer_cb = Arc::clone(&mixer);

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render_block(&mixer_cb, data, channels, &ended);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        render_block(&mixer_cb, &mut scratch, channels, &ended);
                        for (out, sample) in data.iter_mut().zip(&scratch) {
                            #[allow(clippy::cast_possible_truncation)]
                            let value = (sample * 32767.0) as i16;
                            *out = value;
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
            }
            other => {
                return Err(Error::Audio(format!(
                    "unsupported output sample format: {other:?}"
                )));
            }
        }
        .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = OUTPUT_SAMPLE_RATE,
            device_rate,
            channels,
            "audio playback initialized"
        );

        Ok(Self {
            mixer,
            stream: Some(stream),
        })
    }
}

impl OutputSink for Speaker {
    fn current_time(&self) -> f64 {
        self.mixer.lock().map(|m| m.current_time()).unwrap_or(0.0)
    }

    fn start(&mut self, id: ChunkId, samples: Vec<f32>, at: f64) -> Result<f64> {
        if self.stream.is_none() {
            return Err(Error::Audio("output closed".to_string()));
        }
        let start = self
            .mixer
            .lock()
            .map_err(|_| Error::Audio("mixer lock poisoned".to_string()))?
            .add(id, samples, at);
        Ok(start)
    }

    fn stop(&mut self, id: ChunkId) -> Result<()> {
        self.mixer
            .lock()
            .map_err(|_| Error::Audio("mixer lock poisoned".to_string()))?
            .remove(id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!(error = %e, "failed to pause output before close");
            }
            drop(stream);
            tracing::debug!("audio playback closed");
        }
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.clear();
        }
        Ok(())
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixer_plays_voice_at_start_frame() {
        let mut mixer = Mixer::new(10);
        mixer.add(ChunkId(1), vec![0.5, 0.5], 0.2);

        let mut out = vec![0.0; 4];
        let finished = mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert_eq!(finished, vec![ChunkId(1)]);
        assert!((mixer.current_time() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn mixer_duplicates_into_all_channels() {
        let mut mixer = Mixer::new(10);
        mixer.add(ChunkId(1), vec![0.25], 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn mixer_reports_end_only_when_fully_rendered() {
        let mut mixer = Mixer::new(10);
        mixer.add(ChunkId(7), vec![0.1; 5], 0.0);

        let mut out = vec![0.0; 3];
        assert!(mixer.render(&mut out, 1).is_empty());
        assert_eq!(mixer.voice_count(), 1);
        assert_eq!(mixer.render(&mut out, 1), vec![ChunkId(7)]);
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn mixer_late_voice_starts_now() {
        let mut mixer = Mixer::new(10);
        let mut out = vec![0.0; 5];
        mixer.render(&mut out, 1);

        // Requested in the past: plays from the current frame
        mixer.add(ChunkId(2), vec![0.3, 0.3], 0.1);
        let finished = mixer.render(&mut out, 1);
        assert_eq!(&out[..2], &[0.3, 0.3]);
        assert_eq!(finished, vec![ChunkId(2)]);
    }

    #[test]
    fn mixer_add_returns_clamped_start() {
        let mut mixer = Mixer::new(10);
        assert!((mixer.add(ChunkId(1), vec![0.1], 0.3) - 0.3).abs() < 1e-9);

        let mut out = vec![0.0; 5];
        mixer.render(&mut out, 1);
        assert!((mixer.add(ChunkId(2), vec![0.1], 0.2) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn mixer_resamples_to_device_rate() {
        let mut mixer = Mixer::with_device_rate(24_000, 48_000);
        mixer.add(ChunkId(1), vec![0.0, 1.0, 1.0, 0.0], 0.0);

        let mut out = vec![0.0; 8];
        let finished = mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0, 1.0, 0.5, 0.0, 0.0]);
        assert_eq!(finished, vec![ChunkId(1)]);
        assert!((mixer.current_time() - 4.0 / 24_000.0).abs() < 1e-12);
    }

    #[test]
    fn mixer_on_slower_device_keeps_source_clock() {
        let mut mixer = Mixer::with_device_rate(20, 10);
        mixer.add(ChunkId(1), vec![0.2; 4], 0.0);

        let mut out = vec![0.0; 2];
        assert_eq!(mixer.render(&mut out, 1), vec![ChunkId(1)]);
        assert!((mixer.current_time() - 0.2).abs() < 1e-12);

        // the next voice cannot start inside audio already rendered
        assert!((mixer.add(ChunkId(2), vec![0.2], 0.05) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn mixer_removed_voice_is_silent_and_not_reported() {
        let mut mixer = Mixer::new(10);
        mixer.add(ChunkId(3), vec![0.9; 4], 0.0);
        assert!(mixer.remove(ChunkId(3)));

        let mut out = vec![1.0; 4];
        assert!(mixer.render(&mut out, 1).is_empty());
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn mixer_clamps_overlapping_voices() {
        let mut mixer = Mixer::new(10);
        mixer.add(ChunkId(1), vec![0.8], 0.0);
        mixer.add(ChunkId(2), vec![0.8], 0.0);

        let mut out = vec![0.0; 1];
        mixer.render(&mut out, 1);
        assert!((out[0] - 1.0).abs() < f32::EPSILON);
    }
}
