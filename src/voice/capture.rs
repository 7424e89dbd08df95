//! Audio capture from microphone
//!
//! Device callbacks feed a [`CapturePipeline`] that applies gain, measures
//! volume and cuts the stream into fixed-size frames.

use std::f32::consts::PI;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::codec::INPUT_SAMPLE_RATE;
use crate::{Error, Result};

/// Samples per captured frame
pub const FRAME_SIZE: usize = 2048;

/// Fixed linear boost applied before analysis and encoding
pub const INPUT_GAIN: f32 = 1.5;

/// Analyser window length (matches a 32-point FFT)
const FFT_SIZE: usize = 32;

/// Number of frequency bins produced by the analyser
const BIN_COUNT: usize = FFT_SIZE / 2;

/// Time smoothing between successive analyser reads
const SMOOTHING: f32 = 0.8;

/// Decibel range mapped onto 0..=255
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

/// One fixed-size block of microphone audio
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Gain-adjusted mono samples
    pub samples: Vec<f32>,
    /// Device sample rate
    pub sample_rate: u32,
    /// Volume estimate for the meter (0..=255)
    pub volume: u8,
}

/// Live microphone stream owned by the session
pub trait InputStream {
    /// Device sample rate
    fn sample_rate(&self) -> u32;

    /// Stop the device; no frames are produced afterwards
    ///
    /// # Errors
    ///
    /// Returns error if the device fails to stop
    fn stop(&mut self) -> Result<()>;
}

/// Frequency-domain volume estimate
///
/// Keeps the most recent 32 samples, applies a Blackman window, computes 16
/// magnitude bins with time smoothing and maps them from decibels onto
/// bytes. [`Self::level`] is the mean of those bytes.
#[derive(Debug, Clone)]
pub struct VolumeAnalyser {
    window: [f32; FFT_SIZE],
    smoothed: [f32; BIN_COUNT],
}

impl Default for VolumeAnalyser {
    fn default() -> Self {
        Self {
            window: [0.0; FFT_SIZE],
            smoothed: [0.0; BIN_COUNT],
        }
    }
}

impl VolumeAnalyser {
    /// Feed samples; only the trailing window is retained
    pub fn push(&mut self, samples: &[f32]) {
        if samples.len() >= FFT_SIZE {
            self.window
                .copy_from_slice(&samples[samples.len() - FFT_SIZE..]);
        } else {
            self.window.rotate_left(samples.len());
            self.window[FFT_SIZE - samples.len()..].copy_from_slice(samples);
        }
    }

    /// Byte-scaled magnitude per frequency bin
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn frequency_bytes(&mut self) -> [u8; BIN_COUNT] {
        let n = FFT_SIZE as f32;
        let mut windowed = [0.0f32; FFT_SIZE];
        for (i, (out, sample)) in windowed.iter_mut().zip(self.window.iter()).enumerate() {
            let x = i as f32 / n;
            let blackman = 0.08f32.mul_add(
                (4.0 * PI * x).cos(),
                0.5f32.mul_add(-(2.0 * PI * x).cos(), 0.42),
            );
            *out = sample * blackman;
        }

        let mut bytes = [0u8; BIN_COUNT];
        for (k, byte) in bytes.iter_mut().enumerate() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, sample) in windowed.iter().enumerate() {
                let angle = 2.0 * PI * (k * i) as f32 / n;
                re += sample * angle.cos();
                im -= sample * angle.sin();
            }
            let magnitude = re.hypot(im) / n;

            let smoothed = SMOOTHING.mul_add(self.smoothed[k], (1.0 - SMOOTHING) * magnitude);
            self.smoothed[k] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 / (MAX_DB - MIN_DB) * (db - MIN_DB);
            *byte = scaled.clamp(0.0, 255.0) as u8;
        }
        bytes
    }

    /// Mean of the frequency bytes (0..=255)
    #[allow(clippy::cast_possible_truncation)]
    pub fn level(&mut self) -> u8 {
        let bytes = self.frequency_bytes();
        let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
        (sum / BIN_COUNT as u32) as u8
    }
}

/// Turns arbitrary device blocks into gained, measured frames
#[derive(Debug)]
pub struct CapturePipeline {
    sample_rate: u32,
    gain: f32,
    pending: Vec<f32>,
    analyser: VolumeAnalyser,
}

impl CapturePipeline {
    /// Create a pipeline for a device running at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            gain: INPUT_GAIN,
            pending: Vec::with_capacity(FRAME_SIZE),
            analyser: VolumeAnalyser::default(),
        }
    }

    /// Accept a block of mono samples; returns every frame it completes
    pub fn push(&mut self, block: &[f32]) -> Vec<CapturedFrame> {
        let mut frames = Vec::new();
        let mut rest = block;

        while !rest.is_empty() {
            let take = (FRAME_SIZE - self.pending.len()).min(rest.len());
            self.pending
                .extend(rest[..take].iter().map(|s| s * self.gain));
            rest = &rest[take..];

            if self.pending.len() == FRAME_SIZE {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(FRAME_SIZE));
                self.analyser.push(&samples);
                frames.push(CapturedFrame {
                    volume: self.analyser.level(),
                    samples,
                    sample_rate: self.sample_rate,
                });
            }
        }

        frames
    }

    /// Device sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Captures audio from the default input device
pub struct Microphone {
    sample_rate: u32,
    stream: Option<Stream>,
}

impl Microphone {
    /// Open the default input device and start delivering frames
    ///
    /// Uses the device's own rate; frames are resampled later by the codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Permission`] if no device is available or access is
    /// refused, [`Error::UnsupportedSampleRate`] below 16kHz
    pub fn open(frames: mpsc::UnboundedSender<CapturedFrame>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| Error::Permission(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        if sample_rate < INPUT_SAMPLE_RATE {
            return Err(Error::UnsupportedSampleRate(sample_rate));
        }

        let channels = usize::from(supported.channels()).max(1);
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();

        let stream = match sample_format {
            SampleFormat::F32 => {
                let mut pipeline = CapturePipeline::new(sample_rate);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono: Vec<f32> = data.iter().step_by(channels).copied().collect();
                        deliver(&mut pipeline, &mono, &frames);
                    },
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut pipeline = CapturePipeline::new(sample_rate);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let mono: Vec<f32> = data
                            .iter()
                            .step_by(channels)
                            .map(|&s| f32::from(s) / 32768.0)
                            .collect();
                        deliver(&mut pipeline, &mono, &frames);
                    },
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                )
            }
            other => {
                return Err(Error::Audio(format!(
                    "unsupported input sample format: {other:?}"
                )));
            }
        }
        .map_err(|e| Error::Permission(e.to_string()))?;

        stream.play().map_err(|e| Error::Permission(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            frame_size = FRAME_SIZE,
            "audio capture started"
        );

        Ok(Self {
            sample_rate,
            stream: Some(stream),
        })
    }
}

/// Push a device block through the pipeline and forward completed frames
fn deliver(
    pipeline: &mut CapturePipeline,
    block: &[f32],
    frames: &mpsc::UnboundedSender<CapturedFrame>,
) {
    for frame in pipeline.push(block) {
        if frames.send(frame).is_err() {
            // Session dropped its receiver; the stream is about to stop
            return;
        }
    }
}

impl InputStream for Microphone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            let paused = stream.pause();
            drop(stream);
            tracing::debug!("audio capture stopped");
            paused.map_err(|e| Error::Audio(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        let _ = InputStream::stop(self);
    }
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in super::codec::float_to_pcm16(samples).chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
