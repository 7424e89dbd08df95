//! PCM codec for the realtime session
//!
//! Converts between `f32` samples, little-endian PCM16 bytes and the base64
//! text the session carries. Outbound audio is always 16kHz mono.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sample rate the remote session expects for microphone input
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio returned by the remote session
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// MIME tag declared on every outbound packet
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Wire-ready audio unit sent to the remote session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmPacket {
    /// Base64-encoded PCM16 little-endian audio
    pub data: String,
    /// Declared format, e.g. `audio/pcm;rate=16000`
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Decode base64 text into raw bytes
///
/// # Errors
///
/// Returns [`Error::Decode`] if the input is not valid base64
pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Encode raw bytes as base64 text
#[must_use]
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Downsample with a boxcar (block-average) filter
///
/// Returns the input unchanged when `source_rate <= target_rate`; upsampling
/// is not implemented. Each output sample is the mean of the input block
/// `[round(i * ratio), round((i + 1) * ratio))`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn downsample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate <= target_rate || target_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(source_rate) / f64::from(target_rate);
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    let mut block_start = 0usize;
    for i in 0..out_len {
        let block_end = (((i + 1) as f64) * ratio).round() as usize;
        let end = block_end.min(samples.len());

        let value = if block_start < end {
            let block = &samples[block_start..end];
            block.iter().sum::<f32>() / block.len() as f32
        } else {
            0.0
        };

        out.push(value);
        block_start = block_end;
    }

    out
}

/// Convert `f32` samples to PCM16 little-endian bytes
///
/// Samples are clamped to [-1, 1]; negative values scale by 32768 and
/// non-negative values by 32767, truncating toward zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        let value = scaled as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert PCM16 little-endian bytes to per-channel `f32` buffers
///
/// Interleaved samples are assigned to channel `index % channels`. A trailing
/// odd byte is ignored.
#[must_use]
pub fn pcm16_to_float(bytes: &[u8], channels: usize) -> Vec<Vec<f32>> {
    let channels = channels.max(1);
    let frame_count = bytes.len() / 2 / channels;
    let mut out = vec![Vec::with_capacity(frame_count); channels];

    for (index, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[index % channels].push(f32::from(value) / 32768.0);
    }

    out
}

/// Build the wire packet for one captured frame
///
/// # Errors
///
/// Returns [`Error::UnsupportedSampleRate`] when the source runs below
/// [`INPUT_SAMPLE_RATE`]; sending such audio would misreport its rate.
pub fn build_outbound_packet(frame: &[f32], source_rate: u32) -> Result<PcmPacket> {
    if source_rate < INPUT_SAMPLE_RATE {
        return Err(Error::UnsupportedSampleRate(source_rate));
    }

    let resampled = downsample(frame, source_rate, INPUT_SAMPLE_RATE);
    let pcm = float_to_pcm16(&resampled);

    Ok(PcmPacket {
        data: encode_base64(&pcm),
        mime_type: INPUT_MIME_TYPE.to_string(),
    })
}
