//! # Sample Codec
//!
//! Pure conversions used on both directions of the relay:
//!
//! - **Capture side**: normalized `f32` frames → 16-bit little-endian PCM → base64 text
//! - **Playback side**: base64 text → PCM bytes → normalized `f32` samples
//!
//! ## Scaling:
//! Positive samples scale by 32767 and negative samples by 32768, so both
//! ends of the [-1.0, 1.0] range map onto the full `i16` range. The inverse
//! uses the same two factors, which makes the pair an exact round trip for
//! every representable PCM value.
//!
//! ## Chunked text encoding:
//! Large payloads are base64-encoded in fixed-size pieces. The piece size is
//! kept a multiple of 3 so every piece encodes without `=` padding and the
//! concatenation is a single valid base64 string.

use crate::error::RelayError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};

/// Largest multiple of 3 within 32 KiB.
pub const DEFAULT_ENCODE_CHUNK_BYTES: usize = 0x8000 - 0x8000 % 3;

/// Convert one float sample to a PCM16 value.
///
/// Out-of-range input is clamped and NaN is treated as silence.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`sample_to_i16`].
pub fn i16_to_sample(value: i16) -> f32 {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}

/// Encode a frame of normalized samples as 16-bit little-endian PCM bytes.
pub fn float_to_pcm16(frame: &[f32]) -> Vec<u8> {
    let samples: Vec<i16> = frame.iter().map(|&s| sample_to_i16(s)).collect();
    samples_to_pcm16(&samples)
}

/// Decode 16-bit little-endian PCM bytes into normalized samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    pcm16_to_samples(bytes).into_iter().map(i16_to_sample).collect()
}

/// Read little-endian `i16` samples out of raw bytes.
pub fn pcm16_to_samples(bytes: &[u8]) -> Vec<i16> {
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes[..samples.len() * 2], &mut samples);
    samples
}

/// Write `i16` samples as little-endian bytes.
pub fn samples_to_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Base64-encode `bytes` in pieces of at most `chunk_size` raw bytes.
///
/// `chunk_size` is rounded down to a multiple of 3 (minimum 3) so the
/// output is identical to encoding the whole payload in one call.
pub fn chunked_text_encode(bytes: &[u8], chunk_size: usize) -> String {
    let step = (chunk_size - chunk_size % 3).max(3);
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(step) {
        STANDARD.encode_string(chunk, &mut out);
    }
    out
}

/// Decode standard base64 text back into raw bytes.
pub fn text_decode(text: &str) -> Result<Vec<u8>, RelayError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| RelayError::DecodeFailure(format!("invalid base64 payload: {}", e)))
}

/// Capture-side shortcut: frame → PCM16 → chunked base64.
pub fn encode_frame(frame: &[f32], chunk_size: usize) -> String {
    chunked_text_encode(&float_to_pcm16(frame), chunk_size)
}

/// Largest absolute sample value in a frame (0.0 for an empty frame).
pub fn peak_amplitude(frame: &[f32]) -> f32 {
    frame
        .iter()
        .filter(|s| !s.is_nan())
        .fold(0.0f32, |peak, s| peak.max(s.abs()))
}
