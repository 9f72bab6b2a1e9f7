//! WAV container handling for synthesized audio.
//!
//! Each upstream audio delta is bare PCM16. Before playback it is wrapped in
//! a RIFF/WAVE container so it becomes a self-describing clip (the browser
//! plays these directly), then decoded back for native sinks.

use crate::audio::codec::{i16_to_sample, pcm16_to_samples};
use crate::error::RelayError;
use std::io::Cursor;

/// Size of the header `hound` writes for 16-bit PCM with at most two channels.
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;

/// Audio recovered from a WAV container.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        frames * 1000 / self.sample_rate as u64
    }
}

fn pcm_spec(sample_rate: u32, channels: u16) -> hound::WavSpec {
    hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    }
}

fn wav_error(context: &str, e: hound::Error) -> RelayError {
    RelayError::DecodeFailure(format!("{}: {}", context, e))
}

/// Wrap raw PCM16 little-endian bytes in a WAV container.
///
/// Fails with `DecodeFailure` when the payload does not hold a whole
/// number of sample frames.
pub fn wrap_pcm16(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>, RelayError> {
    let frame_bytes = channels as usize * 2;
    if frame_bytes == 0 || pcm.len() % frame_bytes != 0 {
        return Err(RelayError::DecodeFailure(format!(
            "PCM payload of {} bytes is not a multiple of the {}-byte frame size",
            pcm.len(),
            frame_bytes
        )));
    }

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + pcm.len()));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, pcm_spec(sample_rate, channels))
            .map_err(|e| wav_error("cannot start WAV container", e))?;
        for sample in pcm16_to_samples(pcm) {
            writer
                .write_sample(sample)
                .map_err(|e| wav_error("cannot write WAV sample", e))?;
        }
        writer
            .finalize()
            .map_err(|e| wav_error("cannot finalize WAV container", e))?;
    }
    Ok(cursor.into_inner())
}

/// Decode a 16-bit PCM WAV container into normalized samples.
///
/// Fails with `DecodeFailure` when the header is unreadable, the format
/// is not 16-bit integer PCM, or the data chunk is truncated.
pub fn decode(container: &[u8]) -> Result<DecodedAudio, RelayError> {
    let mut reader =
        hound::WavReader::new(Cursor::new(container)).map_err(|e| wav_error("unreadable WAV header", e))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != BITS_PER_SAMPLE {
        return Err(RelayError::DecodeFailure(format!(
            "expected 16-bit PCM, found {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader
        .samples::<i16>()
        .map(|sample| sample.map(i16_to_sample))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| wav_error("unreadable WAV data", e))?;

    Ok(DecodedAudio {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{float_to_pcm16, samples_to_pcm16};

    #[test]
    fn test_header_layout() {
        let pcm = samples_to_pcm16(&[1, -1, 300]);
        let wav = wrap_pcm16(&pcm, 24000, 1).unwrap();

        assert_eq!(wav.len(), WAV_HEADER_LEN + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 36 + 6);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 24000);
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 48000);
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 2);
        assert_eq!(u16::from_le_bytes([wav[34], wav[35]]), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 6);
        assert_eq!(&wav[44..], pcm.as_slice());
    }

    #[test]
    fn test_decode_wrapped_pcm() {
        let frame: Vec<f32> = (0..480).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        let wav = wrap_pcm16(&float_to_pcm16(&frame), 24000, 1).unwrap();

        let decoded = decode(&wav).unwrap();
        assert_eq!(decoded.sample_rate, 24000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples.len(), frame.len());
        assert_eq!(decoded.duration_ms(), 20);
        for (a, b) in frame.iter().zip(decoded.samples.iter()) {
            assert!((a - b).abs() <= 1.0 / 32767.0);
        }
    }

    #[test]
    fn test_empty_payload_decodes_to_silence() {
        let decoded = decode(&wrap_pcm16(&[], 24000, 1).unwrap()).unwrap();
        assert!(decoded.samples.is_empty());
    }

    #[test]
    fn test_odd_payload_is_rejected() {
        let err = wrap_pcm16(&[1, 2, 3], 24000, 1).unwrap_err();
        assert!(matches!(err, RelayError::DecodeFailure(_)));

        let err = wrap_pcm16(&[0; 6], 24000, 2).unwrap_err();
        assert!(matches!(err, RelayError::DecodeFailure(_)));
    }

    #[test]
    fn test_float_container_is_rejected() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 24000,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            };
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0.25f32).unwrap();
            writer.finalize().unwrap();
        }
        let err = decode(&cursor.into_inner()).unwrap_err();
        assert!(matches!(err, RelayError::DecodeFailure(_)));
    }

    #[test]
    fn test_truncated_container_fails_decode() {
        let wav = wrap_pcm16(&[0; 8], 24000, 1).unwrap();
        assert!(decode(&wav[..20]).is_err());
        assert!(decode(&wav[..WAV_HEADER_LEN + 4]).is_err());
    }
}
