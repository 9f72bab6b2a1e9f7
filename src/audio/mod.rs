//! # Audio Pipeline
//!
//! Everything that touches samples, on both sides of the relay.
//!
//! ## Key Components:
//! - **codec**: float ⇄ PCM16 conversion and chunked base64 framing
//! - **wav**: 44-byte WAV container wrap/decode for playback chunks
//! - **capture**: the `CaptureSource` boundary and the WebSocket-fed source
//! - **playback**: the ordered `PlaybackQueue` and the `AudioSink` boundary
//! - **native**: cpal/rodio backends for local mode (feature `native-audio`)
//!
//! ## Audio Format:
//! - **Sample Rate**: 24 kHz
//! - **Bit Depth**: 16-bit PCM, little-endian signed
//! - **Channels**: Mono

pub mod capture;
pub mod codec;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod playback;
pub mod wav;
