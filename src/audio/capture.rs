//! # Audio Capture Source
//!
//! Abstraction over "something that produces live microphone frames".
//!
//! ## Contract:
//! - `start()` acquires the input exclusively and returns a channel of
//!   fixed-size [`AudioFrame`]s, or `DeviceUnavailable`
//! - `stop()` is idempotent and releases the input on every path
//!
//! ## Implementations:
//! - [`ChannelCapture`]: frames are pushed by the downstream WebSocket
//!   (the browser owns the real microphone)
//! - `NativeCapture` (feature `native-audio`): a cpal input stream

use crate::audio::codec;
use crate::error::RelayError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capture sample rate expected by the upstream speech service.
pub const CAPTURE_SAMPLE_RATE: u32 = 24_000;

/// Samples per delivered frame.
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Frames buffered between the capture source and the relay before new
/// frames start being dropped.
pub const FRAME_BACKLOG: usize = 64;

/// One capture tick of normalized mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Capture order, starting at 0 for each `start()`
    pub sequence: u64,
    pub samples: Vec<f32>,
}

/// Requested input configuration.
///
/// The processing flags are honoured by backends that can apply them (a
/// browser's `getUserMedia`); native backends log that they are unavailable.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            frame_size: CAPTURE_FRAME_SIZE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Local audio device boundary.
#[async_trait]
pub trait CaptureSource: Send {
    /// Open the input and start delivering frames.
    async fn start(&mut self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<AudioFrame>, RelayError>;

    /// Stop delivering frames and release the input. Safe to call repeatedly.
    fn stop(&mut self);

    fn is_capturing(&self) -> bool;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Cuts an arbitrary stream of samples into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
            next_sequence: 0,
        }
    }

    /// Append samples, returning every frame that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                frames.push(AudioFrame {
                    sequence: self.next_sequence,
                    samples,
                });
                self.next_sequence += 1;
            }
        }

        frames
    }

    /// Samples waiting for the current frame to fill up.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Drops frames that contain nothing but near-silence.
///
/// A threshold of 0 disables suppression.
#[derive(Debug, Clone, Copy)]
pub struct SilenceGate {
    threshold: f32,
}

impl SilenceGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }

    pub fn admits(&self, frame: &[f32]) -> bool {
        self.threshold <= 0.0 || codec::peak_amplitude(frame) >= self.threshold
    }
}

struct FeedState {
    frames: mpsc::Sender<AudioFrame>,
    assembler: FrameAssembler,
}

#[derive(Default)]
struct FeedShared {
    active: Option<FeedState>,
    closed: bool,
}

/// Capture source fed from the outside, one push at a time.
///
/// Used in server mode: the browser captures with its own echo
/// cancellation, noise suppression and gain control and streams PCM16 to
/// the relay, which pushes it through the paired [`CaptureFeed`].
pub struct ChannelCapture {
    shared: Arc<Mutex<FeedShared>>,
}

/// Producer half of a [`ChannelCapture`].
#[derive(Clone)]
pub struct CaptureFeed {
    shared: Arc<Mutex<FeedShared>>,
}

impl ChannelCapture {
    pub fn new() -> (Self, CaptureFeed) {
        let shared = Arc::new(Mutex::new(FeedShared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            CaptureFeed { shared },
        )
    }
}

#[async_trait]
impl CaptureSource for ChannelCapture {
    async fn start(&mut self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<AudioFrame>, RelayError> {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);

        if shared.closed {
            return Err(RelayError::DeviceUnavailable(
                "downstream audio producer has gone away".to_string(),
            ));
        }
        if shared.active.is_some() {
            return Err(RelayError::DeviceUnavailable("capture already running".to_string()));
        }

        let (tx, rx) = mpsc::channel(FRAME_BACKLOG);
        shared.active = Some(FeedState {
            frames: tx,
            assembler: FrameAssembler::new(constraints.frame_size),
        });
        info!(frame_size = constraints.frame_size, "Downstream capture started");
        Ok(rx)
    }

    fn stop(&mut self) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.active.take().is_some() {
            info!("Downstream capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .is_some()
    }

    fn name(&self) -> &str {
        "downstream"
    }
}

impl Drop for ChannelCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureFeed {
    /// Push raw PCM16 little-endian bytes.
    ///
    /// Returns `false` when the samples were dropped because capture is not
    /// running.
    pub fn push_pcm16(&self, bytes: &[u8]) -> bool {
        self.push_samples(&codec::pcm16_to_float(bytes))
    }

    /// Push normalized samples.
    pub fn push_samples(&self, samples: &[f32]) -> bool {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = shared.active.as_mut() else {
            debug!(samples = samples.len(), "Capture not running, dropping samples");
            return false;
        };

        for frame in state.assembler.push(samples) {
            if state.frames.try_send(frame).is_err() {
                debug!("Frame backlog full, dropping frame");
            }
        }
        true
    }

    /// The producer is gone for good; later `start()` calls fail.
    pub fn close(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.closed = true;
        shared.active = None;
    }
}
