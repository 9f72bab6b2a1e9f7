//! # Playback Queue
//!
//! Synthesized audio arrives from upstream as a stream of small PCM16
//! chunks. They must be heard in arrival order, one after another, and a
//! broken chunk must not stall the rest of the reply.
//!
//! ## Pipeline per chunk:
//! 1. Tag with a sequence number on `enqueue()`
//! 2. Wrap in a 44-byte WAV header (see [`crate::audio::wav`])
//! 3. Decode the container back into samples
//! 4. Hand the clip to the [`AudioSink`] and wait until it finishes
//!
//! A single drain task does all of this, so ordering and "no overlap" come
//! from there being exactly one consumer.
//!
//! The queue is unbounded: upstream produces audio faster than real time
//! and the whole reply is buffered. A reply that is never played (the
//! session is torn down) is dropped by `shutdown()`.

use crate::audio::wav::{self, DecodedAudio};
use crate::error::RelayError;
use crate::state::RelayStats;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One chunk ready for a sink: the WAV container and its decoded samples.
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    pub sequence: u64,
    pub container: Vec<u8>,
    pub audio: DecodedAudio,
}

/// Where decoded audio ends up.
///
/// `play` resolves once the chunk has been handed over completely (played
/// to the end for a speaker, written for a socket). Dropping the sink
/// releases the underlying output.
#[async_trait]
pub trait AudioSink: Send {
    async fn play(&mut self, chunk: &DecodedChunk) -> Result<(), RelayError>;

    fn name(&self) -> &str;
}

struct Entry {
    sequence: u64,
    pcm: Vec<u8>,
}

pub struct PlaybackQueue {
    entries: Option<mpsc::UnboundedSender<Entry>>,
    pending: Arc<AtomicUsize>,
    next_sequence: u64,
    drain: Option<JoinHandle<()>>,
}

impl PlaybackQueue {
    /// Spawn the drain task. Must be called inside a tokio runtime.
    pub fn new(sink: Box<dyn AudioSink>, sample_rate: u32, channels: u16, stats: Arc<RelayStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let drain = tokio::spawn(drain_loop(
            rx,
            sink,
            sample_rate,
            channels,
            Arc::clone(&pending),
            stats,
        ));

        Self {
            entries: Some(tx),
            pending,
            next_sequence: 1,
            drain: Some(drain),
        }
    }

    /// Append a raw PCM16 chunk. Returns its sequence number, or `None`
    /// when the queue has been shut down.
    pub fn enqueue(&mut self, pcm: Vec<u8>) -> Option<u64> {
        let entries = self.entries.as_ref()?;
        let sequence = self.next_sequence;

        self.pending.fetch_add(1, Ordering::SeqCst);
        if entries.send(Entry { sequence, pcm }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return None;
        }

        self.next_sequence += 1;
        Some(sequence)
    }

    /// Chunks enqueued but not yet picked up by the drain task.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Drop pending chunks, cancel in-flight playback and release the sink.
    pub fn shutdown(&mut self) {
        self.entries = None;
        if let Some(drain) = self.drain.take() {
            drain.abort();
            debug!(dropped = self.pending(), "Playback queue shut down");
        }
        self.pending.store(0, Ordering::SeqCst);
    }

    /// Stop accepting chunks and wait until everything queued has played.
    pub async fn finish(mut self) {
        self.entries = None;
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drain_loop(
    mut rx: mpsc::UnboundedReceiver<Entry>,
    mut sink: Box<dyn AudioSink>,
    sample_rate: u32,
    channels: u16,
    pending: Arc<AtomicUsize>,
    stats: Arc<RelayStats>,
) {
    while let Some(Entry { sequence, pcm }) = rx.recv().await {
        pending.fetch_sub(1, Ordering::SeqCst);

        let decoded = wav::wrap_pcm16(&pcm, sample_rate, channels)
            .and_then(|container| wav::decode(&container).map(|audio| (container, audio)));
        let (container, audio) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(seq = sequence, error = %e, "Skipping undecodable audio chunk");
                stats.decode_failure();
                continue;
            }
        };

        let chunk = DecodedChunk {
            sequence,
            container,
            audio,
        };
        match sink.play(&chunk).await {
            Ok(()) => {
                debug!(seq = sequence, sink = sink.name(), "Played audio chunk");
                stats.audio_chunk_played();
            }
            Err(e) => {
                warn!(seq = sequence, sink = sink.name(), error = %e, "Audio chunk playback failed");
                stats.decode_failure();
            }
        }
    }
}
