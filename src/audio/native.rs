//! Local microphone and speaker backends (feature `native-audio`).
//!
//! cpal streams and rodio output streams are not `Send`, so each backend
//! owns its device on a dedicated OS thread and talks to async code over
//! channels. Dropping the backend signals the thread, which drops the
//! device handle on its way out.

use crate::audio::capture::{AudioFrame, CaptureConstraints, CaptureSource, FrameAssembler, FRAME_BACKLOG};
use crate::audio::playback::{AudioSink, DecodedChunk};
use crate::error::RelayError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Microphone capture through the default cpal input device.
pub struct NativeCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl NativeCapture {
    pub fn new() -> Self {
        Self {
            stop_tx: None,
            thread: None,
        }
    }
}

impl Default for NativeCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for NativeCapture {
    async fn start(&mut self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<AudioFrame>, RelayError> {
        if self.thread.is_some() {
            return Err(RelayError::DeviceUnavailable("capture already running".to_string()));
        }
        if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
            debug!("Input processing flags are not available on native capture, using raw input");
        }

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BACKLOG);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let constraints = constraints.clone();

        let thread = thread::Builder::new()
            .name("native-capture".to_string())
            .spawn(move || {
                let stream = match open_input(&constraints, frames_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(RelayError::DeviceUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Blocks until stop() sends or the sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("Native capture released the input device");
            })
            .map_err(|e| RelayError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e)))?;

        let ready = ready_rx
            .await
            .unwrap_or_else(|_| Err(RelayError::DeviceUnavailable("capture thread exited".to_string())));

        match ready {
            Ok(()) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(thread);
                Ok(frames_rx)
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            join_off_runtime(thread, "capture");
        }
    }

    fn is_capturing(&self) -> bool {
        self.thread.is_some()
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

impl Drop for NativeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a device thread without blocking an async worker: inside a tokio
/// runtime the join moves to the blocking pool.
fn join_off_runtime(thread: JoinHandle<()>, role: &'static str) {
    let join = move || {
        if thread.join().is_err() {
            error!(role, "Native audio thread panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

fn open_input(
    constraints: &CaptureConstraints,
    frames: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, RelayError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| RelayError::DeviceUnavailable("no input device available".to_string()))?;

    let default_config = device
        .default_input_config()
        .map_err(|e| RelayError::DeviceUnavailable(e.to_string()))?;
    let mut config: cpal::StreamConfig = default_config.into();

    let target = constraints.sample_rate;
    let supports_target = device
        .supported_input_configs()
        .map_err(|e| RelayError::DeviceUnavailable(e.to_string()))?
        .any(|c| c.min_sample_rate().0 <= target && c.max_sample_rate().0 >= target);
    if supports_target {
        config.sample_rate = cpal::SampleRate(target);
    } else {
        warn!(
            device_rate = config.sample_rate.0,
            target_rate = target,
            "Input device cannot run at the capture rate, resampling"
        );
    }

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        channels = config.channels,
        sample_rate = config.sample_rate.0,
        "Opening input device"
    );

    let channels = config.channels.max(1) as usize;
    let device_rate = config.sample_rate.0;
    let mut assembler = FrameAssembler::new(constraints.frame_size);
    let mut resampler = LinearResampler::new(device_rate, target);

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels == 1 {
                    data.to_vec()
                } else {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect()
                };
                let samples = resampler.process(&mono);
                for frame in assembler.push(&samples) {
                    if frames.try_send(frame).is_err() {
                        debug!("Capture consumer lagging, dropping frame");
                    }
                }
            },
            |err| error!(error = %err, "Input stream error"),
            None,
        )
        .map_err(|e| RelayError::DeviceUnavailable(e.to_string()))
}

/// Linear interpolation resampler for a continuous stream.
///
/// Keeps the last input sample and the fractional read position between
/// calls, so block boundaries of the device callback do not show up in the
/// output.
struct LinearResampler {
    step: f64,
    position: f64,
    previous: Option<f32>,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            step,
            position: 1.0,
            previous: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Index 0 is the carried sample, index `k >= 1` is `input[k - 1]`.
    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }
        let previous = *self.previous.get_or_insert(input[0]);
        let at = |k: usize| if k == 0 { previous } else { input[k - 1] };

        let len = input.len() as f64;
        let mut output = Vec::with_capacity((len / self.step) as usize + 1);
        while self.position < len {
            let lo = self.position.floor() as usize;
            let frac = (self.position - lo as f64) as f32;
            output.push(at(lo) * (1.0 - frac) + at(lo + 1) * frac);
            self.position += self.step;
        }

        self.position -= len;
        self.previous = input.last().copied();
        output
    }
}

struct PlayJob {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    done: oneshot::Sender<Result<(), RelayError>>,
}

/// Speaker output through rodio on the default output device.
pub struct NativeSink {
    jobs: Option<std_mpsc::Sender<PlayJob>>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NativeSink {
    pub fn new() -> Result<Self, RelayError> {
        let (jobs_tx, jobs_rx) = std_mpsc::channel::<PlayJob>();
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);

        let thread = thread::Builder::new()
            .name("native-playback".to_string())
            .spawn(move || output_thread(jobs_rx, thread_cancel))
            .map_err(|e| RelayError::DeviceUnavailable(format!("failed to spawn playback thread: {}", e)))?;

        Ok(Self {
            jobs: Some(jobs_tx),
            cancel,
            thread: Some(thread),
        })
    }
}

#[async_trait]
impl AudioSink for NativeSink {
    async fn play(&mut self, chunk: &DecodedChunk) -> Result<(), RelayError> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| RelayError::TransportClosed("speaker released".to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        jobs.send(PlayJob {
            samples: chunk.audio.samples.clone(),
            sample_rate: chunk.audio.sample_rate,
            channels: chunk.audio.channels,
            done: done_tx,
        })
        .map_err(|_| RelayError::TransportClosed("playback thread exited".to_string()))?;

        done_rx
            .await
            .map_err(|_| RelayError::TransportClosed("playback thread exited".to_string()))?
    }

    fn name(&self) -> &str {
        "rodio"
    }
}

impl Drop for NativeSink {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.jobs = None;
        if let Some(thread) = self.thread.take() {
            join_off_runtime(thread, "playback");
        }
    }
}

fn output_thread(jobs: std_mpsc::Receiver<PlayJob>, cancel: Arc<AtomicBool>) {
    let output = rodio::OutputStream::try_default();
    let (_stream, handle) = match output {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "No audio output device");
            for job in jobs {
                let _ = job
                    .done
                    .send(Err(RelayError::DeviceUnavailable(format!("no output device: {}", e))));
            }
            return;
        }
    };

    for job in jobs {
        if cancel.load(Ordering::SeqCst) {
            break;
        }

        let sink = match rodio::Sink::try_new(&handle) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = job.done.send(Err(RelayError::DecodeFailure(e.to_string())));
                continue;
            }
        };
        sink.append(rodio::buffer::SamplesBuffer::new(job.channels, job.sample_rate, job.samples));

        while !sink.empty() {
            if cancel.load(Ordering::SeqCst) {
                sink.stop();
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = job.done.send(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_halves_length() {
        let input: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let output = LinearResampler::new(48_000, 24_000).process(&input);
        assert_eq!(output.len(), 240);
        assert!((output[10] - input[20]).abs() < 1e-6);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(LinearResampler::new(24_000, 24_000).process(&input), input);
    }

    #[test]
    fn test_resample_is_continuous_across_callbacks() {
        let input: Vec<f32> = (0..480).map(|i| (i as f32 * 0.01).sin()).collect();
        let whole = LinearResampler::new(48_000, 24_000).process(&input);

        let mut streaming = LinearResampler::new(48_000, 24_000);
        let mut pieces = Vec::new();
        for block in [&input[..7], &input[7..107], &input[107..]] {
            pieces.extend(streaming.process(block));
        }

        assert_eq!(pieces.len(), whole.len());
        for (a, b) in whole.iter().zip(pieces.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_upsampling_interpolates_between_blocks() {
        let mut resampler = LinearResampler::new(16_000, 24_000);
        let first = resampler.process(&[0.0, 0.3]);
        let second = resampler.process(&[0.6, 0.9]);

        let output: Vec<f32> = first.into_iter().chain(second).collect();
        assert_eq!(output.len(), 5);
        for pair in output.windows(2) {
            assert!((pair[1] - pair[0] - 0.2).abs() < 1e-5, "{:?}", output);
        }
    }
}
