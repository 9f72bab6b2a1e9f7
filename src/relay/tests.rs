//! Session scenarios against in-memory fakes of every collaborator.

use super::*;
use crate::audio::capture::{AudioFrame, CaptureConstraints, CaptureSource};
use crate::audio::codec;
use crate::audio::playback::{AudioSink, DecodedChunk};
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::persistence::ConversationStore;
use crate::relay::upstream::UpstreamLink;
use crate::state::RelayStats;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

enum ConnectBehaviour {
    Link(Mutex<Option<(mpsc::Sender<String>, mpsc::Receiver<String>)>>),
    Hang,
}

struct FakeConnector {
    behaviour: ConnectBehaviour,
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(&self) -> Result<UpstreamLink, RelayError> {
        match &self.behaviour {
            ConnectBehaviour::Link(slot) => {
                let (out_tx, in_rx) = slot
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| RelayError::Connect("already used".to_string()))?;
                Ok(UpstreamLink::new(out_tx, in_rx, Vec::new()))
            }
            ConnectBehaviour::Hang => std::future::pending().await,
        }
    }
}

struct FakeCapture {
    frames: usize,
    fail: bool,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    feed: Option<mpsc::Sender<AudioFrame>>,
}

#[async_trait]
impl CaptureSource for FakeCapture {
    async fn start(&mut self, constraints: &CaptureConstraints) -> Result<mpsc::Receiver<AudioFrame>, RelayError> {
        if self.fail {
            return Err(RelayError::DeviceUnavailable("permission denied".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        for sequence in 0..self.frames as u64 {
            tx.try_send(AudioFrame {
                sequence,
                samples: vec![0.25; constraints.frame_size],
            })
            .unwrap();
        }
        self.feed = Some(tx);
        Ok(rx)
    }

    fn stop(&mut self) {
        if self.feed.take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_capturing(&self) -> bool {
        self.feed.is_some()
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Capture whose device never becomes ready. The first `stop()` can be
/// made to block its thread, like a driver stuck releasing the device.
struct StalledCapture {
    stop_delay: Duration,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureSource for StalledCapture {
    async fn start(&mut self, _constraints: &CaptureConstraints) -> Result<mpsc::Receiver<AudioFrame>, RelayError> {
        std::future::pending().await
    }

    fn stop(&mut self) {
        if self.stops.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(self.stop_delay);
        }
    }

    fn is_capturing(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

fn stall_capture(deps: &mut SessionDeps, stop_delay: Duration) -> Arc<AtomicUsize> {
    let stops = Arc::new(AtomicUsize::new(0));
    deps.capture = Box::new(StalledCapture {
        stop_delay,
        stops: Arc::clone(&stops),
    });
    stops
}

struct RecordingSink {
    played: mpsc::UnboundedSender<u64>,
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&mut self, chunk: &DecodedChunk) -> Result<(), RelayError> {
        let _ = self.played.send(chunk.sequence);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[derive(Default)]
struct RecordingDownstream {
    statuses: Mutex<Vec<(ConnectionStatus, Option<&'static str>)>>,
    transcripts: Mutex<Vec<TranscriptEvent>>,
    closed: AtomicBool,
}

impl RecordingDownstream {
    fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    fn last_reason(&self) -> Option<&'static str> {
        self.statuses.lock().unwrap().last().and_then(|(_, r)| *r)
    }
}

impl Downstream for RecordingDownstream {
    fn on_message(&self, event: TranscriptEvent) {
        self.transcripts.lock().unwrap().push(event);
    }

    fn on_status_change(&self, status: ConnectionStatus, reason: Option<&RelayError>) {
        self.statuses.lock().unwrap().push((status, reason.map(|r| r.code())));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingStore {
    turns: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ConversationStore for RecordingStore {
    async fn append_conversation_turn(&self, user: &str, assistant: &str, language: &str) -> anyhow::Result<()> {
        self.turns
            .lock()
            .unwrap()
            .push((user.to_string(), assistant.to_string(), language.to_string()));
        Ok(())
    }
}

struct Harness {
    upstream_tx: Option<mpsc::Sender<String>>,
    upstream_rx: mpsc::Receiver<String>,
    downstream: Arc<RecordingDownstream>,
    store: Arc<RecordingStore>,
    stats: Arc<RelayStats>,
    capture_starts: Arc<AtomicUsize>,
    capture_stops: Arc<AtomicUsize>,
    played: mpsc::UnboundedReceiver<u64>,
}

impl Harness {
    /// Push an event as if upstream sent it.
    async fn push(&self, event: Value) {
        self.upstream_tx
            .as_ref()
            .unwrap()
            .send(event.to_string())
            .await
            .unwrap();
    }

    /// Next message the relay sent upstream.
    async fn sent(&mut self) -> Value {
        let text = timeout(WAIT, self.upstream_rx.recv()).await.unwrap().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn assert_nothing_sent(&mut self) {
        assert!(timeout(QUIET, self.upstream_rx.recv()).await.is_err());
    }

    async fn handshake(&mut self) {
        self.push(json!({"type": "session.created", "session": {}})).await;
        assert_eq!(self.sent().await["type"], "session.update");
        self.push(json!({"type": "session.updated", "session": {}})).await;
    }
}

fn settings() -> RelaySettings {
    RelaySettings::from_config(&AppConfig::default())
}

fn build(frames: usize, fail_capture: bool, connect: Option<ConnectBehaviour>) -> (Harness, SessionDeps) {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let (played_tx, played_rx) = mpsc::unbounded_channel();

    let downstream = Arc::new(RecordingDownstream::default());
    let store = Arc::new(RecordingStore::default());
    let stats = Arc::new(RelayStats::default());
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));

    let behaviour = connect.unwrap_or_else(|| ConnectBehaviour::Link(Mutex::new(Some((out_tx, in_rx)))));
    let deps = SessionDeps {
        connector: Arc::new(FakeConnector { behaviour }),
        capture: Box::new(FakeCapture {
            frames,
            fail: fail_capture,
            starts: Arc::clone(&starts),
            stops: Arc::clone(&stops),
            feed: None,
        }),
        sink: Box::new(RecordingSink { played: played_tx }),
        downstream: downstream.clone(),
        store: store.clone(),
        stats: Arc::clone(&stats),
    };

    let harness = Harness {
        upstream_tx: Some(in_tx),
        upstream_rx: out_rx,
        downstream,
        store,
        stats,
        capture_starts: starts,
        capture_stops: stops,
        played: played_rx,
    };
    (harness, deps)
}

async fn wait_for_status(rx: &mut watch::Receiver<ConnectionStatus>, status: ConnectionStatus) {
    timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("status never became {}", status))
        .unwrap();
}

#[tokio::test]
async fn test_session_created_sends_full_config() {
    let (mut h, deps) = build(0, false, None);
    let session = RelaySession::connect(settings(), deps, Language::from_code("en"));
    assert_eq!(session.status(), ConnectionStatus::Connecting);

    h.push(json!({"type": "session.created", "session": {"id": "sess_1"}})).await;
    let sent = h.sent().await;

    assert_eq!(sent["type"], "session.update");
    assert_eq!(sent["session"]["voice"], "alloy");
    assert_eq!(sent["session"]["turn_detection"]["threshold"], 0.5);
    assert!(sent["session"]["instructions"]
        .as_str()
        .unwrap()
        .contains("Always respond in English."));
    assert_eq!(session.status(), ConnectionStatus::Connecting);
    assert_eq!(h.stats.snapshot().session_configs_sent, 1);
}

#[tokio::test]
async fn test_frames_forwarded_only_after_handshake() {
    let (mut h, deps) = build(3, false, None);
    let session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.push(json!({"type": "session.created"})).await;
    assert_eq!(h.sent().await["type"], "session.update");
    h.assert_nothing_sent().await;
    assert_eq!(h.capture_starts.load(Ordering::SeqCst), 0);

    h.push(json!({"type": "session.updated"})).await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    for _ in 0..3 {
        let sent = h.sent().await;
        assert_eq!(sent["type"], "input_audio_buffer.append");
        let pcm = codec::text_decode(sent["audio"].as_str().unwrap()).unwrap();
        assert_eq!(pcm.len(), 4096 * 2);
    }
    h.assert_nothing_sent().await;
    assert_eq!(h.capture_starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats.snapshot().frames_forwarded, 3);
}

#[tokio::test]
async fn test_error_before_session_updated() {
    let (h, deps) = build(3, false, None);
    let mut session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.push(json!({"type": "session.created"})).await;
    h.push(json!({"type": "error", "error": {"type": "invalid_request_error", "message": "bad voice"}}))
        .await;
    wait_for_status(&mut status, ConnectionStatus::Error).await;

    assert_eq!(
        h.downstream.statuses(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
    );
    assert_eq!(h.downstream.last_reason(), Some("upstream_error"));
    assert_eq!(h.capture_starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.stats.snapshot().upstream_errors, 1);

    session.disconnect().await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_language_hot_swap() {
    let (mut h, deps) = build(0, false, None);
    let session = RelaySession::connect(settings(), deps, Language::from_code("en"));

    session.update_language(Language::from_code("hi")).await;
    h.assert_nothing_sent().await;

    h.push(json!({"type": "session.created"})).await;
    let initial = h.sent().await;
    assert!(initial["session"]["instructions"]
        .as_str()
        .unwrap()
        .contains("Always respond in Hindi."));

    session.update_language(Language::from_code("ta")).await;
    let swapped = h.sent().await;
    assert_eq!(swapped["type"], "session.update");
    assert!(swapped["session"]["instructions"]
        .as_str()
        .unwrap()
        .contains("Always respond in Tamil."));
    assert_eq!(swapped["session"]["voice"], "alloy");
    h.assert_nothing_sent().await;
}

#[tokio::test]
async fn test_full_status_walk_and_playback() {
    let (mut h, deps) = build(0, false, None);
    let session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    let delta = codec::chunked_text_encode(&codec::samples_to_pcm16(&[0, 100, -100, 0]), 30);
    h.push(json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 10})).await;
    h.push(json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 900})).await;
    h.push(json!({"type": "response.audio.delta", "delta": delta})).await;
    h.push(json!({"type": "response.done", "response": {"status": "completed"}})).await;
    h.push(json!({"type": "rate_limits.updated", "rate_limits": []})).await;

    assert_eq!(timeout(WAIT, h.played.recv()).await.unwrap(), Some(1));
    wait_for_status(&mut status, ConnectionStatus::Connected).await;
    tokio::time::sleep(QUIET).await;

    assert_eq!(
        h.downstream.statuses(),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Listening,
            ConnectionStatus::Processing,
            ConnectionStatus::Speaking,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test]
async fn test_bad_audio_delta_does_not_fail_session() {
    let (mut h, deps) = build(0, false, None);
    let session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    h.push(json!({"type": "response.audio.delta", "delta": "%%% not base64 %%%"})).await;
    h.push(json!({"type": "response.audio.delta", "delta": "AQID"})).await; // 3 bytes, odd length
    h.push(json!({"type": "response.audio.delta", "delta": "AAABAA=="})).await;

    assert_eq!(timeout(WAIT, h.played.recv()).await.unwrap(), Some(2));
    assert_eq!(session.status(), ConnectionStatus::Speaking);
    assert_eq!(h.stats.snapshot().decode_failures, 2);
}

#[tokio::test]
async fn test_transcripts_forwarded_and_persisted() {
    let (mut h, deps) = build(0, false, None);
    let session = RelaySession::connect(settings(), deps, Language::from_code("hi"));
    let mut status = session.subscribe();

    h.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    h.push(json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": " I have a cold "}))
        .await;
    h.push(json!({"type": "response.audio_transcript.delta", "delta": "Drink "})).await;
    h.push(json!({"type": "response.audio_transcript.delta", "delta": "ginger tea."})).await;
    h.push(json!({"type": "response.audio_transcript.done", "transcript": "Drink ginger tea."})).await;

    timeout(WAIT, async {
        while h.store.turns.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        h.store.turns.lock().unwrap()[0],
        (
            "I have a cold".to_string(),
            "Drink ginger tea.".to_string(),
            "hi".to_string()
        )
    );

    let transcripts = h.downstream.transcripts.lock().unwrap().clone();
    let shape: Vec<(Speaker, TranscriptKind, &str)> = transcripts
        .iter()
        .map(|t| (t.speaker, t.kind, t.text.as_str()))
        .collect();
    assert_eq!(
        shape,
        vec![
            (Speaker::User, TranscriptKind::Complete, "I have a cold"),
            (Speaker::Assistant, TranscriptKind::Delta, "Drink "),
            (Speaker::Assistant, TranscriptKind::Delta, "ginger tea."),
            (Speaker::Assistant, TranscriptKind::Complete, "Drink ginger tea."),
        ]
    );
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (mut h, deps) = build(0, false, None);
    let mut session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(h.downstream.closed.load(Ordering::SeqCst));
    assert_eq!(h.capture_stops.load(Ordering::SeqCst), 1);
    // Upstream link closed: the relay side of the channel is gone.
    assert_eq!(timeout(WAIT, h.upstream_rx.recv()).await.unwrap(), None);

    let mut idle = Conversation::new(settings());
    idle.disconnect().await;
    idle.disconnect().await;
    assert_eq!(idle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_handshake_timeout_while_connecting() {
    let (h, deps) = build(0, false, Some(ConnectBehaviour::Hang));
    let mut settings = settings();
    settings.handshake_timeout = Duration::from_millis(100);

    let session = RelaySession::connect(settings, deps, Language::default());
    let mut status = session.subscribe();
    wait_for_status(&mut status, ConnectionStatus::Error).await;

    assert_eq!(h.downstream.last_reason(), Some("handshake_timeout"));
}

#[tokio::test]
async fn test_handshake_timeout_without_session_updated() {
    let (mut h, deps) = build(0, false, None);
    let mut settings = settings();
    settings.handshake_timeout = Duration::from_millis(200);

    let session = RelaySession::connect(settings, deps, Language::default());
    let mut status = session.subscribe();
    h.push(json!({"type": "session.created"})).await;
    assert_eq!(h.sent().await["type"], "session.update");

    wait_for_status(&mut status, ConnectionStatus::Error).await;
    assert_eq!(h.downstream.last_reason(), Some("handshake_timeout"));
    assert_eq!(h.capture_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upstream_close_moves_to_disconnected() {
    let (mut h, deps) = build(1, false, None);
    let session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    h.upstream_tx = None;
    wait_for_status(&mut status, ConnectionStatus::Disconnected).await;

    assert_eq!(h.downstream.last_reason(), Some("transport_closed"));
    assert_eq!(h.capture_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_device_unavailable_is_terminal() {
    let (mut h, deps) = build(0, true, None);
    let session = RelaySession::connect(settings(), deps, Language::default());
    let mut status = session.subscribe();

    h.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Error).await;

    assert_eq!(h.downstream.last_reason(), Some("device_unavailable"));
    assert!(!h.downstream.statuses().contains(&ConnectionStatus::Connected));
}

#[tokio::test]
async fn test_reconnect_tears_down_previous_session() {
    let (mut first, first_deps) = build(0, false, None);
    let (mut second, second_deps) = build(0, false, None);
    let mut conversation = Conversation::new(settings());

    conversation.connect(first_deps, Language::default()).await;
    let mut status = conversation.subscribe().unwrap();
    first.handshake().await;
    wait_for_status(&mut status, ConnectionStatus::Connected).await;

    conversation.connect(second_deps, Language::from_code("bn")).await;

    assert!(first.downstream.closed.load(Ordering::SeqCst));
    assert_eq!(first.capture_stops.load(Ordering::SeqCst), 1);
    assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
    assert_eq!(timeout(WAIT, first.upstream_rx.recv()).await.unwrap(), None);
    assert_eq!(conversation.status(), ConnectionStatus::Connecting);

    second.push(json!({"type": "session.created"})).await;
    assert!(second.sent().await["session"]["instructions"]
        .as_str()
        .unwrap()
        .contains("Bengali"));

    conversation.disconnect().await;
    assert_eq!(conversation.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_spawned_conversation_handle() {
    let (mut h, deps) = build(0, false, None);
    let handle = Conversation::new(settings()).spawn();

    handle.connect(settings(), deps, Language::from_code("kn"));
    h.push(json!({"type": "session.created"})).await;
    assert!(h.sent().await["session"]["instructions"]
        .as_str()
        .unwrap()
        .contains("Kannada"));

    handle.shutdown().await;
    assert!(h.downstream.closed.load(Ordering::SeqCst));
    assert_eq!(h.downstream.statuses().last(), Some(&ConnectionStatus::Disconnected));
}

#[tokio::test]
async fn test_handshake_timeout_while_acquiring_device() {
    let (mut h, mut deps) = build(0, false, None);
    stall_capture(&mut deps, Duration::ZERO);
    let mut settings = settings();
    settings.handshake_timeout = Duration::from_millis(300);

    let mut session = RelaySession::connect(settings, deps, Language::default());
    let mut status = session.subscribe();
    h.handshake().await;

    wait_for_status(&mut status, ConnectionStatus::Error).await;
    assert_eq!(h.downstream.last_reason(), Some("handshake_timeout"));
    assert!(!h.downstream.statuses().contains(&ConnectionStatus::Connected));

    session.disconnect().await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(h.downstream.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_disconnect_cancels_device_acquisition() {
    let (mut h, mut deps) = build(0, false, None);
    let stops = stall_capture(&mut deps, Duration::ZERO);

    let mut session = RelaySession::connect(settings(), deps, Language::default());
    h.handshake().await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(session.status(), ConnectionStatus::Connecting);

    timeout(WAIT, session.disconnect())
        .await
        .expect("disconnect must not wait on the device");

    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(h.downstream.closed.load(Ordering::SeqCst));
    assert_eq!(
        h.downstream.statuses(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
    );
    assert!(stops.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_teardown_still_ends_disconnected() {
    let (mut h, mut deps) = build(0, false, None);
    stall_capture(&mut deps, Duration::from_millis(500));
    let mut settings = settings();
    settings.disconnect_timeout = Duration::from_millis(100);

    let mut session = RelaySession::connect(settings, deps, Language::default());
    h.handshake().await;
    tokio::time::sleep(QUIET).await;

    session.disconnect().await;

    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(h.downstream.closed.load(Ordering::SeqCst));
    assert_eq!(h.downstream.statuses().last(), Some(&ConnectionStatus::Disconnected));
}
