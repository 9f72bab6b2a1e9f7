//! # Relay Session
//!
//! One session bridges one downstream consumer to one upstream realtime
//! connection. It is created by [`RelaySession::connect`] and thrown away
//! after [`RelaySession::disconnect`].
//!
//! ## Tasks:
//! - **dispatcher**: owns every piece of session state and `select!`s over
//!   commands, upstream messages, capture frames and the handshake deadline
//! - **upstream pumps**: reader/writer halves of the socket (see `upstream`)
//! - **playback drain**: plays synthesized chunks in order (see `audio::playback`)
//!
//! The dispatcher is the only writer of the status and of the session
//! configuration, so neither needs a lock.
//!
//! ## Lifecycle:
//! ```text
//! connect()          -> connecting, open upstream (bounded by the handshake timeout)
//! session.created    -> send full session config
//! session.updated    -> start capture (first time only) -> connected
//! ...                -> listening / processing / speaking
//! error / timeout    -> release resources -> error, then wait for disconnect()
//! socket closed      -> release resources -> disconnected
//! disconnect()       -> stop capture, close downstream, close upstream,
//!                       release playback -> disconnected
//! ```

use crate::audio::capture::{AudioFrame, CaptureConstraints, CaptureSource, SilenceGate};
use crate::audio::codec;
use crate::audio::playback::{AudioSink, PlaybackQueue};
use crate::config::{AppConfig, SessionSettings};
use crate::error::RelayError;
use crate::persistence::ConversationStore;
use crate::relay::downstream::{Downstream, Speaker, TranscriptEvent, TranscriptKind};
use crate::relay::language::Language;
use crate::relay::protocol::{ClientEvent, ServerEvent, SessionConfig};
use crate::relay::status::{ConnectionStatus, StatusEvent, StatusTracker};
use crate::relay::upstream::{UpstreamConnector, UpstreamLink};
use crate::state::RelayStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Default bound on waiting for the dispatcher to acknowledge a disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_CAPACITY: usize = 32;

/// Everything a session needs from configuration, resolved once at connect.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub session: SessionSettings,
    pub handshake_timeout: Duration,
    /// How long `disconnect()` waits for teardown before aborting the session task
    pub disconnect_timeout: Duration,
    pub capture: CaptureConstraints,
    pub silence_threshold: f32,
    pub encode_chunk_bytes: usize,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            session: config.session.clone(),
            handshake_timeout: Duration::from_secs(config.upstream.connect_timeout_secs),
            disconnect_timeout: DISCONNECT_TIMEOUT,
            capture: CaptureConstraints {
                sample_rate: config.audio.sample_rate,
                frame_size: config.audio.frame_size,
                ..CaptureConstraints::default()
            },
            silence_threshold: config.audio.silence_threshold,
            encode_chunk_bytes: config.audio.encode_chunk_bytes,
        }
    }
}

/// Collaborators for one session. Capture and sink are owned by the
/// session and released with it.
pub struct SessionDeps {
    pub connector: Arc<dyn UpstreamConnector>,
    pub capture: Box<dyn CaptureSource>,
    pub sink: Box<dyn AudioSink>,
    pub downstream: Arc<dyn Downstream>,
    pub store: Arc<dyn ConversationStore>,
    pub stats: Arc<RelayStats>,
}

enum Command {
    UpdateLanguage(Language),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running session.
pub struct RelaySession {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    downstream: Arc<dyn Downstream>,
    disconnect_timeout: Duration,
    task: JoinHandle<()>,
    closed: bool,
}

impl RelaySession {
    /// Start a session. Status is `connecting` when this returns; the
    /// upstream connection is opened by the dispatcher task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(settings: RelaySettings, deps: SessionDeps, language: Language) -> Self {
        let id = Uuid::new_v4();
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let mut status = StatusTracker::new();
        let status_rx = status.subscribe();
        let status_tx = status.publisher();
        let downstream = Arc::clone(&deps.downstream);
        let disconnect_timeout = settings.disconnect_timeout;
        if let Some(next) = status.apply(StatusEvent::Connect, None) {
            deps.downstream.on_status_change(next, None);
        }
        deps.stats.session_started();

        let playback = PlaybackQueue::new(
            deps.sink,
            settings.capture.sample_rate,
            settings.capture.channels,
            Arc::clone(&deps.stats),
        );

        let dispatcher = Dispatcher {
            gate: SilenceGate::new(settings.silence_threshold),
            settings,
            language,
            connector: deps.connector,
            capture: deps.capture,
            downstream: deps.downstream,
            store: deps.store,
            stats: deps.stats,
            status,
            upstream: None,
            frames: None,
            playback: Some(playback),
            session_created: false,
            capture_requested: false,
            capture_started: false,
            handshake_done: false,
            user_turn: String::new(),
            assistant_turn: String::new(),
        };

        info!(session_id = %id, language = %dispatcher.language.code, "Relay session starting");
        let task = tokio::spawn(
            dispatcher
                .run(command_rx)
                .instrument(tracing::info_span!("relay_session", session_id = %id)),
        );

        Self {
            id,
            commands,
            status: status_rx,
            status_tx,
            downstream,
            disconnect_timeout,
            task,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Switch the response language. Resent upstream at once if the
    /// session config has already been sent, otherwise used for the
    /// initial one.
    pub async fn update_language(&self, language: Language) {
        if self.commands.send(Command::UpdateLanguage(language)).await.is_err() {
            debug!(session_id = %self.id, "Language update after session ended");
        }
    }

    /// Tear the session down. Idempotent and never fails; status is
    /// `disconnected` when this returns.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let (ack_tx, ack_rx) = oneshot::channel();
        let commands = &self.commands;
        let teardown = async move { commands.send(Command::Disconnect(ack_tx)).await.is_ok() && ack_rx.await.is_ok() };
        let acknowledged = matches!(tokio::time::timeout(self.disconnect_timeout, teardown).await, Ok(true));
        if !acknowledged {
            self.abort();
        }
    }

    /// Dropping the dispatcher releases capture, playback and the upstream
    /// link through their `Drop` impls; the downstream and status are
    /// finished here.
    fn abort(&mut self) {
        warn!(session_id = %self.id, "Session did not acknowledge disconnect, aborting");
        self.task.abort();
        self.downstream.close();
        if self.status_tx.send_replace(ConnectionStatus::Disconnected) != ConnectionStatus::Disconnected {
            self.downstream.on_status_change(ConnectionStatus::Disconnected, None);
        }
    }
}

/// Why the dispatcher left its main loop.
enum Exit {
    Disconnect(Option<oneshot::Sender<()>>),
    Failed(RelayError),
    Closed(String),
}

impl From<RelayError> for Exit {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::TransportClosed(reason) => Exit::Closed(reason),
            other => Exit::Failed(other),
        }
    }
}

enum Step {
    Command(Option<Command>),
    Upstream(Option<String>),
    Frame(Option<AudioFrame>),
    HandshakeExpired,
}

struct Dispatcher {
    settings: RelaySettings,
    language: Language,
    connector: Arc<dyn UpstreamConnector>,
    capture: Box<dyn CaptureSource>,
    downstream: Arc<dyn Downstream>,
    store: Arc<dyn ConversationStore>,
    stats: Arc<RelayStats>,
    status: StatusTracker,
    upstream: Option<UpstreamLink>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    playback: Option<PlaybackQueue>,
    gate: SilenceGate,
    session_created: bool,
    capture_requested: bool,
    capture_started: bool,
    handshake_done: bool,
    user_turn: String,
    assistant_turn: String,
}

impl Dispatcher {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let deadline = Instant::now() + self.settings.handshake_timeout;

        let exit = match self.open_upstream(&mut commands, deadline).await {
            Ok(()) => self.event_loop(&mut commands, deadline).await,
            Err(exit) => exit,
        };

        match exit {
            Exit::Disconnect(ack) => {
                self.teardown().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Exit::Failed(err) => {
                error!(code = err.code(), error = %err, "Relay session failed");
                self.release().await;
                self.transition(StatusEvent::Failed, Some(err));
                self.park(commands).await;
            }
            Exit::Closed(reason) => {
                info!(reason = %reason, "Upstream transport closed");
                self.release().await;
                self.transition(StatusEvent::TransportClosed, Some(RelayError::TransportClosed(reason)));
                self.park(commands).await;
            }
        }
    }

    /// Connect upstream while still answering commands.
    async fn open_upstream(&mut self, commands: &mut mpsc::Receiver<Command>, deadline: Instant) -> Result<(), Exit> {
        let connector = Arc::clone(&self.connector);
        let connect = tokio::time::timeout_at(deadline, connector.connect());
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(link)) => {
                            debug!("Upstream socket open");
                            self.upstream = Some(link);
                            Ok(())
                        }
                        Ok(Err(e)) => Err(Exit::Failed(e)),
                        Err(_) => Err(Exit::Failed(RelayError::HandshakeTimeout(self.settings.handshake_timeout))),
                    };
                }
                command = commands.recv() => match command {
                    Some(Command::UpdateLanguage(language)) => {
                        debug!(language = %language.code, "Language changed before session creation");
                        self.language = language;
                    }
                    Some(Command::Disconnect(ack)) => return Err(Exit::Disconnect(Some(ack))),
                    None => return Err(Exit::Disconnect(None)),
                },
            }
        }
    }

    async fn event_loop(&mut self, commands: &mut mpsc::Receiver<Command>, deadline: Instant) -> Exit {
        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                message = recv_upstream(&mut self.upstream) => Step::Upstream(message),
                frame = recv_frame(&mut self.frames) => Step::Frame(frame),
                _ = tokio::time::sleep_until(deadline), if !self.handshake_done => Step::HandshakeExpired,
            };

            let outcome = match step {
                Step::Command(Some(Command::UpdateLanguage(language))) => self.update_language(language).await,
                Step::Command(Some(Command::Disconnect(ack))) => return Exit::Disconnect(Some(ack)),
                Step::Command(None) => return Exit::Disconnect(None),
                Step::Upstream(Some(text)) => match self.handle_upstream(&text).await {
                    Ok(()) if self.capture_requested => match self.start_capture(commands, deadline).await {
                        Ok(()) => Ok(()),
                        Err(exit) => return exit,
                    },
                    other => other,
                },
                Step::Upstream(None) => return Exit::Closed("upstream socket closed".to_string()),
                Step::Frame(Some(frame)) => self.forward_frame(frame).await,
                Step::Frame(None) => {
                    debug!("Capture source ended");
                    self.frames = None;
                    Ok(())
                }
                Step::HandshakeExpired => Err(RelayError::HandshakeTimeout(self.settings.handshake_timeout)),
            };

            if let Err(e) = outcome {
                return Exit::from(e);
            }
        }
    }

    /// Acquire the capture device while still answering commands and
    /// honouring the handshake deadline.
    async fn start_capture(&mut self, commands: &mut mpsc::Receiver<Command>, deadline: Instant) -> Result<(), Exit> {
        self.capture_requested = false;
        let constraints = self.settings.capture.clone();
        let mut language = None;

        let started = {
            let start = tokio::time::timeout_at(deadline, self.capture.start(&constraints));
            tokio::pin!(start);

            loop {
                tokio::select! {
                    result = &mut start => break result,
                    command = commands.recv() => match command {
                        Some(Command::UpdateLanguage(next)) => language = Some(next),
                        Some(Command::Disconnect(ack)) => return Err(Exit::Disconnect(Some(ack))),
                        None => return Err(Exit::Disconnect(None)),
                    },
                }
            }
        };

        let frames = match started {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => return Err(Exit::Failed(e)),
            Err(_) => return Err(Exit::Failed(RelayError::HandshakeTimeout(self.settings.handshake_timeout))),
        };
        info!(source = self.capture.name(), "Capture started");
        self.frames = Some(frames);
        self.capture_started = true;
        self.handshake_done = true;
        self.transition(StatusEvent::SessionUpdated, None);

        if let Some(language) = language {
            self.update_language(language).await.map_err(Exit::from)?;
        }
        Ok(())
    }

    async fn handle_upstream(&mut self, text: &str) -> Result<(), RelayError> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Unparseable upstream message");
                return Ok(());
            }
        };
        debug!(event = event.kind(), "Upstream event");

        match event {
            ServerEvent::SessionCreated { .. } => {
                self.session_created = true;
                self.transition(StatusEvent::SessionCreated, None);
                self.send_session_config().await?;
            }
            ServerEvent::SessionUpdated { .. } => {
                if self.capture_started {
                    self.transition(StatusEvent::SessionUpdated, None);
                } else {
                    // The dispatcher loop acquires the device next.
                    self.capture_requested = true;
                }
            }
            ServerEvent::SpeechStarted { .. } => {
                self.transition(StatusEvent::SpeechStarted, None);
            }
            ServerEvent::SpeechStopped { .. } => {
                self.transition(StatusEvent::SpeechStopped, None);
            }
            ServerEvent::AudioDelta { delta } => match codec::text_decode(&delta) {
                Ok(pcm) => {
                    if let Some(playback) = self.playback.as_mut() {
                        if let Some(seq) = playback.enqueue(pcm) {
                            debug!(seq, "Queued audio chunk");
                        }
                    }
                    self.transition(StatusEvent::AudioDelta, None);
                }
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable audio delta");
                    self.stats.decode_failure();
                }
            },
            ServerEvent::AudioTranscriptDelta { delta } => {
                self.assistant_turn.push_str(&delta);
                self.downstream
                    .on_message(TranscriptEvent::new(Speaker::Assistant, TranscriptKind::Delta, delta));
            }
            ServerEvent::AudioTranscriptDone { transcript } => {
                let assistant = if transcript.is_empty() {
                    std::mem::take(&mut self.assistant_turn)
                } else {
                    self.assistant_turn.clear();
                    transcript
                };
                self.downstream.on_message(TranscriptEvent::new(
                    Speaker::Assistant,
                    TranscriptKind::Complete,
                    assistant.clone(),
                ));
                let user = std::mem::take(&mut self.user_turn);
                self.persist_turn(user, assistant);
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                self.user_turn = transcript.trim().to_string();
                self.downstream.on_message(TranscriptEvent::new(
                    Speaker::User,
                    TranscriptKind::Complete,
                    self.user_turn.clone(),
                ));
            }
            ServerEvent::ResponseDone => {
                self.transition(StatusEvent::ResponseDone, None);
            }
            ServerEvent::Error { error } => {
                self.stats.upstream_error();
                let (code, message) = match error {
                    Some(payload) => (payload.code(), payload.message()),
                    None => (None, "unspecified upstream error".to_string()),
                };
                return Err(RelayError::UpstreamProtocol { code, message });
            }
            ServerEvent::Other => {
                debug!("Ignoring unhandled upstream event");
            }
        }

        Ok(())
    }

    async fn update_language(&mut self, language: Language) -> Result<(), RelayError> {
        info!(from = %self.language.code, to = %language.code, "Language changed");
        self.language = language;
        if self.session_created {
            self.send_session_config().await?;
        }
        Ok(())
    }

    async fn send_session_config(&mut self) -> Result<(), RelayError> {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::new(&self.settings.session, &self.language),
        };
        self.send(&event).await?;
        self.stats.session_config_sent();
        info!(language = %self.language.code, "Session config sent");
        Ok(())
    }

    async fn forward_frame(&mut self, frame: AudioFrame) -> Result<(), RelayError> {
        if !self.handshake_done {
            return Ok(());
        }
        if !self.gate.admits(&frame.samples) {
            self.stats.frame_suppressed();
            return Ok(());
        }

        let audio = codec::encode_frame(&frame.samples, self.settings.encode_chunk_bytes);
        self.send(&ClientEvent::InputAudioBufferAppend { audio }).await?;
        self.stats.frame_forwarded();
        Ok(())
    }

    // `&mut self` keeps the future `Send` without requiring the boxed
    // capture source to be `Sync`.
    async fn send(&mut self, event: &ClientEvent) -> Result<(), RelayError> {
        let text = serde_json::to_string(event)
            .map_err(|e| RelayError::UpstreamProtocol { code: None, message: e.to_string() })?;
        match self.upstream.as_ref() {
            Some(link) => link.send(text).await,
            None => Err(RelayError::TransportClosed("upstream not connected".to_string())),
        }
    }

    fn persist_turn(&self, user: String, assistant: String) {
        if assistant.trim().is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let language = self.language.code.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_conversation_turn(&user, &assistant, &language).await {
                warn!(error = %e, "Failed to persist conversation turn");
            }
        });
    }

    fn transition(&mut self, event: StatusEvent, reason: Option<RelayError>) {
        if let Some(next) = self.status.apply(event, reason) {
            self.downstream.on_status_change(next, self.status.reason());
        }
    }

    /// Release capture, upstream and playback. Best-effort, idempotent.
    async fn release(&mut self) {
        self.capture.stop();
        self.frames = None;
        if let Some(mut link) = self.upstream.take() {
            link.close().await;
        }
        if let Some(mut playback) = self.playback.take() {
            playback.shutdown();
        }
    }

    async fn teardown(&mut self) {
        self.capture.stop();
        self.frames = None;
        self.downstream.close();
        self.release().await;
        self.transition(StatusEvent::Disconnect, None);
        info!("Relay session closed");
    }

    /// After a terminal failure only `disconnect()` does anything.
    async fn park(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::UpdateLanguage(language) => self.language = language,
                Command::Disconnect(ack) => {
                    self.teardown().await;
                    let _ = ack.send(());
                    return;
                }
            }
        }
        self.teardown().await;
    }
}

async fn recv_upstream(link: &mut Option<UpstreamLink>) -> Option<String> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_frame(frames: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match frames {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}
