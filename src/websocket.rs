//! # Realtime Speech WebSocket
//!
//! Browsers connect to `GET /realtime-speech?language=<code>` and get one
//! relay session bridged to the upstream realtime speech service.
//!
//! ## WebSocket Protocol:
//! - **Client → Relay, binary**: PCM16 little-endian mono audio at 24 kHz,
//!   captured by the browser with echo cancellation, noise suppression and
//!   auto gain enabled
//! - **Client → Relay, JSON**:
//!   - `{"type":"input_audio_buffer.append","audio":"<base64 PCM16>"}`
//!   - `{"type":"language.update","language":"hi"}`
//!   - `{"type":"session.reconnect","language":"ta"}` (language optional)
//! - **Relay → Client, JSON**: `relay.status`, `relay.transcript`, `relay.error`
//! - **Relay → Client, binary**: one WAV clip per synthesized audio chunk, in
//!   playback order
//!
//! ## Actor Model:
//! Each connection is an actix actor. The relay session itself runs on tokio
//! tasks; it talks back to the actor through its address (`do_send`), and
//! the actor feeds microphone audio into the session's capture source.

use crate::audio::capture::{CaptureFeed, ChannelCapture};
use crate::audio::codec;
use crate::audio::playback::{AudioSink, DecodedChunk};
use crate::error::{AppError, RelayError};
use crate::persistence::ConversationStore;
use crate::relay::{
    ConnectionStatus, Conversation, ConversationHandle, Downstream, Language, RealtimeConnector, RelaySettings,
    SessionDeps, TranscriptEvent, UpstreamConnector,
};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages the browser sends as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Base64 alternative to binary audio frames
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    #[serde(rename = "language.update")]
    LanguageUpdate { language: String },

    /// Tear down the current session and start a fresh one
    #[serde(rename = "session.reconnect")]
    Reconnect {
        #[serde(default)]
        language: Option<String>,
    },
}

/// Messages the relay sends as JSON text frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "relay.status")]
    Status {
        status: ConnectionStatus,
        reason: Option<StatusReason>,
    },

    #[serde(rename = "relay.transcript")]
    Transcript {
        #[serde(flatten)]
        event: TranscriptEvent,
    },

    /// The client sent something the relay could not use
    #[serde(rename = "relay.error")]
    Error { code: String, message: String },
}

#[derive(Debug, Serialize)]
pub struct StatusReason {
    pub code: String,
    pub message: String,
}

impl ServerMessage {
    pub fn status(status: ConnectionStatus, reason: Option<&RelayError>) -> Self {
        ServerMessage::Status {
            status,
            reason: reason.map(|r| StatusReason {
                code: r.code().to_string(),
                message: r.to_string(),
            }),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize relay message");
                None
            }
        }
    }
}

/// Message for sending text to the WebSocket client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Message for sending a binary frame (a WAV clip) to the WebSocket client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendBinary(Vec<u8>);

/// Session callbacks routed into the actor's mailbox.
///
/// Once closed, the session that owns it can no longer reach the client;
/// a reconnect gets a fresh one.
struct ActorDownstream {
    addr: Addr<RelaySocket>,
    closed: AtomicBool,
}

impl ActorDownstream {
    fn new(addr: Addr<RelaySocket>) -> Self {
        Self {
            addr,
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.closed.load(Ordering::SeqCst) || !self.addr.connected() {
            return;
        }
        if let Some(json) = message.to_json() {
            self.addr.do_send(SendText(json));
        }
    }
}

impl Downstream for ActorDownstream {
    fn on_message(&self, event: TranscriptEvent) {
        self.send(ServerMessage::Transcript { event });
    }

    fn on_status_change(&self, status: ConnectionStatus, reason: Option<&RelayError>) {
        self.send(ServerMessage::status(status, reason));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Audio sink that forwards each WAV clip to the browser, which plays them
/// back to back.
struct DownstreamSink {
    addr: Addr<RelaySocket>,
}

#[async_trait]
impl AudioSink for DownstreamSink {
    async fn play(&mut self, chunk: &DecodedChunk) -> Result<(), RelayError> {
        if !self.addr.connected() {
            return Err(RelayError::TransportClosed("client socket closed".to_string()));
        }
        self.addr.do_send(SendBinary(chunk.container.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "downstream"
    }
}

/// WebSocket actor for one browser connection.
pub struct RelaySocket {
    state: web::Data<AppState>,
    connector: Arc<dyn UpstreamConnector>,
    store: Arc<dyn ConversationStore>,
    language: Language,
    api_key_present: bool,
    feed: Option<CaptureFeed>,
    conversation: Option<ConversationHandle>,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(
        state: web::Data<AppState>,
        connector: Arc<dyn UpstreamConnector>,
        store: Arc<dyn ConversationStore>,
        language: Language,
        api_key_present: bool,
    ) -> Self {
        Self {
            state,
            connector,
            store,
            language,
            api_key_present,
            feed: None,
            conversation: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Start a relay session, replacing any current one.
    fn connect_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(conversation) = self.conversation.as_ref() else {
            return;
        };
        if let Some(previous) = self.feed.take() {
            previous.close();
        }

        let (capture, feed) = ChannelCapture::new();
        self.feed = Some(feed);

        let deps = SessionDeps {
            connector: Arc::clone(&self.connector),
            capture: Box::new(capture),
            sink: Box::new(DownstreamSink { addr: ctx.address() }),
            downstream: Arc::new(ActorDownstream::new(ctx.address())),
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.state.relay),
        };
        let settings = RelaySettings::from_config(&self.state.get_config());
        conversation.connect(settings, deps, self.language.clone());
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::AudioAppend { audio } => match codec::text_decode(&audio) {
                Ok(pcm) => self.push_audio(&pcm),
                Err(e) => self.send_error(ctx, e.code(), &e.to_string()),
            },
            ClientMessage::LanguageUpdate { language } => {
                self.language = Language::from_code(&language);
                info!(language = %self.language.code, "Client changed language");
                if let Some(conversation) = &self.conversation {
                    conversation.update_language(self.language.clone());
                }
            }
            ClientMessage::Reconnect { language } => {
                if let Some(code) = language {
                    self.language = Language::from_code(&code);
                }
                info!(language = %self.language.code, "Client requested a new session");
                self.connect_session(ctx);
            }
        }
    }

    fn push_audio(&self, pcm: &[u8]) {
        if let Some(feed) = &self.feed {
            if !feed.push_pcm16(pcm) {
                debug!(bytes = pcm.len(), "Audio arrived before capture started, dropped");
            }
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        if let Some(json) = ServerMessage::error(code, message).to_json() {
            ctx.text(json);
        }
        warn!("WebSocket error {}: {}", code, message);
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(language = %self.language.code, "Relay WebSocket connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        if !self.api_key_present {
            let reason = "OPENAI_API_KEY is not set";
            error!("{}", reason);
            self.send_error(ctx, "config_error", reason);
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Error,
                description: Some(reason.to_string()),
            }));
            ctx.stop();
            return;
        }

        let settings = RelaySettings::from_config(&self.state.get_config());
        self.conversation = Some(Conversation::new(settings).spawn());
        self.connect_session(ctx);
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(feed) = self.feed.take() {
            feed.close();
        }
        if let Some(conversation) = self.conversation.take() {
            conversation.disconnect();
        }
        self.state.decrement_active_sessions();
        info!("Relay WebSocket closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_message", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => {
                self.push_audio(&data);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<SendBinary> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: SendBinary, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

/// Query string of the WebSocket route.
#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub language: Option<String>,
}

/// WebSocket route handler.
///
/// ## Checks, in order:
/// 1. The request is a WebSocket upgrade (400 otherwise)
/// 2. A relay slot is free under `performance.max_concurrent_sessions` (503 otherwise)
pub async fn realtime_speech(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<RelayQuery>,
    app_state: web::Data<AppState>,
    store: web::Data<Arc<dyn ConversationStore>>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    if !is_websocket_upgrade(&req) {
        return Err(AppError::BadRequest("Expected WebSocket connection".to_string()).into());
    }

    let config = app_state.get_config();
    if !app_state.try_acquire_session(config.performance.max_concurrent_sessions) {
        warn!(
            limit = config.performance.max_concurrent_sessions,
            "Rejecting relay connection, session limit reached"
        );
        return Err(AppError::ServiceUnavailable("Too many active relay sessions".to_string()).into());
    }

    let language = Language::from_code(
        query
            .language
            .as_deref()
            .unwrap_or(&config.session.default_language),
    );
    let api_key_present = config.upstream.api_key.as_deref().is_some_and(|k| !k.is_empty());
    let connector: Arc<dyn UpstreamConnector> = Arc::new(RealtimeConnector::from_config(&config.upstream));

    let socket = RelaySocket::new(
        app_state.clone(),
        connector,
        Arc::clone(store.get_ref()),
        language,
        api_key_present,
    );

    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        app_state.decrement_active_sessions();
    }
    response
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(actix_web::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Speaker, TranscriptKind};
    use actix_web::test::TestRequest;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"language.update","language":"hi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::LanguageUpdate { ref language } if language == "hi"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"session.reconnect"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Reconnect { language: None }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"input_audio_buffer.append","audio":"AAA="}"#).unwrap();
        assert!(matches!(msg, ClientMessage::AudioAppend { .. }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"start_session"}"#).is_err());
    }

    #[test]
    fn test_status_message_carries_reason_code() {
        let reason = RelayError::DeviceUnavailable("permission denied".to_string());
        let json = serde_json::to_value(ServerMessage::status(ConnectionStatus::Error, Some(&reason))).unwrap();

        assert_eq!(json["type"], "relay.status");
        assert_eq!(json["status"], "error");
        assert_eq!(json["reason"]["code"], "device_unavailable");
        assert!(json["reason"]["message"].as_str().unwrap().contains("permission denied"));

        let json = serde_json::to_value(ServerMessage::status(ConnectionStatus::Listening, None)).unwrap();
        assert_eq!(json["status"], "listening");
        assert!(json["reason"].is_null());
    }

    #[test]
    fn test_transcript_message_is_flat() {
        let event = TranscriptEvent::new(Speaker::User, TranscriptKind::Complete, "I feel dizzy");
        let json = serde_json::to_value(ServerMessage::Transcript { event }).unwrap();

        assert_eq!(json["type"], "relay.transcript");
        assert_eq!(json["speaker"], "user");
        assert_eq!(json["kind"], "complete");
        assert_eq!(json["text"], "I feel dizzy");
    }

    #[test]
    fn test_upgrade_detection() {
        let req = TestRequest::default()
            .insert_header(("upgrade", "WebSocket"))
            .to_http_request();
        assert!(is_websocket_upgrade(&req));

        let req = TestRequest::default().to_http_request();
        assert!(!is_websocket_upgrade(&req));
    }
}
