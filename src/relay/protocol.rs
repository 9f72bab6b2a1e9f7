//! Upstream realtime wire events.
//!
//! Every message is a JSON object tagged by its `type` field. Only the
//! events the relay acts on are modelled; anything else deserializes to
//! [`ServerEvent::Other`] and is ignored.

use crate::config::{SessionSettings, LANGUAGE_PLACEHOLDER};
use crate::relay::language::Language;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events the relay sends upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

/// Events received from upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorPayload>,
    },

    #[serde(other)]
    Other,
}

/// Upstream error detail. The service sends an object; intermediaries
/// sometimes send a bare string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Detailed {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
    Text(String),
}

impl ErrorPayload {
    pub fn message(&self) -> String {
        match self {
            ErrorPayload::Detailed { message: Some(m), .. } => m.clone(),
            ErrorPayload::Detailed { kind: Some(k), .. } => k.clone(),
            ErrorPayload::Detailed { .. } => "unspecified upstream error".to_string(),
            ErrorPayload::Text(text) => text.clone(),
        }
    }

    pub fn code(&self) -> Option<String> {
        match self {
            ErrorPayload::Detailed { code, kind, .. } => code.clone().or_else(|| kind.clone()),
            ErrorPayload::Text(_) => None,
        }
    }
}

impl ServerEvent {
    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            ServerEvent::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::ResponseDone => "response.done",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Other => "other",
        }
    }
}

/// Full session configuration. Always sent whole, never as a diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub mode: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

const AUDIO_FORMAT: &str = "pcm16";

impl SessionConfig {
    pub fn new(settings: &SessionSettings, language: &Language) -> Self {
        let td = &settings.turn_detection;
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: settings
                .instructions_template
                .replace(LANGUAGE_PLACEHOLDER, &language.name),
            voice: settings.voice.clone(),
            input_audio_format: AUDIO_FORMAT.to_string(),
            output_audio_format: AUDIO_FORMAT.to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: settings.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                mode: td.mode.clone(),
                threshold: td.threshold,
                prefix_padding_ms: td.prefix_padding_ms,
                silence_duration_ms: td.silence_duration_ms,
            },
            temperature: settings.temperature,
            max_response_output_tokens: settings.max_output_tokens,
        }
    }
}
