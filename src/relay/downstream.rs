//! The relay's view of whoever consumes transcripts and status.

use crate::error::RelayError;
use crate::relay::status::ConnectionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Delta,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    pub kind: TranscriptKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn new(speaker: Speaker, kind: TranscriptKind, text: impl Into<String>) -> Self {
        Self {
            speaker,
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Callback contract towards the UI side.
///
/// Called from the session's dispatcher task, so implementations must not
/// block. Calls made after `close()` are ignored by implementations.
pub trait Downstream: Send + Sync {
    fn on_message(&self, event: TranscriptEvent);

    fn on_status_change(&self, status: ConnectionStatus, reason: Option<&RelayError>);

    fn close(&self);
}

/// Downstream that only writes to the log (local mode).
#[cfg(feature = "native-audio")]
pub struct LogDownstream;

#[cfg(feature = "native-audio")]
impl Downstream for LogDownstream {
    fn on_message(&self, event: TranscriptEvent) {
        if event.kind == TranscriptKind::Complete {
            tracing::info!(speaker = ?event.speaker, "{}", event.text);
        }
    }

    fn on_status_change(&self, status: ConnectionStatus, reason: Option<&RelayError>) {
        match reason {
            Some(reason) => tracing::info!(%status, code = reason.code(), %reason, "Session status"),
            None => tracing::info!(%status, "Session status"),
        }
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_event_json() {
        let event = TranscriptEvent::new(Speaker::Assistant, TranscriptKind::Delta, "Drink");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["speaker"], "assistant");
        assert_eq!(value["kind"], "delta");
        assert_eq!(value["text"], "Drink");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
