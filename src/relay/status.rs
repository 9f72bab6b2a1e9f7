//! Connection state machine.
//!
//! One status per relay session, written by the session's dispatcher task
//! (and by the session handle only if that task had to be aborted), observed through a `watch` channel and the downstream callback.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Error,
}

/// Everything that can move the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Connect,
    SessionCreated,
    SessionUpdated,
    SpeechStarted,
    SpeechStopped,
    AudioDelta,
    ResponseDone,
    Failed,
    TransportClosed,
    Disconnect,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Listening => "listening",
            ConnectionStatus::Processing => "processing",
            ConnectionStatus::Speaking => "speaking",
            ConnectionStatus::Error => "error",
        }
    }

    /// Handshake finished and the session has not ended.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected
                | ConnectionStatus::Listening
                | ConnectionStatus::Processing
                | ConnectionStatus::Speaking
        )
    }

    /// Next status for `event`, or `None` when the event is not valid here.
    pub fn on(self, event: StatusEvent) -> Option<ConnectionStatus> {
        use ConnectionStatus::*;

        match (self, event) {
            (Disconnected | Error, StatusEvent::Connect) => Some(Connecting),
            (Connecting, StatusEvent::SessionCreated) => Some(Connecting),
            (Connecting, StatusEvent::SessionUpdated) => Some(Connected),
            (s, StatusEvent::SessionUpdated) if s.is_active() => Some(Connected),
            (s, StatusEvent::SpeechStarted) if s.is_active() => Some(Listening),
            (s, StatusEvent::SpeechStopped) if s.is_active() => Some(Processing),
            (s, StatusEvent::AudioDelta) if s.is_active() => Some(Speaking),
            (s, StatusEvent::ResponseDone) if s.is_active() => Some(Connected),
            (Disconnected | Error, StatusEvent::Failed) => None,
            (_, StatusEvent::Failed) => Some(Error),
            (Disconnected, StatusEvent::TransportClosed) => None,
            (_, StatusEvent::TransportClosed) => Some(Disconnected),
            (_, StatusEvent::Disconnect) => Some(Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-writer holder of a session's status.
pub struct StatusTracker {
    tx: Arc<watch::Sender<ConnectionStatus>>,
    reason: Option<RelayError>,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            tx: Arc::new(tx),
            reason: None,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// Reason attached to the latest `error`/`disconnected` transition.
    pub fn reason(&self) -> Option<&RelayError> {
        self.reason.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Second writer for the same channel, used only once the tracker's
    /// owner has been aborted and can no longer publish.
    pub fn publisher(&self) -> Arc<watch::Sender<ConnectionStatus>> {
        Arc::clone(&self.tx)
    }

    /// Apply `event`. Returns the new status only when it differs from the
    /// old one; rejected and no-op events return `None`.
    pub fn apply(&mut self, event: StatusEvent, reason: Option<RelayError>) -> Option<ConnectionStatus> {
        let current = self.current();
        let Some(next) = current.on(event) else {
            debug!(status = %current, ?event, "Ignoring status event");
            return None;
        };
        if next == current {
            return None;
        }

        self.reason = reason;
        self.tx.send_replace(next);
        info!(from = %current, to = %next, "Status changed");
        Some(next)
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    fn walk(events: &[StatusEvent]) -> ConnectionStatus {
        events.iter().fold(Disconnected, |status, &event| {
            status.on(event).unwrap_or_else(|| panic!("{:?} rejected in {:?}", event, status))
        })
    }

    #[test]
    fn test_every_state_reachable_from_disconnected() {
        use StatusEvent::*;

        assert_eq!(walk(&[Connect]), Connecting);
        assert_eq!(walk(&[Connect, SessionCreated]), Connecting);
        assert_eq!(walk(&[Connect, SessionCreated, SessionUpdated]), Connected);
        assert_eq!(walk(&[Connect, SessionUpdated, SpeechStarted]), Listening);
        assert_eq!(walk(&[Connect, SessionUpdated, SpeechStarted, SpeechStopped]), Processing);
        assert_eq!(
            walk(&[Connect, SessionUpdated, SpeechStarted, SpeechStopped, AudioDelta]),
            Speaking
        );
        assert_eq!(walk(&[Connect, SessionUpdated, AudioDelta, ResponseDone]), Connected);
        assert_eq!(walk(&[Connect, Failed]), Error);
        assert_eq!(walk(&[Connect, SessionUpdated, AudioDelta, Failed]), Error);
        assert_eq!(walk(&[Connect, SessionUpdated, TransportClosed]), Disconnected);
        assert_eq!(walk(&[Connect, Failed, Connect]), Connecting);
        assert_eq!(walk(&[Connect, SessionUpdated, SpeechStarted, Disconnect]), Disconnected);
    }

    #[test]
    fn test_unmodeled_events_rejected() {
        assert_eq!(Disconnected.on(StatusEvent::SessionCreated), None);
        assert_eq!(Disconnected.on(StatusEvent::AudioDelta), None);
        assert_eq!(Disconnected.on(StatusEvent::TransportClosed), None);
        assert_eq!(Connecting.on(StatusEvent::SpeechStarted), None);
        assert_eq!(Connecting.on(StatusEvent::Connect), None);
        assert_eq!(Connected.on(StatusEvent::SessionCreated), None);
        assert_eq!(Error.on(StatusEvent::SessionUpdated), None);
        assert_eq!(Error.on(StatusEvent::Failed), None);
        assert_eq!(Speaking.on(StatusEvent::Connect), None);
    }

    #[test]
    fn test_disconnect_is_always_accepted() {
        for status in [Disconnected, Connecting, Connected, Listening, Processing, Speaking, Error] {
            assert_eq!(status.on(StatusEvent::Disconnect), Some(Disconnected));
        }
    }

    #[test]
    fn test_tracker_publishes_only_changes() {
        let mut tracker = StatusTracker::new();
        let rx = tracker.subscribe();

        assert_eq!(tracker.apply(StatusEvent::Connect, None), Some(Connecting));
        assert_eq!(tracker.apply(StatusEvent::SessionCreated, None), None);
        assert_eq!(tracker.apply(StatusEvent::AudioDelta, None), None);
        assert_eq!(*rx.borrow(), Connecting);

        let reason = RelayError::HandshakeTimeout(std::time::Duration::from_secs(10));
        assert_eq!(tracker.apply(StatusEvent::Failed, Some(reason.clone())), Some(Error));
        assert_eq!(tracker.reason(), Some(&reason));
        assert_eq!(*rx.borrow(), Error);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Speaking).unwrap(), "\"speaking\"");
        assert_eq!(Processing.to_string(), "processing");
    }
}
