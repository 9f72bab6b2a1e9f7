//! At most one relay session per logical conversation.

use crate::relay::language::Language;
use crate::relay::session::{RelaySession, RelaySettings, SessionDeps};
use crate::relay::status::ConnectionStatus;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owns the current session of one conversation.
///
/// `connect()` fully tears down the previous session (capture stopped,
/// sockets closed, playback released) before starting the next one.
pub struct Conversation {
    settings: RelaySettings,
    active: Option<RelaySession>,
}

impl Conversation {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            active: None,
        }
    }

    pub async fn connect(&mut self, deps: SessionDeps, language: Language) {
        if let Some(mut previous) = self.active.take() {
            info!(session_id = %previous.id(), "Replacing relay session");
            previous.disconnect().await;
        }
        self.active = Some(RelaySession::connect(self.settings.clone(), deps, language));
    }

    pub async fn update_language(&mut self, language: Language) {
        match self.active.as_ref() {
            Some(session) => session.update_language(language).await,
            None => debug!(language = %language.code, "No session to update"),
        }
    }

    /// Idempotent; safe before any `connect()`.
    pub async fn disconnect(&mut self) {
        if let Some(session) = self.active.as_mut() {
            session.disconnect().await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.active
            .as_ref()
            .map(RelaySession::status)
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        self.active.as_ref().map(RelaySession::subscribe)
    }

    /// Replace the settings used by the next `connect()`.
    pub fn set_settings(&mut self, settings: RelaySettings) {
        self.settings = settings;
    }

    /// Run the conversation on its own task, driven by a channel.
    ///
    /// Used from synchronous contexts such as an actix actor, where the
    /// async methods cannot be awaited directly. Commands are applied in
    /// the order they are sent.
    pub fn spawn(self) -> ConversationHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Control>();

        let task = tokio::spawn(async move {
            let mut conversation = self;
            while let Some(control) = rx.recv().await {
                match control {
                    Control::Connect { settings, deps, language } => {
                        conversation.set_settings(settings);
                        conversation.connect(deps, language).await;
                    }
                    Control::UpdateLanguage(language) => conversation.update_language(language).await,
                    Control::Disconnect => conversation.disconnect().await,
                }
            }
            conversation.disconnect().await;
        });

        ConversationHandle { tx, task }
    }
}

enum Control {
    Connect {
        settings: RelaySettings,
        deps: SessionDeps,
        language: Language,
    },
    UpdateLanguage(Language),
    Disconnect,
}

/// Channel front for a spawned [`Conversation`].
pub struct ConversationHandle {
    tx: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl ConversationHandle {
    pub fn connect(&self, settings: RelaySettings, deps: SessionDeps, language: Language) {
        let _ = self.tx.send(Control::Connect { settings, deps, language });
    }

    pub fn update_language(&self, language: Language) {
        let _ = self.tx.send(Control::UpdateLanguage(language));
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(Control::Disconnect);
    }

    /// Disconnect and wait until the conversation task has finished.
    pub async fn shutdown(self) {
        let ConversationHandle { tx, task } = self;
        let _ = tx.send(Control::Disconnect);
        drop(tx);
        let _ = task.await;
    }
}
