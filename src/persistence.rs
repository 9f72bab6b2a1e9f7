//! Conversation persistence.
//!
//! The relay hands every finished turn (what the user said, what the
//! assistant answered, in which language) to a [`ConversationStore`].
//! Storage failures are logged by the caller and never end a session.

use crate::config::PersistenceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_conversation_turn(&self, user_text: &str, assistant_text: &str, language_code: &str) -> Result<()>;
}

/// Store used when persistence is not configured.
pub struct NoopStore;

#[async_trait]
impl ConversationStore for NoopStore {
    async fn append_conversation_turn(&self, _user: &str, _assistant: &str, _language: &str) -> Result<()> {
        Ok(())
    }
}

/// One line of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub user_transcript: String,
    pub ai_response: String,
    pub language_code: String,
    pub created_at: DateTime<Utc>,
}

/// Appends one JSON object per turn to a file.
///
/// Appends are serialized through a mutex so concurrent sessions never
/// interleave partial lines.
pub struct JsonlConversationStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn append_conversation_turn(&self, user_text: &str, assistant_text: &str, language_code: &str) -> Result<()> {
        let record = ConversationRecord {
            id: Uuid::new_v4(),
            user_transcript: user_text.to_string(),
            ai_response: assistant_text.to_string(),
            language_code: language_code.to_string(),
            created_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening conversation log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Pick the store described by the configuration.
pub fn from_config(config: &PersistenceConfig) -> Arc<dyn ConversationStore> {
    match config.path.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(path) => {
            info!(path = %path, "Persisting conversation turns");
            Arc::new(JsonlConversationStore::new(path))
        }
        None => Arc::new(NoopStore),
    }
}
