//! Upstream socket.
//!
//! The WebSocket is split into a reader pump and a writer pump; the
//! session's dispatcher only ever sees two channels of JSON text.

use crate::config::UpstreamConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// How long `close()` waits for the writer to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// An open upstream connection.
pub struct UpstreamLink {
    outbound: Option<mpsc::Sender<String>>,
    inbound: mpsc::Receiver<String>,
    pumps: Vec<JoinHandle<()>>,
}

impl UpstreamLink {
    pub fn new(outbound: mpsc::Sender<String>, inbound: mpsc::Receiver<String>, pumps: Vec<JoinHandle<()>>) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            pumps,
        }
    }

    pub async fn send(&self, text: String) -> Result<(), RelayError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| RelayError::TransportClosed("upstream already closed".to_string()))?;
        outbound
            .send(text)
            .await
            .map_err(|_| RelayError::TransportClosed("upstream writer stopped".to_string()))
    }

    /// Next inbound message; `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Close the socket. Bounded; whatever has not finished is aborted.
    pub async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();

        for pump in self.pumps.iter_mut() {
            if tokio::time::timeout(CLOSE_GRACE, &mut *pump).await.is_err() {
                pump.abort();
            }
        }
        self.pumps.clear();
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Opens upstream connections. One call per relay session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<UpstreamLink, RelayError>;
}

/// Connector for the realtime speech API.
pub struct RealtimeConnector {
    url: String,
    model: String,
    api_key: Option<String>,
}

impl RealtimeConnector {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(&config.url, &config.model, config.api_key.clone())
    }

    fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, self.model)
    }
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self) -> Result<UpstreamLink, RelayError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayError::Config("OPENAI_API_KEY is not set".to_string()))?;

        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| RelayError::Config(format!("invalid API key: {}", e)))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        info!(model = %self.model, "Connecting to upstream");
        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(error = %e, "Upstream write failed");
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            debug!("Upstream writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary upstream frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Upstream closed the connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Upstream read failed");
                        break;
                    }
                };
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamLink::new(out_tx, in_rx, vec![writer, reader]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let connector = RealtimeConnector::new("wss://example.invalid/v1/realtime", "model", None);
        let err = connector.connect().await.err().unwrap();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn test_endpoint_carries_model() {
        let connector = RealtimeConnector::new("wss://api.openai.com/v1/realtime", "gpt-4o-realtime", None);
        assert_eq!(connector.endpoint(), "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime");

        let connector = RealtimeConnector::new("wss://proxy/realtime?region=in", "m", None);
        assert_eq!(connector.endpoint(), "wss://proxy/realtime?region=in&model=m");
    }

    #[tokio::test]
    async fn test_link_send_after_close_fails() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel(4);
        let mut link = UpstreamLink::new(out_tx, in_rx, Vec::new());

        assert!(link.send("{}".to_string()).await.is_ok());
        link.close().await;
        link.close().await;
        let err = link.send("{}".to_string()).await.unwrap_err();
        assert_eq!(err.code(), "transport_closed");
        assert!(link.recv().await.is_none());
    }
}
