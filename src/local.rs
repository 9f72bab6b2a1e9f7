//! Local mode: one relay session between this machine's microphone and
//! speakers and the upstream service. Transcripts go to the log.

use crate::config::AppConfig;
use crate::state::AppState;
use anyhow::Result;

#[cfg(feature = "native-audio")]
pub async fn run(config: AppConfig, state: AppState) -> Result<()> {
    use crate::audio::native::{NativeCapture, NativeSink};
    use crate::persistence;
    use crate::relay::{ConnectionStatus, Language, LogDownstream, RealtimeConnector, RelaySession, RelaySettings, SessionDeps};
    use std::sync::Arc;
    use tracing::{info, warn};

    if config.upstream.api_key.is_none() {
        anyhow::bail!("OPENAI_API_KEY is not set");
    }

    let sink = NativeSink::new().map_err(|e| anyhow::anyhow!("Cannot open audio output: {}", e))?;
    let deps = SessionDeps {
        connector: Arc::new(RealtimeConnector::from_config(&config.upstream)),
        capture: Box::new(NativeCapture::new()),
        sink: Box::new(sink),
        downstream: Arc::new(LogDownstream),
        store: persistence::from_config(&config.persistence),
        stats: Arc::clone(&state.relay),
    };

    let language = Language::from_code(&config.session.default_language);
    info!(language = %language.code, "Starting local relay session, press Ctrl+C to stop");

    let mut session = RelaySession::connect(RelaySettings::from_config(&config), deps, language);
    let mut status = session.subscribe();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing session");
        }
        ended = status.wait_for(|s| matches!(s, ConnectionStatus::Error | ConnectionStatus::Disconnected)) => {
            match ended {
                Ok(s) if *s == ConnectionStatus::Error => warn!("Session failed"),
                _ => info!("Session ended"),
            }
        }
    }

    session.disconnect().await;
    info!(stats = ?state.relay.snapshot(), "Local session closed");
    Ok(())
}

#[cfg(not(feature = "native-audio"))]
pub async fn run(_config: AppConfig, _state: AppState) -> Result<()> {
    anyhow::bail!("Local mode needs the `native-audio` feature; rebuild with `--features native-audio`")
}
