//! # Realtime Speech Relay - Main Application Entry Point
//!
//! Relays live speech between a local audio endpoint and an upstream
//! realtime speech-to-speech service.
//!
//! ## Run modes (`mode` in config, `APP_MODE` in the environment):
//! - **server** (default): an Actix-web HTTP server. Browsers open
//!   `GET /realtime-speech` as a WebSocket and each socket gets its own
//!   relay session.
//! - **local**: one relay session against this machine's microphone and
//!   speakers (needs the `native-audio` feature).
//!
//! ## Application Architecture:
//! - **audio**: capture sources, PCM16/base64 codec, WAV wrapping, playback queue
//! - **relay**: upstream protocol, session state machine, conversation ownership
//! - **websocket**: the browser-facing WebSocket actor
//! - **persistence**: optional JSON-lines conversation log
//! - **config**, **state**, **health**, **middleware**, **handlers**, **error**: the HTTP service around it

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod local;
mod middleware;
mod persistence;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::{AppConfig, RunMode};
use persistence::ConversationStore;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    // load() validates before returning
    let config = AppConfig::load()?;

    info!("Starting realtime-speech-relay v{}", env!("CARGO_PKG_VERSION"));
    if config.upstream.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; relay sessions will be refused");
    }

    let app_state = AppState::new(config.clone());

    match config.mode {
        RunMode::Local => local::run(config, app_state).await,
        RunMode::Server => run_server(config, app_state).await,
    }
}

async fn run_server(config: AppConfig, app_state: AppState) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let store: Arc<dyn ConversationStore> = persistence::from_config(&config.persistence);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Middleware runs in reverse registration order for requests
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(Arc::clone(&store)))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/realtime-speech", web::get().to(websocket::realtime_speech))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // Graceful stop; open relay sockets are closed by their actors
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`].
///
/// If a unix handler cannot be installed, falls back to Ctrl+C only.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers ({}), using Ctrl+C only", e);
                    wait_for_ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        wait_for_ctrl_c().await;

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C");
}

/// Poll [`SHUTDOWN_SIGNAL`] every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
