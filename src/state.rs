//! # Application State Management
//!
//! Shared state that every HTTP handler and every relay session can reach.
//!
//! ## What lives here:
//! - **config**: the runtime configuration, updatable through `PUT /api/v1/config`
//! - **metrics**: per-endpoint HTTP metrics plus the number of open relay sockets
//! - **relay**: lock-free counters incremented from inside relay sessions
//!
//! ## Locking Pattern:
//! `Arc<RwLock<T>>` for data that is read often and written rarely (config,
//! HTTP metrics). The relay counters are touched on every audio frame, so
//! they are plain atomics behind an `Arc` instead.
//!
//! A poisoned lock only means another thread panicked mid-update; the data
//! is still usable, so every accessor recovers it with `PoisonError::into_inner`.

use crate::config::AppConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning only bumps the `Arc` reference counts, so
///   every actix worker gets a handle onto the same data
/// - **Instant**: `Copy`, never changes, needs no lock
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP metrics, updated by the middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Counters shared with every relay session
    pub relay: Arc<RelayStats>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Relay WebSockets currently open
    pub active_sessions: u32,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Counters for the realtime relay.
///
/// ## Why atomics:
/// `frames_forwarded` is bumped roughly six times a second per speaking
/// user. Taking the metrics write lock for that would serialize every
/// session behind the HTTP middleware, so each counter is an independent
/// `AtomicU64` with relaxed ordering (the numbers are only ever reported,
/// never used to synchronize anything).
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_started: AtomicU64,
    session_configs_sent: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_suppressed: AtomicU64,
    audio_chunks_played: AtomicU64,
    decode_failures: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`], ready for JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayStatsSnapshot {
    pub sessions_started: u64,
    pub session_configs_sent: u64,
    pub frames_forwarded: u64,
    pub frames_suppressed: u64,
    pub audio_chunks_played: u64,
    pub decode_failures: u64,
    pub upstream_errors: u64,
}

impl RelayStats {
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_config_sent(&self) {
        self.session_configs_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_suppressed(&self) {
        self.frames_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_chunk_played(&self) {
        self.audio_chunks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            session_configs_sent: self.session_configs_sent.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_suppressed: self.frames_suppressed.load(Ordering::Relaxed),
            audio_chunks_played: self.audio_chunks_played.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Create a new AppState with the given configuration.
    ///
    /// ## What this does:
    /// 1. Wraps the config in `Arc<RwLock<>>` for thread-safe sharing
    /// 2. Creates empty HTTP metrics and zeroed relay counters
    /// 3. Records the current time as the server start time
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay: Arc::new(RelayStats::default()),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a relay session that reads
    /// its settings never blocks a concurrent config update.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Running relay sessions keep the settings they were created with; the
    /// new values apply to the next `connect()`.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: "METHOD /path", e.g. "GET /health"
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether the response status was 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a relay slot if the session limit allows it.
    ///
    /// Check and increment happen under one write lock, so two sockets
    /// racing for the last slot cannot both get it.
    pub fn try_acquire_session(&self, limit: u32) -> bool {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if metrics.active_sessions >= limit {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Release a slot taken by [`AppState::try_acquire_session`].
    ///
    /// Guarded against underflow.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn active_sessions(&self) -> u32 {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active_sessions
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloned under a read lock so serialization happens without holding it.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests (0.0 before the first request)
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error Rate = Number of Errors ÷ Total Requests, in [0.0, 1.0]
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
