//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple HTTP request handlers
//! and transport actors simultaneously.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Every worker thread, socket actor and SSE stream holds the same state
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **Poisoning**: A panic while holding the lock poisons it; the accessors below
//!   recover the inner value instead of propagating the panic
//!
//! ### Explicit services instead of globals
//! The [`SessionOrchestrator`] and the SSE registry live here and are handed to
//! handlers through `web::Data<AppState>`. Both are cheap to clone: they are
//! handles around shared inner state.

use crate::config::AppConfig;
use crate::session::SessionOrchestrator;
use crate::transport::sse::SseRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, read by socket actors for heartbeat timing
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and channel metrics, updated by middleware and transports
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Owner of every live session
    pub orchestrator: SessionOrchestrator,

    /// Open SSE streams by owner
    pub sse: SseRegistry,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and client channels.
///
/// ## Why these metrics matter:
/// - **request_count** / **error_count**: load and reliability
/// - **open_channels**: connected WebSocket and SSE clients right now
/// - **channels_opened**: total client connections since start
/// - **endpoint_metrics**: per-route statistics, keyed by route pattern so
///   session ids do not create one entry per session
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub open_channels: u32,
    pub channels_opened: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single route.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: SessionOrchestrator) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            orchestrator,
            sse: SseRegistry::default(),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against its route.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A WebSocket or SSE client connected.
    pub fn increment_open_channels(&self) {
        let mut metrics = self.metrics_mut();
        metrics.open_channels += 1;
        metrics.channels_opened += 1;
    }

    /// A client channel closed. Never goes below zero.
    pub fn decrement_open_channels(&self) {
        let mut metrics = self.metrics_mut();
        metrics.open_channels = metrics.open_channels.saturating_sub(1);
    }

    /// Snapshot so the lock is not held while serializing a response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
