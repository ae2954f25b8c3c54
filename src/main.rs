//! # Live Session Backend - Main Application Entry Point
//!
//! Real-time conversational audio sessions: a client streams microphone audio
//! in, the server relays it to a generative conversational endpoint and
//! streams the spoken reply and transcripts back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & trait objects**: The orchestrator is built from swappable parts
//!   (endpoint, capture, transcript sink) behind `Arc<dyn Trait>`
//!
//! ## Application Architecture:
//! - **audio**: PCM codec, capture relay and paced playback
//! - **endpoint**: the conversational endpoint client (Gemini Live over WebSocket)
//! - **session**: session model, orchestrator and transcript persistence
//! - **transport**: client channels (WebSocket actor, SSE) and the bridge to the orchestrator
//! - **config** / **state** / **error**: configuration, shared state, HTTP errors
//! - **health** / **handlers** / **middleware**: REST surface and request metrics

mod audio;
mod config;
mod endpoint;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod transport;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::capture::RelayCaptureFactory;
use config::AppConfig;
use endpoint::LiveEndpoint;
use session::persistence::{JsonlTranscriptSink, LoggingTranscriptSink, TranscriptSink};
use session::{OrchestratorSettings, SessionOrchestrator};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the session orchestrator** and its background reaper
/// 4. **Configures the HTTP server** with middleware, REST routes and client transports
/// 5. **Handles graceful shutdown**: live sessions are ended before the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.endpoint.api_key.is_empty() {
        warn!("APP_ENDPOINT__API_KEY is not set; endpoint connections will be rejected");
    }

    let orchestrator = build_orchestrator(&config);
    let reaper_shutdown = CancellationToken::new();
    let reaper = orchestrator.spawn_reaper(
        Duration::from_secs(config.session.reaper_interval_secs),
        reaper_shutdown.clone(),
    );

    let app_state = AppState::new(config.clone(), orchestrator.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestMetrics)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::end_session))
                    .route("/live/events", web::get().to(transport::sse::open_stream))
                    .route("/live/messages", web::post().to(transport::sse::post_message)),
            )
            .route("/ws/live", web::get().to(transport::websocket::live_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
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
        _ = shutdown_signal() => {
            info!(live = orchestrator.session_count(), "Shutdown signal received, ending sessions");
            orchestrator.end_all().await;
            server_handle.stop(true).await;
        }
    }

    reaper_shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!("Session reaper did not stop cleanly: {}", e);
    }
    // Sessions started while the server was draining.
    orchestrator.end_all().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Wire the orchestrator to the live endpoint, the relay capture and the
/// configured transcript sink.
fn build_orchestrator(config: &AppConfig) -> SessionOrchestrator {
    let endpoint = Arc::new(LiveEndpoint::new(config.session.event_buffer));
    let persistence: Arc<dyn TranscriptSink> = if config.persistence.transcript_path.trim().is_empty() {
        Arc::new(LoggingTranscriptSink)
    } else {
        info!(path = %config.persistence.transcript_path, "Persisting transcripts to file");
        Arc::new(JsonlTranscriptSink::new(config.persistence.transcript_path.clone()))
    };

    SessionOrchestrator::new(
        OrchestratorSettings::from(config),
        endpoint,
        Arc::new(RelayCaptureFactory),
        persistence,
    )
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_session_backend=trace")
/// - If not set, defaults to "live_session_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_session_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
///
/// Falls back to Ctrl+C alone if the SIGTERM handler cannot be installed.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
