//! # Voice Gateway - Main Application Entry Point
//!
//! Runs two listeners side by side:
//! - **HTTP API** (`server.port`): health, metrics, config, streaming audio
//!   upload and device messaging, served by actix-web.
//! - **Device listener** (`server.ws_port`): one long-lived WebSocket per
//!   talking doll, served by tokio-tungstenite.
//!
//! ## Application Architecture:
//! - **hub**: registry of live device sessions, one per device id
//! - **session**: per-connection state machine and its read/write/keepalive loops
//! - **conversation**: Gemini chat and persisted per-user history
//! - **transcription**: Google Speech-to-Text client
//! - **broker**: in-process topic router between uploads and live sessions
//! - **ingestion**: delivers published transcriptions to the right device
//! - **gateway**: accepts device connections and runs their sessions
//! - **config**, **state**, **health**, **middleware**, **handlers**, **error**:
//!   the HTTP side

mod broker;
mod config;
mod conversation;
mod error;
mod gateway;
mod handlers;
mod health;
mod hub;
mod ingestion;
mod middleware;
mod session;
mod state;
mod transcription;
mod transport;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use broker::Broker;
use config::AppConfig;
use conversation::{ConversationOrchestrator, GeminiClient, JsonFileHistoryStore};
use gateway::DeviceGateway;
use hub::Hub;
use ingestion::IngestionListener;
use session::SessionServices;
use state::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::GoogleSpeechClient;

/// Startup order matters: the broker and hub exist before anything that
/// publishes or registers, and shutdown runs in reverse so devices are told
/// to go away before the broker stops delivering.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: http {}:{}, devices {}:{}",
        config.server.host, config.server.port, config.server.host, config.server.ws_port
    );
    if config.upstream.api_key.is_empty() {
        warn!("No upstream API key configured; LLM and speech requests will be rejected upstream");
    }

    let broker = Arc::new(Broker::new(config.broker.queue_capacity));
    let (hub, hub_task) = Hub::start();

    let upstream = &config.upstream;
    let llm = Arc::new(GeminiClient::new(
        &upstream.api_key,
        &upstream.llm_model,
        &upstream.llm_base_url,
        &upstream.system_prompt,
    ));
    let transcriber = Arc::new(GoogleSpeechClient::new(
        &upstream.api_key,
        &upstream.speech_base_url,
        &upstream.language_code,
        upstream.sample_rate_hertz,
    ));
    let store = Arc::new(JsonFileHistoryStore::new(&config.history.directory));
    let services = SessionServices {
        orchestrator: ConversationOrchestrator::new(llm, store),
        transcriber: transcriber.clone(),
    };

    let app_state = AppState::new(config.clone(), hub.clone(), broker.clone(), transcriber);

    let ingestion_task = IngestionListener::new(broker.clone(), hub.clone())
        .start()
        .context("failed to subscribe ingestion listener")?;

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let ws_addr = format!("{}:{}", config.server.host, config.server.ws_port);
    let ws_listener = TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind device listener on {}", ws_addr))?;
    let gateway_task = tokio::spawn(DeviceGateway::new(app_state.clone(), services).serve(ws_listener, shutdown.clone()));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let http_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/audio/stream", web::post().to(handlers::stream_audio))
                    .route("/devices", web::get().to(handlers::list_devices))
                    .route("/devices/{device_id}/messages", web::post().to(handlers::send_to_device))
                    .route("/broadcast", web::post().to(handlers::broadcast)),
            )
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
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown.cancel();
    hub.shutdown().await;
    if let Err(e) = gateway_task.await {
        error!("Device listener task error: {}", e);
    }
    broker.close();
    if let Err(e) = ingestion_task.await {
        error!("Ingestion task error: {}", e);
    }
    if let Err(e) = hub_task.await {
        error!("Hub task error: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default `voice_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT. Falls back to Ctrl+C alone when the
/// unix handlers cannot be installed.
fn setup_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install unix signal handlers, waiting for Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                info!("Received Ctrl+C");
            }
        }

        shutdown.cancel();
    });
}
