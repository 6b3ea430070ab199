//! # Voice Roleplay Backend - Main Application Entry Point
//!
//! Actix-web server for real-time voice conversations with AI personas.
//! Clients stream microphone audio over `/ws/voice`; the server transcribes
//! it, asks the chat model for an in-character reply and streams the
//! synthesized speech back over the same socket.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and HTTP metrics
//! - **session**: session registry, transcription/synthesis control, keep-alive, reaper
//! - **engines**: transcription, synthesis and chat engine seams
//! - **protocol**: the JSON envelope spoken over the websocket
//! - **websocket**: the actix actor that carries frames to the registry
//! - **handlers / health**: REST endpoints

mod audio;
mod config;
mod engines;
mod error;
mod handlers;
mod health;
mod middleware;
mod persona;
mod protocol;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use engines::{build_chat_model, EngineSet, LocalSynthesizer, LocalTranscriber};
use persona::PersonaStore;
use session::{spawn_reaper, SessionRegistry};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers; polled by [`wait_for_shutdown`].
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-roleplay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let personas = Arc::new(PersonaStore::with_builtin(config.session.default_persona.clone()));
    let engines = EngineSet {
        transcriber: Arc::new(LocalTranscriber),
        synthesizer: Arc::new(LocalSynthesizer::new(Duration::from_millis(
            config.engines.synthesis.chunk_interval_ms,
        ))),
        chat: build_chat_model(&config.engines.chat)?,
    };

    let registry = Arc::new(SessionRegistry::new(
        config.session.clone(),
        config.audio_format(),
        config.engines.synthesis.sample_rate,
        engines,
        personas.clone(),
    ));

    // Background loops live for the whole process.
    let keep_alive_task = registry.keep_alive().clone().spawn(config.session.keep_alive_tick());
    let reaper_task = spawn_reaper(registry.clone());

    let app_state = AppState::new(config.clone(), registry.clone(), personas);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Middleware runs in reverse registration order on the way in.
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/characters", web::get().to(handlers::list_characters))
                    .route("/characters/{id}", web::get().to(handlers::get_character)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    keep_alive_task.abort();
    reaper_task.abort();
    let ended = registry.shutdown().await;
    info!(sessions_ended = ended, "Server stopped gracefully");
    Ok(())
}

/// Structured logging to stdout.
///
/// `RUST_LOG` controls the filter; the default is
/// `voice_roleplay_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_roleplay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
