//! # callbridge - Main Application Entry Point
//!
//! Runs a messaging-platform bot that can join voice calls and bridge their
//! audio. The process holds two platform identities at once:
//!
//! - a **bot** identity that takes chat commands (`/join`, `/play`, ...)
//! - a **user** identity that actually joins calls, since platforms only let
//!   user accounts into voice chats
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **transport**: the platform client, either a sidecar process or the
//!   in-process loopback platform
//! - **identity**: supervises both identities and reconnects them
//! - **call**: the call engine, its state machine and the audio queue
//! - **media**: PCM handling, transcoders, the per-call media pipeline
//! - **commands**: the command vocabulary and the chat dispatcher
//! - **handlers**: HTTP handlers for the control and status endpoints
//! - **websocket**: the media tap on the status endpoint
//!
//! ## Two listeners:
//! - **control** (default 8082): join, leave, play, cancel, capture, status
//! - **status** (default 8081): read-only status, jobs, metrics and the media tap
//!
//! ## Shutdown order:
//! The HTTP servers stop first, then the call engine leaves any active call
//! while the user connection is still up, and only then are the identities
//! disconnected.

mod call;
mod commands;
mod config;
mod error;
mod handlers;
mod health;
mod identity;
mod media;
mod middleware;
mod state;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use call::CallEngine;
use commands::ChatDispatcher;
use config::AppConfig;
use identity::{ConnectionSlots, SessionManager};
use media::{CommandDecoder, PcmFormat};
use state::AppState;

/// How long the engine gets to leave the active call on shutdown.
const ENGINE_STOP_GRACE: Duration = Duration::from_secs(15);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);

    info!("Starting callbridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        control = %format!("{}:{}", config.control.host, config.control.port),
        status = %format!("{}:{}", config.status.host, config.status.port),
        transport = ?config.transport.kind,
        "Configuration loaded"
    );

    // Call engine: sole owner of call state
    let transport = transport::build_transport(&config.transport);
    let slots = ConnectionSlots::default();
    let decoder = Arc::new(CommandDecoder::new(
        config.media.decoder.clone(),
        PcmFormat::from(&config.media),
        config.media.chunk_bytes(),
    ));
    let (engine, engine_handle) = CallEngine::new(config.clone(), slots.clone(), decoder);
    let engine_shutdown = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(engine_shutdown.clone()));

    // Identities: both connect in the background; only a double auth failure is fatal
    let identity_shutdown = CancellationToken::new();
    let dispatcher = ChatDispatcher::new(
        engine_handle.clone(),
        slots.clone(),
        config.control.allowed_senders.clone(),
    );
    let mut sessions = SessionManager::start(
        &config,
        transport,
        slots,
        engine_handle.clone(),
        dispatcher,
        identity_shutdown.clone(),
    );
    if let Err(e) = sessions.wait_for_startup().await {
        error!("{:#}", e);
        engine_shutdown.cancel();
        identity_shutdown.cancel();
        let _ = engine_task.await;
        sessions.join().await;
        return Err(e);
    }

    let app_state = AppState::new(config.clone(), engine_handle);

    let control_addr = format!("{}:{}", config.control.host, config.control.port);
    let control_state = app_state.clone();
    let control_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(control_state.clone()))
            .wrap(cors())
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(web::scope("/api/v1").configure(handlers::control::configure))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&control_addr)
    .with_context(|| format!("Failed to bind control endpoint on {}", control_addr))?
    .run();

    let status_addr = format!("{}:{}", config.status.host, config.status.port);
    let status_state = app_state.clone();
    let status_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(status_state.clone()))
            .wrap(cors())
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/status", web::get().to(handlers::status::status))
                    .route("/jobs", web::get().to(handlers::status::jobs))
                    .route("/config", web::get().to(handlers::status::config))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/ws/media", web::get().to(websocket::media_tap))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&status_addr)
    .with_context(|| format!("Failed to bind status endpoint on {}", status_addr))?
    .run();

    info!("Control endpoint listening on {}", control_addr);
    info!("Status endpoint listening on {}", status_addr);

    let control_handle = control_server.handle();
    let status_handle = status_server.handle();
    let mut control_task = tokio::spawn(control_server);
    let mut status_task = tokio::spawn(status_server);

    tokio::select! {
        result = &mut control_task => log_server_exit("control", result),
        result = &mut status_task => log_server_exit("status", result),
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    control_handle.stop(true).await;
    status_handle.stop(true).await;

    engine_shutdown.cancel();
    match tokio::time::timeout(ENGINE_STOP_GRACE, engine_task).await {
        Ok(Ok(())) => info!("Call engine stopped"),
        Ok(Err(e)) => error!("Call engine task failed: {}", e),
        Err(_) => warn!("Call engine did not stop in time"),
    }

    identity_shutdown.cancel();
    sessions.join().await;

    info!("callbridge stopped");
    Ok(())
}

fn cors() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600)
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `callbridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callbridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialise tracing")?;
    Ok(())
}

fn log_server_exit(name: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => warn!("{} server exited", name),
        Ok(Err(e)) => error!("{} server error: {}", name, e),
        Err(e) => error!("{} server task error: {}", name, e),
    }
}

/// Resolve on SIGINT or SIGTERM. Without a SIGTERM handler only Ctrl+C stops
/// the process.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };
        let terminate = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
