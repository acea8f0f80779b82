//! # NMSP Gateway - Main Application Entry Point
//!
//! HTTP server that answers legacy NMSP speech-recognition uploads with
//! transcripts from modern recognition backends.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared state: codec pool, recognition chain, recorder, counters
//! - **nmsp**: the upload frame parser and the response encoder
//! - **audio**: speech codecs and utterance assembly
//! - **recognition**: backend trait, fallback chain and the individual backends
//! - **recording**: rolling diagnostic recordings
//! - **health**: heartbeat, health and metrics endpoints
//! - **middleware**: request logging and per-endpoint counters
//! - **handlers**: the recognition endpoint
//! - **error**: request errors and their HTTP mapping
//!
//! ## Shutdown:
//! SIGINT or SIGTERM stops accepting connections and lets in-flight
//! recognitions finish before the process exits.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod nmsp;
mod recognition;
mod recording;
mod state;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        endpoint = %config.nmsp.endpoint_path,
        codec = %config.audio.codec,
        backends = ?config.recognition.backends,
        recording = config.recording.enabled,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone())?;
    if app_state.gateway.is_empty() {
        warn!("No recognition backend is usable; recognition requests will be rejected");
    } else {
        info!(backends = ?app_state.gateway.backend_names(), "Recognition chain ready");
    }

    let bind_addr = config.bind_address();
    let endpoint_path = config.nmsp.endpoint_path.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let mut server = HttpServer::new(move || {
        let endpoint_path = endpoint_path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .configure(move |cfg| handlers::configure(cfg, &endpoint_path))
    })
    .disable_signals();

    if config.server.workers > 0 {
        server = server.workers(config.server.workers);
    }

    let server = server
        .bind(&bind_addr)
        .with_context(|| format!("failed to bind {}", bind_addr))?
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
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; the default is
/// `nmsp_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nmsp_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise logging")?;

    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM. If a handler cannot be
/// installed, the other one still works; if neither can, this never resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
