//! # Voice Relay - Main Application Entry Point
//!
//! Sets up the Actix-web server that bridges browser audio sockets to the
//! upstream live-audio service.
//!
//! ## Startup:
//! 1. **Load configuration** from defaults, `config.toml` and environment
//! 2. **Set up logging** (`RUST_LOG`, defaulting to debug for this crate)
//! 3. **Create shared state**: session registry plus upstream connector
//! 4. **Serve** the WebSocket endpoint and the health/admin routes
//! 5. **Shut down gracefully** on SIGINT/SIGTERM: stop every session, give
//!    them the teardown grace period to close, then stop the server

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_relay::config::AppConfig;
use voice_relay::state::AppState;
use voice_relay::upstream::GeminiConnector;
use voice_relay::{handlers, health, middleware, websocket};

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    config.require_api_key()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.upstream.model,
        max_sessions = config.relay.max_concurrent_sessions,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let connector = Arc::new(GeminiConnector::new(&config.upstream));
    let app_state = AppState::new(config.clone(), connector);
    let registry = app_state.registry.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let grace = Duration::from_millis(config.relay.teardown_grace_ms);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{client_id}", web::delete().to(handlers::stop_session)),
            )
            .route("/ws/audio/{client_id}", web::get().to(websocket::audio_websocket))
            .route("/health", web::get().to(health::health_check))
            .route("/", web::get().to(health::index))
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
            info!("Shutdown signal received, stopping sessions...");
            let stopping = registry.stop_all().await;
            if !registry.wait_empty(grace).await {
                warn!(
                    remaining = registry.active_count().await,
                    "Sessions still open after the grace period"
                );
            }
            info!(stopped = stopping, "Sessions stopped, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; defaults to `voice_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C only on non-Unix targets).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
