//! # AudioHook Gateway - Main Application Entry Point
//!
//! Bridges telephony carrier WebSockets (AudioHook protocol) to an
//! orchestration service, one pipeline of tasks per phone call.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **error**: `GatewayError` and its HTTP mapping
//! - **state**: shared application state and request metrics
//! - **ingestion**: the per-call pipeline, registry and gateway
//! - **audio**: G.711 codec, comfort noise and recording archival
//! - **websocket**: the carrier WebSocket actor and upgrade guard
//! - **handlers**: endpoint info and the active-call monitor
//! - **health / middleware**: health checks, request logging and metrics

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod ingestion;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use ingestion::gateway::Gateway;
use ingestion::lifecycle::CloseReason;
use ingestion::registry::ConnectionRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers; the main task polls it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. **Configuration** from files and environment, validated
/// 2. **Logging** via tracing
/// 3. **Gateway**: templates, orchestration connector, archive and registry
/// 4. **HTTP server** with middleware and routes
/// 5. **Shutdown**: on SIGTERM/SIGINT every call is closed, then the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting audiohook-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let registry = Arc::new(ConnectionRegistry::new(config.gateway.max_concurrent_calls));
    let gateway = Arc::new(Gateway::from_config(&config, registry.clone())?);

    let app_state = AppState::new(config.clone(), gateway);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let audiohook_path = config.gateway.audiohook_path.clone();
    let info_path = format!("{}/info", audiohook_path.trim_end_matches('/'));
    let monitor_path = config.gateway.monitor_path.clone();

    setup_signal_handlers();

    info!(
        audiohook = %audiohook_path,
        monitor = %monitor_path,
        "Starting HTTP server on {}", bind_addr
    );

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/health", web::get().to(health::health_check))
            .route(&info_path, web::get().to(handlers::audiohook_info))
            .route(&audiohook_path, web::get().to(websocket::audiohook_websocket))
            .route(&monitor_path, web::get().to(handlers::active_calls_websocket))
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
            let closing = registry.close_all(CloseReason::Shutdown);
            info!(calls = closing, "Shutdown signal received, closing calls and stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins when set; otherwise gateway debug and actix info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiohook_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag on the first one.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

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
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
