//! Main entry point for the circuit gateway

use circuit_gateway::{
    api, backend::http_backend::HttpUpstream, clock::SystemClock, config::Settings, AppState,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration before logging so the configured level applies
    let settings = Settings::load()?;
    init_tracing(&settings);

    info!("Starting circuit gateway");
    info!(
        "Loaded configuration: server={}:{}, services={}",
        settings.server.host,
        settings.server.port,
        settings.services.len()
    );

    let upstream = Arc::new(HttpUpstream::new()?);
    let state = Arc::new(AppState::from_settings(
        settings,
        upstream,
        Arc::new(SystemClock),
    )?);
    let settings = state.settings.clone();

    if settings.health_check.enabled {
        state.health_manager.start_health_checking(&state.shutdown).await;
    }
    let sweeper = state.gateway.limiter().spawn_sweeper(
        Duration::from_secs(settings.rate_limit.cleanup_interval_secs),
        state.shutdown.clone(),
    );

    let app = api::routes::create_router(state.clone());

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tokio::spawn(watch_signals(state.shutdown.clone()));

    let drain_token = state.shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain_token.cancelled().await })
    .into_future();

    let grace = settings.shutdown_grace();
    let shutdown = state.shutdown.clone();
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "Drain period elapsed, dropping in-flight requests");
        }
    }

    state.health_manager.stop_health_checking().await;
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Rate limit sweeper ended abnormally");
        }
    }

    info!("Circuit gateway stopped");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if settings.logging.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight requests");
    shutdown.cancel();
}
