use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tether_core::{Hub, SysinfoSampler, TelemetryProducer};
use tether_server::{cors_layer, router, AppState, ServerConfig, StaticTokenValidator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    // Initialize logging
    let filter = if config.debug {
        "tether=debug,tower_http=debug"
    } else {
        "tether=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    let cors = cors_layer(&config.cors_origins)?;

    let hub = Arc::new(Hub::new(config.hub_config()));
    let validator = Arc::new(StaticTokenValidator::new(config.tokens()));
    let state = AppState::new(hub.clone(), config.shell_config(), validator);

    let shutdown = CancellationToken::new();
    let producer = TelemetryProducer::new(SysinfoSampler::new(), hub, config.telemetry_interval())
        .spawn(shutdown.clone());

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, router(state, cors))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Err(e) = producer.await {
        warn!("Telemetry producer ended abnormally: {}", e);
    }
    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM and cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutting down");
    shutdown.cancel();
}
