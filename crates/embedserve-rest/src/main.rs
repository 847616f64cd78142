use std::sync::Arc;

use anyhow::Context;
use embedserve_rest::{build_router, tracing_init, AppState};
use embedserve_service::{Config, EmbeddingService};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (file, then environment overrides, then validation)
    let config = Config::load().context("failed to load configuration")?;

    tracing_init::init(&config.logging)?;

    tracing::info!(
        models = config.models.len(),
        workers = config.batching.worker_count(),
        max_batch_chunks = config.batching.max_batch_chunks,
        max_batch_tokens = config.batching.max_batch_tokens,
        "Starting embedserve"
    );

    // Models load in the background; /ready reports 503 until they settle
    let service = Arc::new(
        EmbeddingService::from_config(&config).context("failed to initialize embedding service")?,
    );
    for model in &config.models {
        tracing::info!(model = %model.name, backend = ?model.backend, "Loading model");
    }

    let app = build_router(AppState::new(service));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("REST server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Waits for SIGINT or SIGTERM; in-flight requests complete before exit.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
