use anyhow::{Context, Result};
use collector_service::api::start_api_server;
use collector_service::{
    spawn_background_flusher, AppState, BatchBuffer, Config, Enricher, FirehoseSink, FlushPolicy,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        "Starting Collector Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let sink = Arc::new(
        FirehoseSink::new(&config.firehose)
            .await
            .context("Failed to initialize Firehose sink")?,
    );

    let policy = FlushPolicy::new(config.batch.max_batch_size, config.max_time_window());
    let buffer = Arc::new(BatchBuffer::new(sink, policy));

    info!(
        max_batch_size = policy.max_batch_size,
        max_time_window_secs = policy.max_time_window.as_secs(),
        "Batch buffer ready"
    );

    let flusher_handle = config
        .background_flush_interval()
        .map(|every| spawn_background_flusher(buffer.clone(), every));

    let api_state = AppState {
        buffer: buffer.clone(),
        enricher: Arc::new(Enricher::new()),
    };

    // Serve until a shutdown signal arrives; in-flight requests finish first
    let api_config = config.api.clone();
    if let Err(e) = start_api_server(api_state, &api_config, shutdown_signal()).await {
        error!(error = %e, "API server error");
    }

    info!("Shutting down collector service");

    if let Some(handle) = flusher_handle {
        handle.abort();
    }

    // Best effort: anything still pending after this is lost
    let pending = buffer.pending();
    if pending > 0 {
        match buffer.flush().await {
            Ok(()) => info!(records = pending, "Drained buffer on shutdown"),
            Err(e) => warn!(error = %e, records = buffer.pending(), "Dropping undelivered records on shutdown"),
        }
    }

    info!("Collector service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
