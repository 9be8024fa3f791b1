use anyhow::{Context, Result};
use codegen_templating::api::{start_api_server, AppState};
use codegen_templating::config::Config;
use codegen_templating::object_store::{ObjectStore, S3ObjectStore};
use codegen_templating::processor::TemplateProcessor;
use codegen_templating::project_registry::{PgProjectRegistry, ProjectRegistry};
use codegen_templating::render::TeraEngine;
use codegen_templating::staging::StagingArea;
use codegen_templating::zip_stream::ZipStreamEncoder;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting CodeGen Templating Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let projects: Arc<dyn ProjectRegistry> = Arc::new(
        PgProjectRegistry::new(&config.database)
            .await
            .context("Failed to initialize project registry")?,
    );

    let objects: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    let staging = StagingArea::new(
        config.staging.root_dir.clone(),
        config.staging.context_file_name.clone(),
    );
    std::fs::create_dir_all(staging.root())
        .with_context(|| format!("Failed to create staging root {}", staging.root().display()))?;

    let encoder = ZipStreamEncoder::new(
        config.staging.chunk_size_bytes,
        config.staging.channel_capacity,
    );

    let engine = Arc::new(TeraEngine::new(config.rendering.output_dir_name.clone()));

    let processor = Arc::new(
        TemplateProcessor::new(projects.clone(), objects.clone(), engine, staging, encoder)
            .with_render_timeout(config.render_timeout())
            .with_context_source(config.rendering.context_source),
    );

    info!(
        staging_root = %config.staging.root_dir.display(),
        context_source = ?config.rendering.context_source,
        render_timeout_secs = config.rendering.timeout_secs,
        "Template processor ready"
    );

    let api_state = AppState {
        processor,
        projects,
        objects,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Templating service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down templating service");

    api_handle.abort();

    info!("Templating service stopped");

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
