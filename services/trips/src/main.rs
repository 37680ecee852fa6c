use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trips_service::{
    Acknowledger, ArchivePackager, ArchiveUploader, Config, ItemSigner, MetadataStore,
    OsKeyGenerator, ProcessorOptions, SegmentProcessor, TelemetryClient, TripsKafkaConsumer,
    WorkerPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Trips Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Signing identity is required before anything is consumed
    let signer = ItemSigner::from_base64(&config.archive.signer_private_key)
        .context("Failed to load archive signing key")?;
    info!(signer = ?signer, "Archive signer loaded");

    // Initialize components
    let metadata_store = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let telemetry = Arc::new(TelemetryClient::new(&config.elasticsearch));
    let archive = Arc::new(ArchiveUploader::new(&config.archive));

    let processor = Arc::new(SegmentProcessor::new(
        metadata_store.clone(),
        telemetry,
        ArchivePackager::new(signer),
        archive,
        Arc::new(OsKeyGenerator),
        ProcessorOptions::from(&config.consumer),
    ));

    // Create Kafka consumer
    let kafka_consumer = Arc::new(
        TripsKafkaConsumer::new(&config.kafka).context("Failed to initialize Kafka consumer")?,
    );

    let shutdown = CancellationToken::new();
    let (segment_tx, segment_rx) = mpsc::channel(config.consumer.queue_capacity);
    let (vehicle_tx, vehicle_rx) = mpsc::channel(config.consumer.queue_capacity);

    let acknowledger: Arc<dyn Acknowledger> = kafka_consumer.clone();
    let pool = WorkerPool::spawn(
        processor,
        acknowledger,
        segment_rx,
        vehicle_rx,
        config.consumer.worker_count,
        shutdown.clone(),
    );

    // Spawn Kafka consumer task
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = kafka_consumer
            .run(segment_tx, vehicle_tx, consumer_shutdown)
            .await
        {
            error!(error = %e, "Kafka consumer error");
        }
    });

    info!(
        workers = config.consumer.worker_count,
        data_fetch_enabled = config.consumer.data_fetch_enabled,
        upload_enabled = config.consumer.upload_enabled,
        "Trips service started successfully"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down trips service");

    shutdown.cancel();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Kafka consumer task failed");
    }
    pool.shutdown(config.drain_timeout()).await;

    metadata_store.pool().close().await;

    info!("Trips service stopped");

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
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
