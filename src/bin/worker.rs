use detect_pipeline::{
    config::AppConfig,
    db,
    models::taxonomy::Taxonomy,
    services::{
        detector::CommandDetector,
        messaging::{Messenger, TelegramClient},
        queue::RedisJobQueue,
        results::PgResultStore,
        storage::S3BlobStore,
    },
    telemetry,
    worker::{DetectionWorker, WorkerContext},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const WORKER_DB_CONNECTIONS: u32 = 2;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting detection worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    telemetry::describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, WORKER_DB_CONNECTIONS)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing services");
    let blobs = S3BlobStore::new(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    let queue = RedisJobQueue::new(
        &config.redis_url,
        &config.queue_name,
        config.visibility_timeout(),
    )
    .expect("Failed to initialize job queue");

    let engine = CommandDetector::from_command_line(
        &config.detector_command,
        config.detector_weights.clone(),
        config.detector_data.clone(),
    )
    .expect("Invalid DETECTOR_COMMAND");

    let taxonomy = Taxonomy::load(&config.taxonomy_path)
        .await
        .expect("Failed to load class taxonomy");
    tracing::info!(
        path = %config.taxonomy_path.display(),
        classes = taxonomy.len(),
        "Loaded class taxonomy"
    );

    let messenger = config.telegram_token.as_deref().map(|token| {
        Arc::new(TelegramClient::new(&config.telegram_api_url, token)) as Arc<dyn Messenger>
    });
    if messenger.is_none() {
        tracing::warn!("TELEGRAM_TOKEN not set, results will not be sent to chats");
    }

    let worker = DetectionWorker::new(WorkerContext {
        queue: Arc::new(queue),
        blobs: Arc::new(blobs),
        results: Arc::new(PgResultStore::new(db_pool)),
        engine: Arc::new(engine),
        taxonomy: Arc::new(taxonomy),
        messenger,
        settings: config.worker_settings(),
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received, finishing current job");
        signal.cancel();
    });

    worker.run(shutdown).await;
}
