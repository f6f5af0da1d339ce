use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use detect_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        ingest::IngestionGateway,
        messaging::TelegramClient,
        queue::RedisJobQueue,
        results::PgResultStore,
        storage::S3BlobStore,
    },
    telemetry,
};

const SERVER_DB_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing detect-pipeline server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    telemetry::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, SERVER_DB_CONNECTIONS)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing S3 storage client");
    let blobs = S3BlobStore::new(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    tracing::info!("Connecting to Redis job queue");
    let queue = RedisJobQueue::new(
        &config.redis_url,
        &config.queue_name,
        config.visibility_timeout(),
    )
    .expect("Failed to initialize job queue");

    let telegram_token = config
        .telegram_token
        .clone()
        .expect("TELEGRAM_TOKEN is required by the server");
    let telegram = Arc::new(TelegramClient::new(&config.telegram_api_url, &telegram_token));

    let queue = Arc::new(queue);
    let gateway = IngestionGateway::new(
        Arc::new(blobs),
        queue.clone(),
        telegram.clone(),
        telegram.clone(),
        config.scratch_dir.clone(),
        config.retry_policy(),
    );
    let state = AppState::new(
        gateway,
        Arc::new(PgResultStore::new(db_pool)),
        queue,
        telegram,
        Some(telegram_token),
    );

    let app = routes::router(state, Some(Arc::new(prometheus_handle)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
